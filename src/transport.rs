//! Transport construction seam.
//!
//! A [`TransportContext`] turns ready, connected descriptors into
//! [`Transport`]s. A TLS-capable context performs its handshake inside
//! [`TransportContext::new_transport`] and returns `None` on failure; the
//! session core does not distinguish handshake failure from any other
//! construction failure. The raw implementations here carry no TLS and no
//! certificates.

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::trigger::ShutdownTrigger;

/// Encoding requested for certificate material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateFormat {
    Pem,
    Der,
}

/// An opaque bidirectional byte stream bound to a descriptor. All blocking
/// transfers are interruptible by a [`ShutdownTrigger`].
pub trait Transport: Send + Sync {
    fn interruptable_write_fully(&self, trigger: &ShutdownTrigger, buf: &[u8]) -> Result<()>;
    fn interruptable_read_fully(&self, trigger: &ShutdownTrigger, buf: &mut [u8]) -> Result<()>;

    /// The peer's certificate in the requested format; empty for transports
    /// without one.
    fn peer_certificate(&self, format: CertificateFormat) -> Vec<u8>;
}

/// Factory for [`Transport`]s over ready descriptors.
pub trait TransportContext: Send + Sync {
    /// Wrap a connected descriptor. `None` means construction (including any
    /// handshake) failed.
    fn new_transport(
        &self,
        fd: OwnedFd,
        trigger: Arc<ShutdownTrigger>,
    ) -> Option<Box<dyn Transport>>;

    /// This side's own certificate; empty for contexts without one.
    fn certificate(&self, format: CertificateFormat) -> Vec<u8>;

    /// Pin a trusted peer certificate. Contexts without certificate support
    /// reject this with [`Error::InvalidOperation`].
    fn add_trusted_peer_certificate(&self, format: CertificateFormat, cert: &[u8]) -> Result<()>;
}

/// Produces per-session client contexts.
pub trait TransportContextFactory {
    fn new_client_ctx(&self) -> Option<Box<dyn TransportContext>>;
}

/// Plain descriptor-backed transport, no TLS.
pub struct RawTransport {
    fd: OwnedFd,
}

impl RawTransport {
    pub fn new(fd: OwnedFd) -> Self {
        RawTransport { fd }
    }
}

impl Transport for RawTransport {
    fn interruptable_write_fully(&self, trigger: &ShutdownTrigger, buf: &[u8]) -> Result<()> {
        trigger.interruptable_write_fully(self.fd.as_fd(), buf)
    }

    fn interruptable_read_fully(&self, trigger: &ShutdownTrigger, buf: &mut [u8]) -> Result<()> {
        trigger.interruptable_read_fully(self.fd.as_fd(), buf)
    }

    fn peer_certificate(&self, _format: CertificateFormat) -> Vec<u8> {
        Vec::new()
    }
}

/// Context producing [`RawTransport`]s.
pub struct RawTransportContext;

impl TransportContext for RawTransportContext {
    fn new_transport(
        &self,
        fd: OwnedFd,
        _trigger: Arc<ShutdownTrigger>,
    ) -> Option<Box<dyn Transport>> {
        Some(Box::new(RawTransport::new(fd)))
    }

    fn certificate(&self, _format: CertificateFormat) -> Vec<u8> {
        Vec::new()
    }

    fn add_trusted_peer_certificate(
        &self,
        _format: CertificateFormat,
        _cert: &[u8],
    ) -> Result<()> {
        Err(Error::InvalidOperation)
    }
}

pub struct RawTransportContextFactory;

impl TransportContextFactory for RawTransportContextFactory {
    fn new_client_ctx(&self) -> Option<Box<dyn TransportContext>> {
        Some(Box::new(RawTransportContext))
    }
}
