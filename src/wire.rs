//! Wire-level constants and the per-connection setup header.

use std::fmt;

/// Current supported wire protocol version.
pub const RPC_WIRE_PROTOCOL_VERSION: u32 = 1;
/// First unsupported version number; anything at or past this is rejected.
pub const RPC_WIRE_PROTOCOL_VERSION_NEXT: u32 = 2;
/// Reserved sentinel accepted regardless of the rejection threshold.
pub const RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL: u32 = 0xF000_0000;

/// Header option bit: this connection will carry commands *to* the client
/// (the client serves them on a dedicated worker thread).
pub const RPC_CONNECTION_OPTION_INCOMING: u32 = 0x01;

/// Opaque 32-byte session identity assigned by the peer during handshake.
///
/// The all-zero value means "no id yet" and is only valid on the very first
/// outgoing connection of a client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 32]);

impl SessionId {
    pub const SIZE: usize = 32;

    pub const fn zero() -> Self {
        SessionId([0; 32])
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        SessionId(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionId({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Opaque 32-byte address of a remote object, as used by the command layer
/// for root-object lookup, transactions, and reference counting.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectAddr([u8; 32]);

impl ObjectAddr {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        ObjectAddr(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ObjectAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectAddr({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Header a client writes on every connection immediately after transport
/// construction, before any command-layer bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHeader {
    /// Capped protocol version ([`RPC_WIRE_PROTOCOL_VERSION`] if uncapped).
    pub version: u32,
    /// Option bits; see [`RPC_CONNECTION_OPTION_INCOMING`].
    pub options: u32,
    /// All-zero on the very first connection, the assigned id afterwards.
    pub session_id: SessionId,
}

/// Encoded size: two little-endian words plus the raw session id.
pub const CONNECTION_HEADER_SIZE: usize = 8 + SessionId::SIZE;

impl ConnectionHeader {
    pub fn encode(&self) -> [u8; CONNECTION_HEADER_SIZE] {
        let mut buf = [0u8; CONNECTION_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..8].copy_from_slice(&self.options.to_le_bytes());
        buf[8..].copy_from_slice(self.session_id.as_bytes());
        buf
    }

    /// Parse a header off the wire; the server side of session setup reads
    /// this before anything else on a new connection.
    pub fn decode(buf: &[u8; CONNECTION_HEADER_SIZE]) -> Self {
        let version = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let options = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let mut id = [0u8; SessionId::SIZE];
        id.copy_from_slice(&buf[8..]);
        ConnectionHeader {
            version,
            options,
            session_id: SessionId::from_bytes(id),
        }
    }
}
