//! Session core of a binder-style RPC runtime.
//!
//! A [`session::RpcSession`] binds two peers through a pool of bidirectional
//! byte-stream connections and multiplexes synchronous and asynchronous
//! remote calls over them. The session owns the concurrency rules: which
//! thread may use which connection, how nested calls reenter a connection the
//! caller already holds, and how shutdown promptly unblocks every worker
//! stuck in I/O.
//!
//! The wire-level command codec is not part of this crate; it plugs in
//! through the [`state::SessionState`] seam and always operates on a
//! connection the session has leased to it. Transport construction (TLS or
//! raw) similarly plugs in through [`transport::TransportContext`].

mod addr;
pub mod error;
pub mod session;
pub mod state;
pub mod transport;
pub mod trigger;
pub mod wire;

pub use error::{Error, Result};
pub use session::{
    AttachGuard, Connection, ConnectionUse, EventListener, ExclusiveConnection,
    PreJoinSetupResult, RpcSession, SessionOwner, ThreadAttacher,
};
pub use state::{CommandType, SessionState, FLAG_ONEWAY};
pub use transport::{
    CertificateFormat, RawTransport, RawTransportContext, RawTransportContextFactory, Transport,
    TransportContext, TransportContextFactory,
};
pub use trigger::ShutdownTrigger;
pub use wire::{
    ConnectionHeader, ObjectAddr, SessionId, RPC_CONNECTION_OPTION_INCOMING,
    RPC_WIRE_PROTOCOL_VERSION, RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL,
    RPC_WIRE_PROTOCOL_VERSION_NEXT,
};
