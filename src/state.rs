//! Seam to the binder-level command codec.
//!
//! The command layer (`transact` encoding, root-object lookup, proxy
//! reference counting) lives outside this crate. The session hands it a
//! leased connection for every operation; the implementation must hold no
//! exclusive lease of its own and must only touch the connection it was
//! given.

use std::sync::Arc;

use crate::error::Result;
use crate::session::{Connection, RpcSession};
use crate::wire::{ObjectAddr, SessionId};

/// Transaction flag: fire-and-forget, no reply is read.
pub const FLAG_ONEWAY: u32 = 0x01;

/// What a worker loop iteration is willing to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Any,
    ControlOnly,
}

/// Wire-level command exchange on connections leased by the session.
pub trait SessionState: Send + Sync {
    /// Read the peer's chosen protocol version from the very first outgoing
    /// connection of a new session.
    fn read_new_session_response(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<u32>;

    /// Ask the peer how many threads it serves this session with.
    fn get_max_threads(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<usize>;

    /// Read the peer-assigned session id.
    fn get_session_id(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<SessionId>;

    /// Fetch the address of the peer's root object.
    fn get_root_object(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<ObjectAddr>;

    /// First bytes sent on a freshly added outgoing connection.
    fn send_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<()>;

    /// Counterpart of [`Self::send_connection_init`], read on a freshly
    /// admitted incoming connection.
    fn read_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<()>;

    /// Block for one inbound command and execute it. Worker threads call
    /// this in a loop and exit on the first error.
    fn get_and_execute_command(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        command_type: CommandType,
    ) -> Result<()>;

    /// Issue one transaction; synchronous unless `flags` carries
    /// [`FLAG_ONEWAY`].
    #[allow(clippy::too_many_arguments)]
    fn transact(
        &self,
        connection: &Arc<Connection>,
        object: &ObjectAddr,
        code: u32,
        data: &[u8],
        session: &Arc<RpcSession>,
        reply: &mut Vec<u8>,
        flags: u32,
    ) -> Result<()>;

    /// Decrement the strong count the peer holds for `address`.
    fn send_dec_strong(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        address: &ObjectAddr,
    ) -> Result<()>;

    /// Drop all command-layer state; called once shutdown has drained the
    /// session's workers.
    fn clear(&self);
}
