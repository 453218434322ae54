//! Session façade, connection pool, and the exclusive-lease allocator.
//!
//! One [`RpcSession`] owns N outgoing and M incoming connections to a single
//! peer. Outbound calls lease a connection through [`ExclusiveConnection`];
//! each incoming connection is driven by a dedicated worker thread that owns
//! its own join handle inside the session's thread map and deregisters
//! itself on exit. All pool bookkeeping lives under one mutex — contention
//! here is dominated by blocking I/O, not by these critical sections.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::{mpsc, Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::addr::RpcSocketAddress;
use crate::error::{last_errno, Error, Result};
use crate::state::{CommandType, SessionState, FLAG_ONEWAY};
use crate::transport::{
    CertificateFormat, RawTransportContext, Transport, TransportContext, TransportContextFactory,
};
use crate::trigger::{set_nonblocking, ShutdownTrigger};
use crate::wire::{
    ConnectionHeader, ObjectAddr, SessionId, RPC_CONNECTION_OPTION_INCOMING,
    RPC_WIRE_PROTOCOL_VERSION, RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL,
    RPC_WIRE_PROTOCOL_VERSION_NEXT,
};

/// One transport under exclusive-thread leasing discipline.
pub struct Connection {
    transport: Box<dyn Transport>,
    /// Leasing metadata. Only locked while the owning session's lock is held,
    /// or by the lease holder releasing its claim; never held across I/O.
    lease: Mutex<LeaseState>,
}

#[derive(Default)]
struct LeaseState {
    exclusive_tid: Option<ThreadId>,
    allow_nested: bool,
}

impl Connection {
    fn new(transport: Box<dyn Transport>) -> Arc<Connection> {
        Arc::new(Connection {
            transport,
            lease: Mutex::new(LeaseState::default()),
        })
    }

    /// The byte stream. The thread currently holding the lease may use it
    /// without any session lock.
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// Mark whether this connection may serve a nested outbound transaction
    /// while it is mid-command. Hook for the command layer; nothing in the
    /// session core sets it.
    pub fn set_allow_nested(&self, allow: bool) {
        self.lease.lock().allow_nested = allow;
    }

    fn allow_nested(&self) -> bool {
        self.lease.lock().allow_nested
    }

    fn exclusive_tid(&self) -> Option<ThreadId> {
        self.lease.lock().exclusive_tid
    }

    fn set_exclusive_tid(&self, tid: Option<ThreadId>) {
        self.lease.lock().exclusive_tid = tid;
    }
}

/// Observes incoming-worker lifecycle for a session.
pub trait EventListener: Send + Sync {
    /// The last incoming worker deregistered its connection.
    fn on_session_all_incoming_threads_ended(&self, session: &Arc<RpcSession>);
    /// An incoming worker is about to exit; fired after all of its cleanup.
    fn on_session_incoming_thread_ended(&self);
}

/// The server that adopted a session. Held weakly — a strong reference here
/// would form a cycle with the server's own session list.
pub trait SessionOwner: Send + Sync {}

/// Attaches incoming worker threads to a host runtime for the duration of
/// their command loop. The returned guard detaches on drop.
pub trait ThreadAttacher: Send + Sync {
    fn attach(&self) -> AttachGuard;
}

pub struct AttachGuard(Option<Box<dyn FnOnce() + Send>>);

impl AttachGuard {
    /// Guard that runs `detach` when the worker's command loop exits.
    pub fn new(detach: impl FnOnce() + Send + 'static) -> AttachGuard {
        AttachGuard(Some(Box::new(detach)))
    }

    /// Guard with nothing to detach. Attachment is often conditional — a
    /// host runtime may not be present in this process — so implementors
    /// return this from [`ThreadAttacher::attach`] when there was nothing to
    /// attach to.
    pub fn noop() -> AttachGuard {
        AttachGuard(None)
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        if let Some(detach) = self.0.take() {
            detach();
        }
    }
}

/// Client-side listener bridging worker teardown to `shutdown_and_wait`.
/// Owns its own mutex and condvar so waiting never contends with the pool.
struct WaitForShutdownListener {
    shutdown: Mutex<bool>,
    cv: Condvar,
}

impl WaitForShutdownListener {
    fn new() -> Arc<WaitForShutdownListener> {
        Arc::new(WaitForShutdownListener {
            shutdown: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn wait_for_shutdown(&self) {
        let mut shutdown = self.shutdown.lock();
        while !*shutdown {
            if self
                .cv
                .wait_for(&mut shutdown, Duration::from_secs(1))
                .timed_out()
            {
                tracing::error!("still waiting for session shutdown (1s without progress)");
            }
        }
    }
}

impl EventListener for WaitForShutdownListener {
    fn on_session_all_incoming_threads_ended(&self, _session: &Arc<RpcSession>) {
        *self.shutdown.lock() = true;
        self.cv.notify_all();
    }

    fn on_session_incoming_thread_ended(&self) {
        self.cv.notify_all();
    }
}

struct Shared {
    outgoing: Vec<Arc<Connection>>,
    incoming: Vec<Arc<Connection>>,
    /// Rotating scan hint for async call balancing.
    outgoing_offset: usize,
    /// High-watermark of incoming connections ever admitted. Once the pool
    /// shrinks below it, late joiners are turned away.
    max_incoming_connections: usize,
    waiting_threads: u32,
    /// Worker threads keyed by their own id; each entry is inserted and
    /// removed by the worker it names.
    threads: HashMap<ThreadId, JoinHandle<()>>,
    max_threads: usize,
    protocol_version: Option<u32>,
    id: Option<SessionId>,
    shutdown_trigger: Option<Arc<ShutdownTrigger>>,
    shutdown_listener: Option<Arc<WaitForShutdownListener>>,
    event_listener: Option<Weak<dyn EventListener>>,
    for_server: Option<Weak<dyn SessionOwner>>,
    thread_attacher: Option<Arc<dyn ThreadAttacher>>,
}

/// A peer-to-peer binding of N+M byte-stream connections carrying commands
/// between two processes.
pub struct RpcSession {
    ctx: Box<dyn TransportContext>,
    state: Box<dyn SessionState>,
    shared: Mutex<Shared>,
    available_cv: Condvar,
}

impl RpcSession {
    /// Create a session over raw (non-TLS) transports.
    pub fn new(state: Box<dyn SessionState>) -> Arc<RpcSession> {
        Self::with_context(Box::new(RawTransportContext), state)
    }

    /// Create a session with a caller-chosen transport context, optionally
    /// pinning one trusted peer certificate.
    ///
    /// Supplying a certificate format without a certificate (or the other
    /// way around) is a programming error and aborts.
    pub fn make(
        factory: &dyn TransportContextFactory,
        trusted_peer_format: Option<CertificateFormat>,
        trusted_peer_cert: Option<Vec<u8>>,
        state: Box<dyn SessionState>,
    ) -> Option<Arc<RpcSession>> {
        let ctx = factory.new_client_ctx()?;
        assert_eq!(
            trusted_peer_format.is_some(),
            trusted_peer_cert.is_some(),
            "a trusted peer certificate needs both a format and a value"
        );
        if let (Some(format), Some(cert)) = (trusted_peer_format, trusted_peer_cert) {
            if let Err(err) = ctx.add_trusted_peer_certificate(format, &cert) {
                tracing::error!(error = %err, "cannot add trusted peer certificate");
                return None;
            }
        }
        Some(Self::with_context(ctx, state))
    }

    fn with_context(ctx: Box<dyn TransportContext>, state: Box<dyn SessionState>) -> Arc<RpcSession> {
        tracing::trace!("session created");
        Arc::new(RpcSession {
            ctx,
            state,
            shared: Mutex::new(Shared {
                outgoing: Vec::new(),
                incoming: Vec::new(),
                outgoing_offset: 0,
                max_incoming_connections: 0,
                waiting_threads: 0,
                threads: HashMap::new(),
                max_threads: 0,
                protocol_version: None,
                id: None,
                shutdown_trigger: None,
                shutdown_listener: None,
                event_listener: None,
                for_server: None,
                thread_attacher: None,
            }),
            available_cv: Condvar::new(),
        })
    }

    /// Cap on the number of incoming worker threads this side will serve
    /// with. Must be called before any connection joins the pool; calling it
    /// later is a programming error and aborts.
    pub fn set_max_threads(&self, threads: usize) {
        let mut shared = self.shared.lock();
        assert!(
            shared.outgoing.is_empty() && shared.incoming.is_empty(),
            "max thread count must be set before connections exist, \
             but session has {} outgoing and {} incoming",
            shared.outgoing.len(),
            shared.incoming.len()
        );
        shared.max_threads = threads;
    }

    pub fn get_max_threads(&self) -> usize {
        self.shared.lock().max_threads
    }

    /// Cap the wire protocol version for this session. Returns `false` (with
    /// state unchanged) for unknown versions and for attempts to raise a
    /// previously-set cap.
    pub fn set_protocol_version(&self, version: u32) -> bool {
        if version >= RPC_WIRE_PROTOCOL_VERSION_NEXT
            && version != RPC_WIRE_PROTOCOL_VERSION_EXPERIMENTAL
        {
            tracing::error!(
                version,
                supported = RPC_WIRE_PROTOCOL_VERSION,
                "cannot start session with unknown protocol version"
            );
            return false;
        }

        let mut shared = self.shared.lock();
        if let Some(previous) = shared.protocol_version {
            if version > previous {
                tracing::error!(
                    previous,
                    version,
                    "cannot raise an explicitly capped protocol version"
                );
                return false;
            }
        }
        shared.protocol_version = Some(version);
        true
    }

    pub fn get_protocol_version(&self) -> Option<u32> {
        self.shared.lock().protocol_version
    }

    /// The peer-assigned session id, once the handshake has produced one.
    pub fn id(&self) -> Option<SessionId> {
        self.shared.lock().id
    }

    pub fn outgoing_connection_count(&self) -> usize {
        self.shared.lock().outgoing.len()
    }

    pub fn incoming_connection_count(&self) -> usize {
        self.shared.lock().incoming.len()
    }

    /// The command layer plugged into this session.
    pub fn state(&self) -> &dyn SessionState {
        self.state.as_ref()
    }

    /// The session's shutdown trigger, once installed. The command layer
    /// passes it to transport transfers.
    pub fn shutdown_trigger(&self) -> Option<Arc<ShutdownTrigger>> {
        self.shared.lock().shutdown_trigger.clone()
    }

    /// Install a host-runtime attacher applied to every incoming worker for
    /// the duration of its command loop.
    pub fn set_thread_attacher(&self, attacher: Arc<dyn ThreadAttacher>) {
        self.shared.lock().thread_attacher = Some(attacher);
    }

    /// This side's certificate, if the transport context has one.
    pub fn get_certificate(&self, format: CertificateFormat) -> Vec<u8> {
        self.ctx.certificate(format)
    }

    // ------------------------------------------------------------------
    // Client setup
    // ------------------------------------------------------------------

    pub fn setup_unix_domain_client(self: &Arc<Self>, path: impl AsRef<Path>) -> Result<()> {
        self.setup_socket_client(RpcSocketAddress::Unix(path.as_ref().to_path_buf()))
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub fn setup_vsock_client(self: &Arc<Self>, cid: u32, port: u32) -> Result<()> {
        self.setup_socket_client(RpcSocketAddress::Vsock { cid, port })
    }

    /// Resolve `host:port` and connect to the first address that accepts.
    pub fn setup_inet_client(self: &Arc<Self>, host: &str, port: u16) -> Result<()> {
        let addrs: Vec<_> = match (host, port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(err) => {
                tracing::error!(host, port, error = %err, "could not resolve address");
                return Err(Error::Unknown);
            }
        };
        if addrs.is_empty() {
            tracing::error!(host, port, "address resolved to nothing");
            return Err(Error::Unknown);
        }

        for addr in addrs {
            match self.setup_socket_client(RpcSocketAddress::Inet(addr)) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(%addr, error = %err, "could not set up inet client")
                }
            }
        }
        tracing::error!(host, port, "no resolved address could be connected");
        Err(Error::NameNotFound)
    }

    /// Set up over a descriptor the caller already connected. When `fd` is
    /// `None` (or once it has been consumed for the first connection),
    /// `request` is asked to produce descriptors for the remaining fan-out.
    pub fn setup_preconnected_client(
        self: &Arc<Self>,
        fd: Option<OwnedFd>,
        mut request: impl FnMut() -> Option<OwnedFd>,
    ) -> Result<()> {
        let mut fd = fd;
        let session = Arc::clone(self);
        self.setup_client(move |session_id, incoming| {
            let fd = match fd.take().or_else(&mut request) {
                Some(fd) => fd,
                None => return Err(Error::BadValue),
            };
            if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
                tracing::error!(error = %err, "preconnected descriptor unusable");
                return Err(err);
            }
            session.init_and_add_connection(fd, session_id, incoming)
        })
    }

    /// Open a connection to `/dev/null` for wire-format debugging. Raw
    /// transport contexts only — there is nothing on the other side to
    /// handshake with.
    pub fn add_null_debugging_client(self: &Arc<Self>) -> Result<()> {
        self.init_shutdown_trigger()?;

        let raw = loop {
            let fd = unsafe {
                libc::open(
                    b"/dev/null\0".as_ptr() as *const libc::c_char,
                    libc::O_WRONLY | libc::O_CLOEXEC,
                )
            };
            if fd >= 0 {
                break fd;
            }
            if last_errno() == libc::EINTR {
                continue;
            }
            let err = Error::from_errno();
            tracing::error!(error = %err, "could not open /dev/null");
            return Err(err);
        };
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let trigger = self
            .shutdown_trigger()
            .expect("shutdown trigger installed above");
        let Some(transport) = self.ctx.new_transport(fd, trigger) else {
            tracing::error!("unable to set up transport");
            return Err(Error::Unknown);
        };
        self.add_outgoing_connection(transport, false)
    }

    /// Client-side handshake: negotiate the protocol version, obtain the
    /// session id, then open the full connection fan-out.
    ///
    /// `connect_and_init` opens one transport, writes the connection header,
    /// and registers the result as outgoing or incoming. Calling this on a
    /// session that already has outgoing connections is a programming error
    /// and aborts.
    pub fn setup_client<F>(self: &Arc<Self>, mut connect_and_init: F) -> Result<()>
    where
        F: FnMut(SessionId, bool) -> Result<()>,
    {
        {
            let shared = self.shared.lock();
            assert!(
                shared.outgoing.is_empty(),
                "session must only be set up once, but already has {} outgoing connections",
                shared.outgoing.len()
            );
        }
        self.init_shutdown_trigger()?;

        connect_and_init(SessionId::zero(), false)?;

        {
            let connection = ExclusiveConnection::find(self, ConnectionUse::Client)?;
            let version = self
                .state
                .read_new_session_response(connection.get(), self)?;
            if !self.set_protocol_version(version) {
                return Err(Error::BadValue);
            }
        }

        // TODO: grow the pool lazily as the peer requests connections
        // instead of opening the whole fan-out here.
        let remote_max_threads = self.get_remote_max_threads().map_err(|err| {
            tracing::error!(error = %err, "could not get max threads after initial session setup");
            err
        })?;

        self.read_id().map_err(|err| {
            tracing::error!(error = %err, "could not get session id after initial session setup");
            err
        })?;
        let session_id = self.id().expect("session id was just read");

        // connection #0 already counts against the remote thread budget
        for _ in 1..remote_max_threads {
            connect_and_init(session_id, false)?;
        }
        for _ in 0..self.get_max_threads() {
            connect_and_init(session_id, true)?;
        }

        Ok(())
    }

    fn setup_socket_client(self: &Arc<Self>, addr: RpcSocketAddress) -> Result<()> {
        let session = Arc::clone(self);
        self.setup_client(move |session_id, incoming| {
            session.setup_one_socket_connection(&addr, session_id, incoming)
        })
    }

    fn setup_one_socket_connection(
        self: &Arc<Self>,
        addr: &RpcSocketAddress,
        session_id: SessionId,
        incoming: bool,
    ) -> Result<()> {
        for attempt in 0..5 {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(10));
            }

            let storage = addr.to_storage()?;

            #[cfg(any(target_os = "linux", target_os = "android"))]
            let socket_type = libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            let socket_type = libc::SOCK_STREAM;

            let raw = unsafe { libc::socket(storage.family(), socket_type, 0) };
            if raw < 0 {
                let err = Error::from_errno();
                tracing::error!(%addr, error = %err, "could not create socket");
                return Err(err);
            }
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            crate::trigger::set_cloexec_nonblocking(fd.as_raw_fd())?;

            let connected = loop {
                let ret = unsafe { libc::connect(fd.as_raw_fd(), storage.as_ptr(), storage.len()) };
                if ret == -1 && last_errno() == libc::EINTR {
                    continue;
                }
                break ret == 0;
            };

            if !connected {
                let mut conn_errno = last_errno();
                if conn_errno == libc::EAGAIN || conn_errno == libc::EINPROGRESS {
                    // Nonblocking connect: wait for writability, then read the
                    // verdict out of SO_ERROR as if the socket had blocked.
                    let trigger = self
                        .shutdown_trigger()
                        .expect("shutdown trigger must exist during socket setup");
                    if let Err(err) = trigger.triggerable_poll(fd.as_fd(), libc::POLLOUT) {
                        tracing::error!(%addr, error = %err, "could not wait for nonblocking connect");
                        return Err(err);
                    }

                    let mut so_error: libc::c_int = 0;
                    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                    let ret = unsafe {
                        libc::getsockopt(
                            fd.as_raw_fd(),
                            libc::SOL_SOCKET,
                            libc::SO_ERROR,
                            &mut so_error as *mut libc::c_int as *mut libc::c_void,
                            &mut len,
                        )
                    };
                    if ret == -1 {
                        let err = Error::from_errno();
                        tracing::error!(%addr, error = %err, "could not read SO_ERROR after connect");
                        return Err(err);
                    }
                    conn_errno = so_error;
                }

                if conn_errno == libc::ECONNRESET {
                    tracing::warn!(%addr, "connection reset, retrying");
                    continue;
                }
                // SO_ERROR may report zero; the connect actually completed.
                if conn_errno != 0 {
                    tracing::error!(%addr, errno = conn_errno, "could not connect socket");
                    return Err(Error::Os(conn_errno));
                }
            }

            tracing::trace!(%addr, fd = fd.as_raw_fd(), "socket connected");
            return self.init_and_add_connection(fd, session_id, incoming);
        }

        tracing::error!(%addr, "ran out of retries to connect");
        Err(Error::Unknown)
    }

    fn init_and_add_connection(
        self: &Arc<Self>,
        fd: OwnedFd,
        session_id: SessionId,
        incoming: bool,
    ) -> Result<()> {
        let (trigger, version) = {
            let shared = self.shared.lock();
            let trigger = shared
                .shutdown_trigger
                .clone()
                .expect("shutdown trigger must exist before connections are added");
            let version = shared
                .protocol_version
                .unwrap_or(RPC_WIRE_PROTOCOL_VERSION);
            (trigger, version)
        };

        let Some(transport) = self.ctx.new_transport(fd, Arc::clone(&trigger)) else {
            tracing::error!("unable to set up transport");
            return Err(Error::Unknown);
        };

        let mut options = 0;
        if incoming {
            options |= RPC_CONNECTION_OPTION_INCOMING;
        }
        let header = ConnectionHeader {
            version,
            options,
            session_id,
        };
        if let Err(err) = transport.interruptable_write_fully(&trigger, &header.encode()) {
            tracing::error!(error = %err, "could not write connection header");
            return Err(err);
        }
        tracing::trace!(incoming, "connection header sent");

        if incoming {
            self.add_incoming_connection(transport)
        } else {
            self.add_outgoing_connection(transport, true)
        }
    }

    fn init_shutdown_trigger(&self) -> Result<()> {
        let mut shared = self.shared.lock();
        if shared.shutdown_trigger.is_none() {
            // First client connection is about to be added and set_for_server
            // was never called: initializing for a client.
            let Some(trigger) = ShutdownTrigger::make() else {
                return Err(Error::InvalidOperation);
            };
            let listener = WaitForShutdownListener::new();
            let listener_dyn: Arc<dyn EventListener> = listener.clone();
            let weak_listener: Weak<dyn EventListener> = Arc::downgrade(&listener_dyn);
            shared.event_listener = Some(weak_listener);
            shared.shutdown_listener = Some(listener);
            shared.shutdown_trigger = Some(trigger);
        }
        Ok(())
    }

    fn add_outgoing_connection(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
        init: bool,
    ) -> Result<()> {
        let connection = Connection::new(transport);
        {
            let mut shared = self.shared.lock();
            connection.set_exclusive_tid(Some(thread::current().id()));
            shared.outgoing.push(Arc::clone(&connection));
        }

        if init {
            if let Err(err) = self.state.send_connection_init(&connection, self) {
                tracing::warn!(error = %err, "connection init was not sent");
            }
        }

        {
            let _shared = self.shared.lock();
            connection.set_exclusive_tid(None);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server adoption and incoming workers
    // ------------------------------------------------------------------

    /// Adopt this session for a server: provide the identity, the lifecycle
    /// listener, and the shutdown trigger. Returns `false` only if the
    /// trigger could not be created. Re-adoption is a programming error and
    /// aborts.
    pub fn set_for_server(
        &self,
        server: Weak<dyn SessionOwner>,
        event_listener: Weak<dyn EventListener>,
        session_id: SessionId,
    ) -> bool {
        let mut shared = self.shared.lock();
        assert!(shared.for_server.is_none(), "session already adopted by a server");
        assert!(
            shared.event_listener.is_none(),
            "event listener already installed"
        );
        assert!(
            shared.shutdown_trigger.is_none(),
            "shutdown trigger already installed"
        );

        let Some(trigger) = ShutdownTrigger::make() else {
            return false;
        };
        shared.shutdown_trigger = Some(trigger);
        shared.id = Some(session_id);
        shared.for_server = Some(server);
        shared.event_listener = Some(event_listener);
        true
    }

    /// The adopting server, or `None` for sessions no server ever adopted.
    ///
    /// The back reference is weak only to break the ownership cycle; a
    /// server dying before its adopted session is a programming error and
    /// aborts.
    pub fn server(&self) -> Option<Arc<dyn SessionOwner>> {
        let shared = self.shared.lock();
        let weak = shared.for_server.as_ref()?;
        let server = weak.upgrade();
        assert!(
            server.is_some(),
            "server died before its adopted session; the weak reference only breaks the cycle"
        );
        server
    }

    /// Register the current thread's own join handle in the session's thread
    /// map. A worker must do this before anything can try to join it; the
    /// handle must name the calling thread.
    pub fn pre_join_thread_ownership(&self, handle: JoinHandle<()>) {
        assert_eq!(
            handle.thread().id(),
            thread::current().id(),
            "a worker may only register its own join handle"
        );
        let mut shared = self.shared.lock();
        shared.threads.insert(handle.thread().id(), handle);
    }

    /// Admit the current thread's transport into the pool and read the
    /// connection-init bytes. Runs on the worker thread before its command
    /// loop.
    pub fn pre_join_setup(self: &Arc<Self>, transport: Box<dyn Transport>) -> PreJoinSetupResult {
        // Registered before the loop starts so command handlers running on
        // this thread can issue nested calls over this connection.
        let connection = self.assign_incoming_connection_to_this_thread(transport);

        let status = match &connection {
            None => Err(Error::DeadObject),
            Some(connection) => self.state.read_connection_init(connection, self),
        };

        PreJoinSetupResult { connection, status }
    }

    /// Run an incoming worker to completion: command loop, then
    /// deregistration. Consumes the session reference; the thread's map
    /// entry is removed (detaching the handle) before the listener fires.
    pub fn join(session: Arc<RpcSession>, setup: PreJoinSetupResult) {
        let PreJoinSetupResult { connection, status } = setup;

        match status {
            Ok(()) => {
                let connection = connection
                    .as_ref()
                    .expect("connection exists when setup succeeded");
                let _attached = session
                    .thread_attacher()
                    .map(|attacher| attacher.attach());
                loop {
                    if let Err(err) =
                        session
                            .state
                            .get_and_execute_command(connection, &session, CommandType::Any)
                    {
                        tracing::debug!(error = %err, "incoming worker closing");
                        break;
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "connection failed to init, worker closing");
            }
        }

        let listener = {
            let mut shared = session.shared.lock();
            let handle = shared.threads.remove(&thread::current().id());
            assert!(handle.is_some(), "worker thread missing from session thread map");
            // dropping the JoinHandle detaches the thread
            drop(handle);
            shared
                .event_listener
                .as_ref()
                .and_then(Weak::upgrade)
        };

        // After all other cleanup: session shutdown progresses through the
        // callbacks fired here.
        if let Some(connection) = connection {
            assert!(
                session.remove_incoming_connection(&connection),
                "connection is guaranteed to still be in the incoming list"
            );
        }

        drop(session);

        if let Some(listener) = listener {
            listener.on_session_incoming_thread_ended();
        }
    }

    fn thread_attacher(&self) -> Option<Arc<dyn ThreadAttacher>> {
        self.shared.lock().thread_attacher.clone()
    }

    /// Spawn the worker for a freshly-connected incoming transport. Does not
    /// return until the worker owns its join handle and has finished its
    /// pre-join setup, so a returned connection can never be joined before it
    /// is registered.
    fn add_incoming_connection(self: &Arc<Self>, transport: Box<dyn Transport>) -> Result<()> {
        let ready = Arc::new((Mutex::new(false), Condvar::new()));
        let (handle_tx, handle_rx) = mpsc::sync_channel::<JoinHandle<()>>(1);

        let session = Arc::clone(self);
        let worker_ready = Arc::clone(&ready);
        let spawned = thread::Builder::new()
            .name("rpc-incoming".into())
            .spawn(move || {
                let handle = handle_rx
                    .recv()
                    .expect("spawner hands over the join handle");
                session.pre_join_thread_ownership(handle);

                // only let the spawner continue once we have a response or
                // the connection has failed
                let setup = session.pre_join_setup(transport);
                {
                    let (flag, cv) = &*worker_ready;
                    *flag.lock() = true;
                    cv.notify_one();
                }

                RpcSession::join(session, setup);
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!(error = %err, "could not spawn incoming worker");
                return Err(Error::from_io(&err));
            }
        };
        handle_tx
            .send(handle)
            .expect("worker is blocked receiving its join handle");

        let (flag, cv) = &*ready;
        let mut transferred = flag.lock();
        while !*transferred {
            cv.wait(&mut transferred);
        }
        Ok(())
    }

    fn assign_incoming_connection_to_this_thread(
        &self,
        transport: Box<dyn Transport>,
    ) -> Option<Arc<Connection>> {
        let mut shared = self.shared.lock();

        if shared.incoming.len() >= shared.max_threads {
            tracing::error!(
                incoming = shared.incoming.len(),
                max_threads = shared.max_threads,
                "cannot add worker thread past the configured maximum"
            );
            return None;
        }

        // Don't accept new connections once some have shut down. Usually this
        // happens while connections are still being established for a
        // short-lived session that is already draining.
        if shared.incoming.len() < shared.max_incoming_connections {
            return None;
        }

        let connection = Connection::new(transport);
        connection.set_exclusive_tid(Some(thread::current().id()));
        shared.incoming.push(Arc::clone(&connection));
        shared.max_incoming_connections = shared.incoming.len();
        Some(connection)
    }

    fn remove_incoming_connection(self: &Arc<Self>, connection: &Arc<Connection>) -> bool {
        let mut shared = self.shared.lock();
        let Some(index) = shared
            .incoming
            .iter()
            .position(|c| Arc::ptr_eq(c, connection))
        else {
            return false;
        };
        shared.incoming.remove(index);

        if shared.incoming.is_empty() {
            if let Some(listener) = shared.event_listener.as_ref().and_then(Weak::upgrade) {
                drop(shared);
                listener.on_session_all_incoming_threads_ended(self);
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------

    /// Fetch the address of the peer's root object.
    pub fn get_root_object(self: &Arc<Self>) -> Result<ObjectAddr> {
        let connection = ExclusiveConnection::find(self, ConnectionUse::Client)?;
        self.state.get_root_object(connection.get(), self)
    }

    /// How many threads the peer serves this session with.
    pub fn get_remote_max_threads(self: &Arc<Self>) -> Result<usize> {
        let connection = ExclusiveConnection::find(self, ConnectionUse::Client)?;
        self.state.get_max_threads(connection.get(), self)
    }

    /// Refresh the session id from the peer. Only valid on client sessions;
    /// calling it on a server-adopted session is a programming error and
    /// aborts.
    pub fn read_id(self: &Arc<Self>) -> Result<()> {
        {
            let shared = self.shared.lock();
            assert!(
                shared.for_server.is_none(),
                "the session id can only be read on a client session"
            );
        }

        let connection = ExclusiveConnection::find(self, ConnectionUse::Client)?;
        let id = self.state.get_session_id(connection.get(), self)?;
        tracing::trace!(id = ?id, "session id assigned");
        self.shared.lock().id = Some(id);
        Ok(())
    }

    /// Issue one transaction on a leased connection; synchronous unless
    /// `flags` carries [`FLAG_ONEWAY`].
    pub fn transact(
        self: &Arc<Self>,
        object: &ObjectAddr,
        code: u32,
        data: &[u8],
        reply: &mut Vec<u8>,
        flags: u32,
    ) -> Result<()> {
        let use_kind = if flags & FLAG_ONEWAY != 0 {
            ConnectionUse::ClientAsync
        } else {
            ConnectionUse::Client
        };
        let connection = ExclusiveConnection::find(self, use_kind)?;
        self.state
            .transact(connection.get(), object, code, data, self, reply, flags)
    }

    /// Tell the peer to drop one strong reference to `address`.
    pub fn send_dec_strong(self: &Arc<Self>, address: &ObjectAddr) -> Result<()> {
        let connection = ExclusiveConnection::find(self, ConnectionUse::ClientRefcount)?;
        self.state.send_dec_strong(connection.get(), self, address)
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Fire the shutdown trigger and, when `wait` is set, block until every
    /// incoming worker has deregistered. Calling this on a session without a
    /// trigger is a programming error and aborts.
    pub fn shutdown_and_wait(self: &Arc<Self>, wait: bool) -> bool {
        let (trigger, listener) = {
            let shared = self.shared.lock();
            let trigger = shared
                .shutdown_trigger
                .clone()
                .expect("shutdown trigger not installed");
            (trigger, shared.shutdown_listener.clone())
        };

        trigger.trigger();

        if wait {
            let listener = listener.expect("shutdown listener not installed");
            listener.wait_for_shutdown();

            let shared = self.shared.lock();
            assert!(
                shared.threads.is_empty(),
                "shutdown did not drain the worker threads"
            );
        }

        self.state.clear();
        true
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        tracing::trace!("session destroyed");
        let shared = self.shared.get_mut();
        assert!(
            shared.incoming.is_empty(),
            "session destroyed while incoming workers are still registered"
        );
    }
}

/// Result of [`RpcSession::pre_join_setup`], handed to [`RpcSession::join`].
pub struct PreJoinSetupResult {
    connection: Option<Arc<Connection>>,
    status: Result<()>,
}

/// What a lease will be used for; drives the allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionUse {
    /// Synchronous call: request and reply on the same connection.
    Client,
    /// Fire-and-forget call; rotates the allocation hint so later
    /// synchronous calls don't queue behind it on the peer.
    ClientAsync,
    /// Reference-count decrement; may piggy-back on the connection this
    /// thread is currently serving rather than wait for an outgoing slot.
    ClientRefcount,
}

/// Scoped lease of one connection for one call. Dropping the lease releases
/// the connection; a reentrant lease (the thread already held the
/// connection) releases nothing, the outer frame keeps ownership.
pub struct ExclusiveConnection {
    session: Arc<RpcSession>,
    connection: Arc<Connection>,
    reentrant: bool,
}

impl ExclusiveConnection {
    /// Select and claim a connection for the calling thread, blocking until
    /// one is available. Fails with [`Error::WouldBlock`] when the session
    /// has no outgoing connections at all and the request cannot be served
    /// nested.
    pub fn find(session: &Arc<RpcSession>, use_kind: ConnectionUse) -> Result<ExclusiveConnection> {
        let tid = thread::current().id();
        let mut shared = session.shared.lock();

        shared.waiting_threads += 1;
        let found = loop {
            let mut exclusive: Option<Arc<Connection>> = None;
            let mut available: Option<Arc<Connection>> = None;

            // A thread already holding an outgoing connection keeps using it.
            let hint = shared.outgoing_offset;
            scan_connections(tid, &mut exclusive, Some(&mut available), &shared.outgoing, hint);

            // An async command occupies the peer's thread on that connection
            // for an unknown amount of time. Rotate the hint so the next
            // caller starts from a different connection instead of queueing
            // behind it.
            if use_kind == ConnectionUse::ClientAsync
                && (exclusive.is_some() || available.is_some())
            {
                shared.outgoing_offset = (shared.outgoing_offset + 1) % shared.outgoing.len();
            }

            if use_kind != ConnectionUse::ClientAsync {
                let mut exclusive_incoming: Option<Arc<Connection>> = None;
                // incoming connections are always bound to their serving
                // thread, so no hint and no availability scan
                scan_connections(tid, &mut exclusive_incoming, None, &shared.incoming, 0);

                if let Some(incoming) = exclusive_incoming {
                    if incoming.allow_nested() {
                        // guaranteed to be processed as a nested command
                        exclusive = Some(incoming);
                    } else if use_kind == ConnectionUse::ClientRefcount && available.is_none() {
                        // Refcount decrements may be issued from inside the
                        // command loop itself; they must not wait for an
                        // outgoing slot. The command layer drains them, so
                        // riding the serving connection is safe.
                        exclusive = Some(incoming);
                    }
                }
            }

            if let Some(connection) = exclusive {
                break Ok(ExclusiveConnection {
                    session: Arc::clone(session),
                    connection,
                    reentrant: true,
                });
            }
            if let Some(connection) = available {
                connection.set_exclusive_tid(Some(tid));
                break Ok(ExclusiveConnection {
                    session: Arc::clone(session),
                    connection,
                    reentrant: false,
                });
            }

            if shared.outgoing.is_empty() {
                tracing::error!(
                    ?use_kind,
                    incoming = shared.incoming.len(),
                    "session has no outgoing connections; non-nested calls cannot be made"
                );
                break Err(Error::WouldBlock);
            }

            tracing::trace!(
                outgoing = shared.outgoing.len(),
                incoming = shared.incoming.len(),
                "no available connections, waiting"
            );
            session.available_cv.wait(&mut shared);
        };
        shared.waiting_threads -= 1;

        found
    }

    /// The leased connection.
    pub fn get(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// True if the calling thread already held this connection when the
    /// lease was taken.
    pub fn reentrant(&self) -> bool {
        self.reentrant
    }
}

impl Drop for ExclusiveConnection {
    fn drop(&mut self) {
        // A reentrant lease means a frame deeper in the call stack handed us
        // a connection it still owns; it keeps the claim.
        if self.reentrant {
            return;
        }

        let shared = self.session.shared.lock();
        self.connection.set_exclusive_tid(None);
        let wake = shared.waiting_threads > 0;
        drop(shared);
        if wake {
            self.session.available_cv.notify_one();
        }
    }
}

/// One pass over `connections`, starting at `hint` and wrapping. Records the
/// first unclaimed connection in `available` (when requested) and the first
/// connection already claimed by `tid` in `exclusive`, stopping at the
/// latter.
fn scan_connections(
    tid: ThreadId,
    exclusive: &mut Option<Arc<Connection>>,
    mut available: Option<&mut Option<Arc<Connection>>>,
    connections: &[Arc<Connection>],
    hint: usize,
) {
    assert!(
        connections.is_empty() || hint < connections.len(),
        "scan hint {} out of range for {} connections",
        hint,
        connections.len()
    );

    if exclusive.is_some() {
        return;
    }

    for i in 0..connections.len() {
        let connection = &connections[(i + hint) % connections.len()];
        let claimed_by = connection.exclusive_tid();

        // take the first free connection (intuition: caching)
        if let Some(slot) = available.as_deref_mut() {
            if slot.is_none() && claimed_by.is_none() {
                *slot = Some(Arc::clone(connection));
                continue;
            }
        }

        // though, prefer the connection this thread is already using
        // (nested transactions)
        if claimed_by == Some(tid) {
            *exclusive = Some(Arc::clone(connection));
            break;
        }
    }
}
