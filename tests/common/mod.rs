//! In-process peer and command-layer stub for session tests.
//!
//! The stub speaks a deliberately tiny request/response protocol so the
//! tests exercise the session core (handshake ordering, leases, shutdown)
//! without dragging in a real command codec.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use tether::{
    CommandType, Connection, ConnectionHeader, Error, ObjectAddr, Result, RpcSession, SessionId,
    SessionState, FLAG_ONEWAY, RPC_CONNECTION_OPTION_INCOMING,
};

const OP_GET_MAX_THREADS: u8 = 0x01;
const OP_GET_SESSION_ID: u8 = 0x02;
const OP_TRANSACT: u8 = 0x03;
const OP_DEC_STRONG: u8 = 0x04;
const MARKER_OUTGOING_INIT: u8 = 0xC1;
const MARKER_INCOMING_INIT: u8 = 0xC2;

pub const STUB_ROOT: ObjectAddr = ObjectAddr::from_bytes([0xEE; 32]);

pub fn unique_socket_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock should be after unix epoch")
        .as_nanos();
    PathBuf::from(format!("/tmp/tether-{tag}-{}-{nanos}.sock", std::process::id()))
}

/// Command-layer stub: every operation is one opcode byte plus fixed-size
/// little-endian fields, written through the leased connection's transport.
pub struct StubState {
    cleared: Arc<AtomicBool>,
}

impl StubState {
    pub fn new() -> StubState {
        StubState {
            cleared: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cleared_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cleared)
    }

    fn write(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        buf: &[u8],
    ) -> Result<()> {
        let trigger = session.shutdown_trigger().ok_or(Error::InvalidOperation)?;
        connection.transport().interruptable_write_fully(&trigger, buf)
    }

    fn read(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        buf: &mut [u8],
    ) -> Result<()> {
        let trigger = session.shutdown_trigger().ok_or(Error::InvalidOperation)?;
        connection.transport().interruptable_read_fully(&trigger, buf)
    }

    fn read_u32(&self, connection: &Arc<Connection>, session: &Arc<RpcSession>) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(connection, session, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

impl SessionState for StubState {
    fn read_new_session_response(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<u32> {
        self.read_u32(connection, session)
    }

    fn get_max_threads(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<usize> {
        self.write(connection, session, &[OP_GET_MAX_THREADS])?;
        Ok(self.read_u32(connection, session)? as usize)
    }

    fn get_session_id(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<SessionId> {
        self.write(connection, session, &[OP_GET_SESSION_ID])?;
        let mut id = [0u8; 32];
        self.read(connection, session, &mut id)?;
        Ok(SessionId::from_bytes(id))
    }

    fn get_root_object(
        &self,
        _connection: &Arc<Connection>,
        _session: &Arc<RpcSession>,
    ) -> Result<ObjectAddr> {
        Ok(STUB_ROOT)
    }

    fn send_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<()> {
        self.write(connection, session, &[MARKER_OUTGOING_INIT])
    }

    fn read_connection_init(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
    ) -> Result<()> {
        let mut marker = [0u8; 1];
        self.read(connection, session, &mut marker)?;
        if marker[0] != MARKER_INCOMING_INIT {
            return Err(Error::BadValue);
        }
        Ok(())
    }

    fn get_and_execute_command(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        _command_type: CommandType,
    ) -> Result<()> {
        let mut opcode = [0u8; 1];
        self.read(connection, session, &mut opcode)?;
        Ok(())
    }

    fn transact(
        &self,
        connection: &Arc<Connection>,
        _object: &ObjectAddr,
        code: u32,
        data: &[u8],
        session: &Arc<RpcSession>,
        reply: &mut Vec<u8>,
        flags: u32,
    ) -> Result<()> {
        let mut request = Vec::with_capacity(13 + data.len());
        request.push(OP_TRANSACT);
        request.extend_from_slice(&code.to_le_bytes());
        request.extend_from_slice(&flags.to_le_bytes());
        request.extend_from_slice(&(data.len() as u32).to_le_bytes());
        request.extend_from_slice(data);
        self.write(connection, session, &request)?;

        if flags & FLAG_ONEWAY == 0 {
            let len = self.read_u32(connection, session)? as usize;
            reply.resize(len, 0);
            self.read(connection, session, reply)?;
        }
        Ok(())
    }

    fn send_dec_strong(
        &self,
        connection: &Arc<Connection>,
        session: &Arc<RpcSession>,
        address: &ObjectAddr,
    ) -> Result<()> {
        let mut request = Vec::with_capacity(33);
        request.push(OP_DEC_STRONG);
        request.extend_from_slice(address.as_bytes());
        self.write(connection, session, &request)
    }

    fn clear(&self) {
        self.cleared.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct PeerConfig {
    pub version: u32,
    pub max_threads: u32,
    pub session_id: [u8; 32],
}

#[derive(Default)]
pub struct Counters {
    pub outgoing: AtomicUsize,
    pub incoming: AtomicUsize,
    pub zero_id_headers: AtomicUsize,
    pub header_mismatches: AtomicUsize,
}

/// Serve the stub protocol on a unix socket. The accept loop runs detached
/// for the life of the test process.
pub fn spawn_unix_peer(path: &Path, config: PeerConfig) -> Arc<Counters> {
    let listener = UnixListener::bind(path).expect("bind unix listener");
    let counters = Arc::new(Counters::default());
    let accept_counters = Arc::clone(&counters);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let config = config.clone();
            let counters = Arc::clone(&accept_counters);
            thread::spawn(move || handle_peer_connection(stream, &config, &counters));
        }
    });
    counters
}

/// Serve the stub protocol on a loopback TCP socket; returns the bound port.
pub fn spawn_tcp_peer(config: PeerConfig) -> (u16, Arc<Counters>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind tcp listener");
    let port = listener.local_addr().expect("local addr").port();
    let counters = Arc::new(Counters::default());
    let accept_counters = Arc::clone(&counters);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let config = config.clone();
            let counters = Arc::clone(&accept_counters);
            thread::spawn(move || handle_peer_connection(stream, &config, &counters));
        }
    });
    (port, counters)
}

fn handle_peer_connection(mut stream: impl Read + Write, config: &PeerConfig, counters: &Counters) {
    let mut raw_header = [0u8; 40];
    if stream.read_exact(&mut raw_header).is_err() {
        return;
    }
    let header = ConnectionHeader::decode(&raw_header);

    if header.session_id.is_zero() {
        counters.zero_id_headers.fetch_add(1, Ordering::SeqCst);
    } else if header.session_id != SessionId::from_bytes(config.session_id) {
        counters.header_mismatches.fetch_add(1, Ordering::SeqCst);
    }

    if header.options & RPC_CONNECTION_OPTION_INCOMING != 0 {
        counters.incoming.fetch_add(1, Ordering::SeqCst);
        if stream.write_all(&[MARKER_INCOMING_INIT]).is_err() {
            return;
        }
        // park until the client tears the connection down
        let mut buf = [0u8; 16];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }

    counters.outgoing.fetch_add(1, Ordering::SeqCst);
    let mut marker = [0u8; 1];
    if stream.read_exact(&mut marker).is_err() || marker[0] != MARKER_OUTGOING_INIT {
        return;
    }
    if header.session_id.is_zero() && stream.write_all(&config.version.to_le_bytes()).is_err() {
        return;
    }

    serve_requests(stream, config);
}

fn serve_requests(mut stream: impl Read + Write, config: &PeerConfig) {
    loop {
        let mut opcode = [0u8; 1];
        if stream.read_exact(&mut opcode).is_err() {
            return;
        }
        let ok = match opcode[0] {
            OP_GET_MAX_THREADS => stream.write_all(&config.max_threads.to_le_bytes()).is_ok(),
            OP_GET_SESSION_ID => stream.write_all(&config.session_id).is_ok(),
            OP_TRANSACT => {
                let mut fixed = [0u8; 12];
                if stream.read_exact(&mut fixed).is_err() {
                    return;
                }
                let flags = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
                let len = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]) as usize;
                let mut payload = vec![0u8; len];
                if stream.read_exact(&mut payload).is_err() {
                    return;
                }
                if flags & FLAG_ONEWAY == 0 {
                    // echo the payload back
                    stream.write_all(&(len as u32).to_le_bytes()).is_ok()
                        && stream.write_all(&payload).is_ok()
                } else {
                    true
                }
            }
            OP_DEC_STRONG => {
                let mut addr = [0u8; 32];
                stream.read_exact(&mut addr).is_ok()
            }
            _ => false,
        };
        if !ok {
            return;
        }
    }
}
