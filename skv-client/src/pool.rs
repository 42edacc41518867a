//! # Connection Pool
//!
//! Purpose: Reuse node connections to reduce handshake latency and
//! allocation churn.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Bounded Waits**: At the pool limit, callers wait for a released
//!    connection up to `acquire_timeout`, then fail with `PoolExhausted`.
//! 4. **Cache-Friendly Buffers**: Each connection reuses its own buffers.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{ClientError, ClientResult};
use crate::identity::{NodeAddress, NodeIdentity, ParserKind};
use crate::resp::{encode_command, read_response, RespValue};

/// Limits and I/O timeouts shared by every pool a registry creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional socket read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional socket write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// How long `acquire` waits at the limit; `None` waits indefinitely and
    /// zero fails immediately.
    pub acquire_timeout: Option<Duration>,
}

/// Default wait for a free connection when the pool is at its limit.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            max_idle: 8,
            max_total: 64,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
        }
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    identity: NodeIdentity,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    // Signalled whenever a connection or a slot is handed back.
    released: Condvar,
}

/// Connection pool handle. Clones share the same underlying pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened lazily on acquire.
    pub fn new(identity: NodeIdentity, settings: PoolSettings) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(settings.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                identity,
                settings,
                state: Mutex::new(state),
                released: Condvar::new(),
            }),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.inner.identity
    }

    /// Returns true when both handles point at the same pool.
    pub fn ptr_eq(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of idle connections currently parked in the pool.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Acquires a connection from the pool.
    ///
    /// Idle connections are reused first. At the limit the call blocks until
    /// another caller releases a connection or `acquire_timeout` elapses.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        let settings = &self.inner.settings;
        let deadline = settings
            .acquire_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.inner.state.lock();
        loop {
            if let Some(conn) = state.idle.pop_front() {
                return Ok(PooledConnection::new(self.inner.clone(), conn));
            }
            if state.total < settings.max_total {
                state.total += 1;
                break;
            }
            match deadline {
                None => self.inner.released.wait(&mut state),
                Some(deadline) => {
                    let expired =
                        Instant::now() >= deadline || self.inner.released.wait_until(&mut state, deadline).timed_out();
                    if expired && state.idle.is_empty() && state.total >= settings.max_total {
                        return Err(ClientError::PoolExhausted);
                    }
                }
            }
        }
        drop(state);

        match Connection::connect(&self.inner.identity, settings) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
        self.inner.released.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.settings.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
        self.inner.released.notify_one();
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes one command and returns the parsed reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self.conn.as_mut().ok_or(ClientError::Protocol)?;
        let response = conn.exec(args);
        if response.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }

    /// Writes pre-encoded commands in one go and reads `count` replies in
    /// submission order.
    pub fn exec_encoded(&mut self, encoded: &[u8], count: usize) -> ClientResult<Vec<RespValue>> {
        let conn = self.conn.as_mut().ok_or(ClientError::Protocol)?;
        let response = conn.exec_encoded(encoded, count);
        if response.is_err() {
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid {
            pool.return_connection(conn);
        } else {
            warn!(node = %self.pool.identity.address, "discarding broken connection");
            pool.release_slot();
        }
    }
}

/// Byte stream to a node, over TCP or a unix socket.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)?;
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(true)
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Single node connection with reusable buffers.
///
/// The buffers are stored on the connection to avoid per-call allocations.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Stream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(identity: &NodeIdentity, settings: &PoolSettings) -> ClientResult<Self> {
        let stream = connect_stream(&identity.address, settings.connect_timeout)?;
        stream.set_timeouts(settings.read_timeout, settings.write_timeout)?;

        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };
        conn.handshake(identity)?;
        debug!(node = %identity.address, db = identity.db, "opened node connection");
        Ok(conn)
    }

    fn handshake(&mut self, identity: &NodeIdentity) -> ClientResult<()> {
        let password = identity.password.as_deref().map(str::as_bytes);
        match (identity.parser, password) {
            (ParserKind::Resp3, Some(password)) => {
                expect_ok(self.exec(&[b"HELLO", b"3", b"AUTH", b"default", password])?)?
            }
            (ParserKind::Resp3, None) => expect_ok(self.exec(&[b"HELLO", b"3"])?)?,
            (ParserKind::Resp2, Some(password)) => expect_ok(self.exec(&[b"AUTH", password])?)?,
            (ParserKind::Resp2, None) => {}
        }
        if identity.db != 0 {
            let db = identity.db.to_string();
            expect_ok(self.exec(&[b"SELECT", db.as_bytes()])?)?;
        }
        Ok(())
    }

    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn exec_encoded(&mut self, encoded: &[u8], count: usize) -> ClientResult<Vec<RespValue>> {
        let stream = self.reader.get_mut();
        stream.write_all(encoded)?;
        stream.flush()?;

        let mut replies = Vec::with_capacity(count);
        for _ in 0..count {
            replies.push(read_response(&mut self.reader, &mut self.line_buf)?);
        }
        Ok(replies)
    }
}

/// Any non-error reply counts as success for handshake commands.
fn expect_ok(reply: RespValue) -> ClientResult<()> {
    match reply {
        RespValue::Error(message) => Err(ClientError::server(message)),
        _ => Ok(()),
    }
}

fn connect_stream(address: &NodeAddress, timeout: Option<Duration>) -> ClientResult<Stream> {
    match address {
        NodeAddress::Tcp { host, port } => {
            let addrs = (host.as_str(), *port)
                .to_socket_addrs()
                .map_err(|_| ClientError::InvalidAddress(address.to_string()))?;
            let mut last_err = None;
            for addr in addrs {
                let attempt = match timeout {
                    Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                    None => TcpStream::connect(addr),
                };
                match attempt {
                    Ok(stream) => return Ok(Stream::Tcp(stream)),
                    Err(err) => last_err = Some(err),
                }
            }
            match last_err {
                Some(err) => Err(ClientError::Io(err)),
                None => Err(ClientError::InvalidAddress(address.to_string())),
            }
        }
        #[cfg(unix)]
        NodeAddress::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        #[cfg(not(unix))]
        NodeAddress::Unix(_) => Err(ClientError::InvalidAddress(address.to_string())),
    }
}
