//! Per-connection state held inside a table slot.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which listener a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Plain,
    Secure,
    Local,
}

impl Transport {
    /// Protocol name used in banners.
    pub fn protocol(&self) -> &'static str {
        match self {
            Self::Plain => "LDAP",
            Self::Secure => "LDAPS",
            Self::Local => "LDAPI",
        }
    }
}

/// Why a connection was closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    IdleTimeout,
    PollError,
    IoError,
    ClientClosed,
    Abort,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::IdleTimeout => "idle timeout",
            Self::PollError => "poll error",
            Self::IoError => "I/O error",
            Self::ClientClosed => "closed by client",
            Self::Abort => "aborted",
        })
    }
}

/// Opaque TLS session handle produced by a `TlsAcceptor`.
pub trait TlsSession: Send + Sync + fmt::Debug {
    /// Negotiated protocol version.
    fn version(&self) -> Option<&str> {
        None
    }
}

/// An accepted client socket.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Shuts down both directions; the descriptor stays open until drop.
    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
            Self::Unix(s) => s.shutdown(Shutdown::Both),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Unix(_))
    }
}

impl AsFd for Socket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for &Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match *self {
            Socket::Tcp(s) => (&*s).read(buf),
            Socket::Unix(s) => (&*s).read(buf),
        }
    }
}

impl Write for &Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match *self {
            Socket::Tcp(s) => (&*s).write(buf),
            Socket::Unix(s) => (&*s).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self {
            Socket::Tcp(s) => (&*s).flush(),
            Socket::Unix(s) => (&*s).flush(),
        }
    }
}

/// Remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    /// Unix-domain peer with its credentials, when the platform reports them.
    Local { uid: Option<u32>, gid: Option<u32> },
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Local {
                uid: Some(uid),
                gid: Some(gid),
            } => write!(f, "local (uid={uid} gid={gid})"),
            Self::Local { .. } => f.write_str("local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Active,
    Closing,
}

/// One client connection.
///
/// Only reachable through its slot's lock, so every field is plain data.
/// Workers read through their own clone of the socket and take the lock
/// only to update this state.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    socket: Arc<Socket>,
    tls: Option<Arc<dyn TlsSession>>,
    transport: Transport,
    peer: PeerAddr,
    state: ConnState,
    disconnect_reason: Option<DisconnectReason>,
    opened_at: DateTime<Utc>,
    last_activity: Instant,
    bind_dn: Option<String>,
    is_root: bool,
    pub(crate) limits: Vec<Option<i64>>,
    pub(crate) limits_resolved: bool,
    idle_timeout: u64,
    threads: usize,
    max_threads: usize,
    reading: bool,
    ops_initiated: u64,
    ops_completed: u64,
    max_threads_hits: u64,
    polls_blocked: u64,
}

impl Connection {
    pub fn new(socket: Socket, transport: Transport, peer: PeerAddr) -> Self {
        Self {
            id: 0,
            socket: Arc::new(socket),
            tls: None,
            transport,
            peer,
            state: ConnState::Active,
            disconnect_reason: None,
            opened_at: Utc::now(),
            last_activity: Instant::now(),
            bind_dn: None,
            is_root: false,
            limits: Vec::new(),
            limits_resolved: false,
            idle_timeout: 0,
            threads: 0,
            max_threads: 1,
            reading: false,
            ops_initiated: 0,
            ops_completed: 0,
            max_threads_hits: 0,
            polls_blocked: 0,
        }
    }

    pub fn with_tls(mut self, session: Arc<dyn TlsSession>) -> Self {
        self.tls = Some(session);
        self
    }

    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout = secs;
        self
    }

    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max.max(1);
        self
    }

    /// Connection number, assigned on activation.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Socket handle a worker reads through without holding the slot lock.
    /// The descriptor stays open until the last handle is dropped.
    pub(crate) fn socket_handle(&self) -> Arc<Socket> {
        Arc::clone(&self.socket)
    }

    pub fn tls(&self) -> Option<&Arc<dyn TlsSession>> {
        self.tls.as_ref()
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn peer(&self) -> &PeerAddr {
        &self.peer
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.disconnect_reason
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Bound identity, `None` for anonymous.
    pub fn bind_dn(&self) -> Option<&str> {
        self.bind_dn.as_deref()
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Resolved idle timeout in seconds, 0 for unlimited.
    pub fn idle_timeout(&self) -> u64 {
        self.idle_timeout
    }

    /// Worker threads currently serving this connection.
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// True while a worker is reading from the socket.
    pub fn is_reading(&self) -> bool {
        self.reading
    }

    pub fn ops_initiated(&self) -> u64 {
        self.ops_initiated
    }

    pub fn ops_completed(&self) -> u64 {
        self.ops_completed
    }

    pub fn pending_operations(&self) -> u64 {
        self.ops_initiated.saturating_sub(self.ops_completed)
    }

    /// True if the connection has been quiet for its whole idle timeout
    /// with nothing in progress.
    pub fn is_idle(&self, now: Instant) -> bool {
        self.idle_timeout > 0
            && !self.reading
            && self.pending_operations() == 0
            && now.saturating_duration_since(self.last_activity)
                >= Duration::from_secs(self.idle_timeout)
    }

    pub(crate) fn set_id(&mut self, id: u64) {
        self.id = id;
    }

    pub(crate) fn set_idle_timeout(&mut self, secs: u64) {
        self.idle_timeout = secs;
    }

    pub(crate) fn set_bind(&mut self, dn: Option<&str>, is_root: bool) {
        self.bind_dn = dn.map(str::to_string);
        self.is_root = is_root;
        self.limits_resolved = false;
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub(crate) fn begin_operation(&mut self) -> u64 {
        self.ops_initiated += 1;
        self.ops_initiated
    }

    pub(crate) fn end_operation(&mut self, now: Instant) {
        if self.ops_completed < self.ops_initiated {
            self.ops_completed += 1;
            self.touch(now);
        }
    }

    /// Marks the connection for dispatch. Returns true if this dispatch
    /// used the last allowed thread.
    pub(crate) fn begin_read(&mut self, now: Instant) -> bool {
        self.reading = true;
        self.threads += 1;
        self.last_activity = now;
        if self.threads == self.max_threads {
            self.max_threads_hits += 1;
            true
        } else {
            false
        }
    }

    /// Lets the event loop watch the socket again while this worker is
    /// still processing.
    pub(crate) fn done_reading(&mut self) {
        self.reading = false;
    }

    /// Drops one worker. The reader flag may belong to a newer worker, so
    /// it only goes with the last one.
    pub(crate) fn end_read(&mut self, now: Instant) {
        self.threads = self.threads.saturating_sub(1);
        if self.threads == 0 {
            self.reading = false;
        }
        self.last_activity = now;
    }

    pub(crate) fn at_thread_cap(&self) -> bool {
        self.threads >= self.max_threads
    }

    pub(crate) fn note_blocked_poll(&mut self) {
        self.polls_blocked += 1;
    }

    pub(crate) fn max_threads_hits(&self) -> u64 {
        self.max_threads_hits
    }

    pub(crate) fn polls_blocked(&self) -> u64 {
        self.polls_blocked
    }

    /// Moves to closing and shuts the socket down. Returns false if the
    /// connection was already closing.
    pub(crate) fn close(&mut self, reason: DisconnectReason) -> bool {
        if self.is_closing() {
            return false;
        }
        self.state = ConnState::Closing;
        self.disconnect_reason = Some(reason);
        let _ = self.socket.shutdown();
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn local_connection() -> (Connection, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        let conn = Connection::new(
            Socket::Unix(server),
            Transport::Local,
            PeerAddr::Local {
                uid: None,
                gid: None,
            },
        );
        (conn, client)
    }

    #[test]
    fn idle_requires_quiet_period() {
        let (conn, _client) = local_connection();
        let conn = conn.with_idle_timeout(5);
        let opened = conn.last_activity();

        assert!(!conn.is_idle(opened + Duration::from_secs(4)));
        assert!(conn.is_idle(opened + Duration::from_secs(5)));
    }

    #[test]
    fn zero_timeout_never_idles() {
        let (conn, _client) = local_connection();
        assert!(!conn.is_idle(Instant::now() + Duration::from_secs(3600)));
    }

    #[test]
    fn pending_operation_blocks_idle() {
        let (conn, _client) = local_connection();
        let mut conn = conn.with_idle_timeout(1);
        let later = conn.last_activity() + Duration::from_secs(10);

        conn.begin_operation();
        assert!(!conn.is_idle(later));
        conn.end_operation(conn.last_activity());
        assert!(conn.is_idle(later));
    }

    #[test]
    fn completed_operation_restarts_idle_clock() {
        let (conn, _client) = local_connection();
        let mut conn = conn.with_idle_timeout(5);
        let opened = conn.last_activity();

        conn.begin_operation();
        conn.end_operation(opened + Duration::from_secs(4));
        assert!(!conn.is_idle(opened + Duration::from_secs(6)));
        assert!(conn.is_idle(opened + Duration::from_secs(9)));
    }

    #[test]
    fn socket_handle_outlives_close() {
        let (mut conn, mut client) = local_connection();
        let handle = conn.socket_handle();
        conn.close(DisconnectReason::Abort);
        drop(conn);

        assert!(handle.is_local());
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
        assert_eq!((&*handle).read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn reading_blocks_idle() {
        let (conn, _client) = local_connection();
        let mut conn = conn.with_idle_timeout(1).with_max_threads(2);
        let start = conn.last_activity();

        assert!(!conn.begin_read(start));
        assert!(!conn.is_idle(start + Duration::from_secs(10)));
        conn.end_read(start);
        assert!(conn.is_idle(start + Duration::from_secs(10)));
    }

    #[test]
    fn thread_cap_hits_are_counted() {
        let (conn, _client) = local_connection();
        let mut conn = conn.with_max_threads(1);

        assert!(conn.begin_read(Instant::now()));
        assert!(conn.at_thread_cap());
        assert_eq!(conn.max_threads_hits(), 1);
    }

    #[test]
    fn close_is_one_shot() {
        let (mut conn, _client) = local_connection();

        assert!(conn.close(DisconnectReason::IdleTimeout));
        assert!(!conn.close(DisconnectReason::Abort));
        assert_eq!(
            conn.disconnect_reason(),
            Some(DisconnectReason::IdleTimeout)
        );
    }

    #[test]
    fn close_shuts_down_socket() {
        let (mut conn, mut client) = local_connection();
        conn.close(DisconnectReason::Abort);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn peer_display() {
        let peer = PeerAddr::Local {
            uid: Some(1000),
            gid: Some(100),
        };
        assert_eq!(peer.to_string(), "local (uid=1000 gid=100)");
        let inet = PeerAddr::Inet("127.0.0.1:389".parse().unwrap());
        assert_eq!(inet.to_string(), "127.0.0.1:389");
    }
}
