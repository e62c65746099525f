//! Listening sockets.
//!
//! Listeners are built with `socket2` so that `SO_REUSEADDR`, `IPV6_V6ONLY`
//! and the backlog are set before `listen()`. Every accepted socket goes
//! through [`AcceptPolicy::normalize`] before it reaches the table.

use std::fmt;
use std::fs::{self, Permissions};
use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket as Socket2, Type};
use tracing::{debug, info, warn};

use crate::config::{DaemonConfig, DaemonPorts};
use crate::connection::{PeerAddr, Socket, TlsSession, Transport};
use crate::error::{ServerError, ServerResult};

/// Wraps accepted secure sockets in a TLS session.
pub trait TlsAcceptor: Send + Sync {
    fn accept(&self, socket: &Socket) -> io::Result<Arc<dyn TlsSession>>;
}

/// Where a listener is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Inet(SocketAddr),
    Local(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(addr) => write!(f, "{addr}"),
            Self::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug)]
enum ListenSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// One bound, listening, non-blocking socket.
#[derive(Debug)]
pub struct Listener {
    socket: ListenSocket,
    transport: Transport,
    addr: ListenAddr,
}

impl Listener {
    /// Binds a TCP listener.
    pub fn bind_tcp(addr: SocketAddr, transport: Transport, backlog: i32) -> ServerResult<Self> {
        let listener = tcp_listen(addr, backlog)?;
        let addr = listener.local_addr()?;
        Ok(Self {
            socket: ListenSocket::Tcp(listener),
            transport,
            addr: ListenAddr::Inet(addr),
        })
    }

    /// Binds a Unix-domain listener and applies `mode` to the socket file.
    ///
    /// A leftover socket file nobody answers on is removed first.
    pub fn bind_local(path: &Path, mode: u32, backlog: i32) -> ServerResult<Self> {
        remove_stale_socket(path)?;
        let listener = unix_listen(path, backlog)?;
        fs::set_permissions(path, Permissions::from_mode(mode))?;

        Ok(Self {
            socket: ListenSocket::Unix(listener),
            transport: Transport::Local,
            addr: ListenAddr::Local(path.to_path_buf()),
        })
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Bound address; ephemeral ports are resolved.
    pub fn local_addr(&self) -> &ListenAddr {
        &self.addr
    }

    /// Accepts one pending connection.
    pub fn accept(&self) -> io::Result<(Socket, PeerAddr)> {
        match &self.socket {
            ListenSocket::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                Ok((Socket::Tcp(stream), PeerAddr::Inet(addr)))
            }
            ListenSocket::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                let (uid, gid) = peer_credentials(&stream);
                Ok((Socket::Unix(stream), PeerAddr::Local { uid, gid }))
            }
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.socket {
            ListenSocket::Tcp(l) => l.as_fd(),
            ListenSocket::Unix(l) => l.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match &self.socket {
            ListenSocket::Tcp(l) => l.as_raw_fd(),
            ListenSocket::Unix(l) => l.as_raw_fd(),
        }
    }
}

/// All listeners of the daemon.
#[derive(Debug, Default)]
pub struct ListenerSet {
    listeners: Vec<Listener>,
}

impl ListenerSet {
    /// Binds every requested listener. Any failure is fatal.
    pub fn bind(
        ports: &DaemonPorts,
        config: &DaemonConfig,
        tls: Option<&dyn TlsAcceptor>,
    ) -> ServerResult<Self> {
        let mut listeners = Vec::new();
        let backlog = config.listen_backlog;

        if let Some(port) = ports.plain_port {
            for ip in &ports.listen_addrs {
                let addr = SocketAddr::new(*ip, port);
                listeners.push(Listener::bind_tcp(addr, Transport::Plain, backlog)?);
            }
        }

        if let Some(port) = ports.secure_port {
            if tls.is_none() {
                return Err(ServerError::TlsUnavailable {
                    addr: format!("port {port}"),
                });
            }
            for ip in ports.secure_addrs() {
                let addr = SocketAddr::new(*ip, port);
                listeners.push(Listener::bind_tcp(addr, Transport::Secure, backlog)?);
            }
        }

        if let Some(ref path) = ports.local_path {
            listeners.push(Listener::bind_local(path, config.local_socket_mode, backlog)?);
        }

        if listeners.is_empty() {
            return Err(ServerError::NoListeners);
        }
        Ok(Self { listeners })
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Listener> {
        self.listeners.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> {
        self.listeners.iter()
    }

    /// Bound addresses, in registration order.
    pub fn local_addrs(&self) -> Vec<ListenAddr> {
        self.listeners.iter().map(|l| l.addr.clone()).collect()
    }

    /// Logs one startup line per listener.
    pub fn log_banners(&self) {
        for (i, listener) in self.listeners.iter().enumerate() {
            let protocol = listener.transport.protocol();
            if i == 0 {
                info!(addr = %listener.addr, protocol, "ldapd started. Listening on {} for {} requests", listener.addr, protocol);
            } else {
                info!(addr = %listener.addr, protocol, "Listening on {} for {} requests", listener.addr, protocol);
            }
        }
    }

    /// Closes every listener and removes local socket files.
    pub fn close_all(&mut self) {
        for listener in self.listeners.drain(..) {
            if let ListenAddr::Local(ref path) = listener.addr
                && let Err(e) = fs::remove_file(path)
            {
                debug!(path = %path.display(), error = %e, "Could not remove local socket");
            }
            debug!(addr = %listener.addr, "Closed listener");
        }
    }
}

/// How accepted sockets are prepared.
#[derive(Debug, Clone, Copy)]
pub struct AcceptPolicy {
    /// Move descriptors below this number above it; 0 disables.
    pub renumber_above: RawFd,
    /// Leave Nagle on for TCP.
    pub nagle: bool,
}

impl AcceptPolicy {
    pub fn from_config(config: &DaemonConfig) -> Self {
        let renumber_above = if config.renumber_descriptors {
            RawFd::try_from(config.reserved_descriptors).unwrap_or(0)
        } else {
            0
        };
        Self {
            renumber_above,
            nagle: config.enable_nagle,
        }
    }

    /// Renumbers, enables keepalive, sets non-blocking mode and applies the
    /// Nagle policy. Only the non-blocking switch is mandatory.
    pub fn normalize(&self, socket: Socket) -> io::Result<Socket> {
        let socket = self.renumber(socket);
        let fd = socket.as_raw_fd();

        if let Err(e) = SockRef::from(&socket).set_keepalive(true) {
            warn!(fd, error = %e, "Could not enable keepalive");
        }
        socket.set_nonblocking(true)?;
        if let Socket::Tcp(ref stream) = socket
            && let Err(e) = stream.set_nodelay(!self.nagle)
        {
            warn!(fd, error = %e, "Could not set TCP_NODELAY");
        }
        Ok(socket)
    }

    fn renumber(&self, socket: Socket) -> Socket {
        let fd = socket.as_raw_fd();
        if self.renumber_above <= 0 || fd >= self.renumber_above {
            return socket;
        }
        let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, self.renumber_above) };
        if new_fd < 0 {
            warn!(
                fd,
                reserved = self.renumber_above,
                error = %io::Error::last_os_error(),
                "Could not move descriptor above reserved range"
            );
            return socket;
        }
        // SAFETY: fcntl returned a fresh descriptor we now own.
        let owned = unsafe { OwnedFd::from_raw_fd(new_fd) };
        match socket {
            Socket::Tcp(_) => Socket::Tcp(TcpStream::from(owned)),
            Socket::Unix(_) => Socket::Unix(UnixStream::from(owned)),
        }
    }
}

fn tcp_listen(addr: SocketAddr, backlog: i32) -> ServerResult<TcpListener> {
    let socket = Socket2::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::bind(addr, e))?;
    let setup = || -> io::Result<()> {
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.bind(&addr.into())
    };
    setup().map_err(|e| ServerError::bind(addr, e))?;
    socket.listen(backlog).map_err(|e| ServerError::listen(addr, e))?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from(socket))
}

fn unix_listen(path: &Path, backlog: i32) -> ServerResult<UnixListener> {
    let display = path.display().to_string();
    let socket = Socket2::new(Domain::UNIX, Type::STREAM, None).map_err(|e| ServerError::bind(&display, e))?;
    let addr = SockAddr::unix(path).map_err(|e| ServerError::bind(&display, e))?;
    socket.bind(&addr).map_err(|e| ServerError::bind(&display, e))?;
    socket.listen(backlog).map_err(|e| ServerError::listen(&display, e))?;
    socket.set_nonblocking(true)?;
    Ok(UnixListener::from(OwnedFd::from(socket)))
}

/// Clears the way for a local listener at `path`.
///
/// Only socket files are touched: a live one is an error, a stale one is
/// removed. Anything else at the path fails the bind.
fn remove_stale_socket(path: &Path) -> ServerResult<()> {
    let display = path.display().to_string();
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            if UnixStream::connect(path).is_ok() {
                return Err(ServerError::socket_in_use(display));
            }
            info!(path = %path.display(), "Removing stale local socket");
            fs::remove_file(path).map_err(|e| ServerError::bind(&display, e))
        }
        Ok(_) => Err(ServerError::bind(
            &display,
            io::Error::new(io::ErrorKind::AlreadyExists, "path exists and is not a socket"),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ServerError::bind(&display, e)),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_credentials(stream: &UnixStream) -> (Option<u32>, Option<u32>) {
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast(),
            &mut len,
        )
    };
    if rc != 0 {
        return (None, None);
    }
    (Some(cred.uid), Some(cred.gid))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_credentials(_stream: &UnixStream) -> (Option<u32>, Option<u32>) {
    (None, None)
}
