//! Daemon lifecycle and the event loop.
//!
//! One thread runs [`Daemon::run`]: it accepts connections, waits for
//! readiness and hands readable connections to the worker pool. Workers,
//! the disk monitor and the signal thread reach back only through the
//! shared [`DaemonState`] and the reactor's waker.

use std::collections::HashMap;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ldapd_core::ShutdownReason;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{Backends, NoBackends};
use crate::config::{DaemonConfig, DaemonPorts};
use crate::connection::{Connection, DisconnectReason, PeerAddr, Socket, Transport};
use crate::conntable::{ConnectionTable, Pollable, SlotId, TableSnapshot};
use crate::diskmon::{DiskMonitor, DiskMonitorHandle, SpaceProbe, StatvfsProbe};
use crate::error::ServerResult;
use crate::handler::{Activity, ConnectionHandler};
use crate::listener::{AcceptPolicy, ListenAddr, ListenerSet, TlsAcceptor};
use crate::logs::{LogControl, LogKind, LogSettings};
use crate::pidfile::PidFile;
use crate::reactor::{MioReactor, Reactor, Readiness, Token};
use crate::reslimit::{LimitSource, ResourceLimits, StaticLimits};
use crate::signals::{self, ShutdownHandle, SignalRegistration};
use crate::workers::WorkerPool;

/// Target used for per-connection access events.
pub const ACCESS_LOG_TARGET: &str = "ldapd::access";

/// Everything the core calls out to.
pub struct Collaborators {
    pub handler: Arc<dyn ConnectionHandler>,
    pub backends: Arc<dyn Backends>,
    pub logs: Arc<dyn LogControl>,
    pub limits: Box<dyn LimitSource>,
    pub tls: Option<Arc<dyn TlsAcceptor>>,
    pub probe: Arc<dyn SpaceProbe>,
}

impl Collaborators {
    /// Defaults around `handler`: no backends, in-process log settings, no
    /// per-identity limits, no TLS, `statvfs` probing.
    pub fn new(handler: impl ConnectionHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            backends: Arc::new(NoBackends),
            logs: Arc::new(LogSettings::new()),
            limits: Box::new(StaticLimits::new()),
            tls: None,
            probe: Arc::new(StatvfsProbe),
        }
    }

    pub fn with_backends(mut self, backends: Arc<dyn Backends>) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_logs(mut self, logs: Arc<dyn LogControl>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_limits(mut self, limits: impl LimitSource + 'static) -> Self {
        self.limits = Box::new(limits);
        self
    }

    pub fn with_tls(mut self, tls: Arc<dyn TlsAcceptor>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }
}

/// State shared between the event loop and the workers.
pub struct DaemonState {
    config: DaemonConfig,
    shutdown: ShutdownHandle,
    table: ConnectionTable,
    limits: ResourceLimits,
    handler: Arc<dyn ConnectionHandler>,
    logs: Arc<dyn LogControl>,
}

impl DaemonState {
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn shutdown(&self) -> &ShutdownHandle {
        &self.shutdown
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Closes a connection and notifies the handler. Returns false if it
    /// was already closing or the id is stale.
    pub fn disconnect(&self, id: SlotId, reason: DisconnectReason) -> bool {
        match self.table.disconnect(id, reason) {
            Some(conn_id) => {
                self.closed(conn_id, reason);
                true
            }
            None => false,
        }
    }

    /// Closes every connection with `reason`.
    pub fn disconnect_all(&self, reason: DisconnectReason) -> usize {
        let closed = self.table.disconnect_all(reason);
        for conn_id in &closed {
            self.closed(*conn_id, reason);
        }
        closed.len()
    }

    /// Lets the handler abandon in-flight operations on every connection.
    pub fn abandon_all_operations(&self) {
        self.table.for_each_active(|_, conn| self.handler.abandon_operations(conn));
    }

    /// Monitor view of the connection table.
    pub fn snapshot(&self) -> TableSnapshot {
        self.table.snapshot()
    }

    fn disconnect_if_idle(&self, id: SlotId, now: Instant) {
        if let Some(conn_id) = self.table.disconnect_if_idle(id, now) {
            self.closed(conn_id, DisconnectReason::IdleTimeout);
        }
    }

    fn closed(&self, conn_id: u64, reason: DisconnectReason) {
        debug!(conn = conn_id, reason = %reason, "Connection closed");
        if self.logs.is_enabled(LogKind::Access) {
            info!(target: ACCESS_LOG_TARGET, conn = conn_id, reason = %reason, "conn={} closed - {}", conn_id, reason);
        }
        self.handler.on_disconnect(conn_id, reason);
    }

    /// Worker body for one readable connection. The slot lock is not held
    /// while the handler runs.
    fn run_activity(&self, id: SlotId) {
        let result = Activity::open(&self.table, &self.limits, id).map(|mut activity| {
            let result = self.handler.activity(&mut activity);
            activity.done_reading();
            result
        });
        if let Some(Err(e)) = result {
            let reason = if e.kind() == io::ErrorKind::UnexpectedEof {
                DisconnectReason::ClientClosed
            } else {
                debug!(slot = %id, error = %e, "Connection I/O error");
                DisconnectReason::IoError
            };
            self.disconnect(id, reason);
        }
        self.table.end_activity(id);
    }
}

/// A bound, ready-to-run server.
pub struct Daemon {
    // Dropped first so the signal thread stops before anything it wakes.
    signals: Option<SignalRegistration>,
    state: Arc<DaemonState>,
    listeners: ListenerSet,
    reactor: MioReactor,
    workers: WorkerPool,
    policy: AcceptPolicy,
    tls: Option<Arc<dyn TlsAcceptor>>,
    backends: Arc<dyn Backends>,
    disk: Option<DiskMonitorHandle>,
    pid_file: Option<PidFile>,
}

impl Daemon {
    /// Validates the configuration, binds every listener and starts the
    /// helper threads. Any error here is fatal.
    pub fn new(config: DaemonConfig, ports: &DaemonPorts, collaborators: Collaborators) -> ServerResult<Self> {
        config.validate()?;
        let Collaborators {
            handler,
            backends,
            logs,
            limits,
            tls,
            probe,
        } = collaborators;

        let reactor = MioReactor::new(config.table_capacity() + 16)?;
        let table =
            ConnectionTable::new(config.table_capacity(), config.reserved_descriptors)?.with_waker(reactor.waker());
        let shutdown = ShutdownHandle::new(reactor.waker());
        let limits = ResourceLimits::new(limits, &config);

        let listeners = ListenerSet::bind(ports, &config, tls.as_deref())?;

        let signals = if config.handle_signals {
            Some(signals::install(&shutdown)?)
        } else {
            None
        };
        let workers = WorkerPool::new(config.worker_threads)?;
        let pid_file = config.pid_file.as_ref().map(PidFile::create).transpose()?;

        let disk = if config.disk.enabled {
            let monitor = DiskMonitor::new(
                config.disk.clone(),
                probe,
                Arc::clone(&logs),
                Arc::clone(&backends),
                shutdown.clone(),
            );
            Some(monitor.spawn()?)
        } else {
            None
        };

        listeners.log_banners();
        info!(
            capacity = table.capacity(),
            reserved = table.reserved(),
            workers = config.worker_threads,
            idle_timeout = config.idle_timeout,
            "Connection table ready"
        );

        let policy = AcceptPolicy::from_config(&config);
        let state = Arc::new(DaemonState {
            config,
            shutdown,
            table,
            limits,
            handler,
            logs,
        });

        Ok(Self {
            signals,
            state,
            listeners,
            reactor,
            workers,
            policy,
            tls,
            backends,
            disk,
            pid_file,
        })
    }

    pub fn state(&self) -> &Arc<DaemonState> {
        &self.state
    }

    /// Handle for stopping the daemon from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.state.shutdown.clone()
    }

    pub fn local_addrs(&self) -> Vec<ListenAddr> {
        self.listeners.local_addrs()
    }

    /// Runs the event loop until shutdown, then tears everything down.
    pub fn run(mut self) -> ServerResult<ShutdownReason> {
        let timeout = self.state.config.wakeup_interval();
        let mut pollable: Vec<Pollable> = Vec::new();
        let mut suspended = false;

        while !self.state.shutdown.is_shutdown() {
            let accepting = self.state.table.accepting();
            if !accepting && !suspended {
                warn!(
                    current = self.state.table.current(),
                    reserved = self.state.table.reserved(),
                    "Not listening for new connections - too many fds open"
                );
                suspended = true;
            } else if accepting && suspended {
                info!("Listening for new connections again");
                suspended = false;
            }

            self.reactor.clear();
            if accepting {
                for (index, listener) in self.listeners.iter().enumerate() {
                    self.reactor.register(listener.as_raw_fd(), Token::Listener(index));
                }
            }
            pollable.clear();
            self.state.table.collect_pollable(&mut pollable);
            for p in &pollable {
                self.reactor.register(p.fd, Token::Slot(p.id));
            }

            match self.reactor.wait(timeout) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => trace!("Readiness wait interrupted"),
                Err(e) => error!(error = %e, "Readiness wait failed"),
            }
            if self.state.shutdown.is_shutdown() {
                break;
            }

            let mut woken = false;
            let mut ready_listeners = Vec::new();
            let mut ready_slots: HashMap<SlotId, Readiness> = HashMap::new();
            for (token, readiness) in self.reactor.events() {
                match token {
                    Token::Wakeup => woken = true,
                    Token::Listener(index) => ready_listeners.push(index),
                    Token::Slot(id) => {
                        ready_slots.insert(id, readiness);
                    }
                }
            }

            for index in ready_listeners {
                self.accept_from(index);
            }
            self.service_connections(&ready_slots);

            if woken {
                trace!("Event loop woken");
            }
        }

        Ok(self.shutdown())
    }

    fn accept_from(&self, index: usize) {
        let Some(listener) = self.listeners.get(index) else {
            return;
        };
        while self.state.table.accepting() {
            match listener.accept() {
                Ok((socket, peer)) => self.admit(listener.transport(), socket, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(addr = %listener.local_addr(), error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&self, transport: Transport, socket: Socket, peer: PeerAddr) {
        let socket = match self.policy.normalize(socket) {
            Ok(socket) => socket,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to prepare accepted socket");
                return;
            }
        };

        let session = match (transport, self.tls.as_ref()) {
            (Transport::Secure, Some(tls)) => match tls.accept(&socket) {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(peer = %peer, error = %e, "TLS setup failed");
                    return;
                }
            },
            _ => None,
        };

        let fd = socket.as_raw_fd();
        let peer_text = peer.to_string();
        let mut conn = Connection::new(socket, transport, peer)
            .with_idle_timeout(self.state.limits.default_idle_timeout())
            .with_max_threads(self.state.config.max_threads_per_conn);
        if let Some(session) = session {
            conn = conn.with_tls(session);
        }

        if let Err(e) = self.state.handler.on_open(&conn) {
            debug!(peer = %peer_text, error = %e, "Connection rejected by handler");
            return;
        }

        let Some(id) = self.state.table.acquire() else {
            warn!(peer = %peer_text, "Connection table exhausted, dropping connection");
            return;
        };
        let Some(conn_id) = self.state.table.activate(id, conn) else {
            self.state.table.cancel(id);
            return;
        };

        debug!(conn = conn_id, slot = %id, fd, "Connection activated");
        if self.state.logs.is_enabled(LogKind::Access) {
            info!(
                target: ACCESS_LOG_TARGET,
                conn = conn_id,
                fd,
                peer = %peer_text,
                protocol = transport.protocol(),
                "conn={} fd={} connection from {} ({})",
                conn_id,
                fd,
                peer_text,
                transport.protocol()
            );
        }
    }

    /// Dispatches readable slots, closes errored ones and runs the idle
    /// check on everything else.
    fn service_connections(&self, ready: &HashMap<SlotId, Readiness>) {
        let now = Instant::now();
        let mut cursor = self.state.table.first_active();
        while let Some(id) = cursor {
            cursor = self.state.table.next_active(id);
            match ready.get(&id) {
                Some(readiness) if readiness.readable => self.dispatch(id, now),
                Some(readiness) if readiness.error => {
                    self.state.disconnect(id, DisconnectReason::PollError);
                }
                _ => self.state.disconnect_if_idle(id, now),
            }
        }
    }

    fn dispatch(&self, id: SlotId, now: Instant) {
        if !self.state.table.begin_activity(id, now) {
            return;
        }
        let state = Arc::clone(&self.state);
        if let Err(e) = self.workers.submit(move || state.run_activity(id)) {
            debug!(slot = %id, error = %e, "Could not dispatch connection");
            self.state.table.with_connection(id, Connection::done_reading);
            self.state.table.end_activity(id);
        }
    }

    fn shutdown(mut self) -> ShutdownReason {
        let reason = self.state.shutdown.reason();
        info!(reason = %reason, "ldapd shutting down");

        self.state.abandon_all_operations();
        self.backends.stop_live_updates();
        self.listeners.close_all();
        if let Some(disk) = self.disk.take() {
            disk.stop();
        }

        let closed = self.state.disconnect_all(DisconnectReason::Abort);
        debug!(closed, "Closed remaining connections");

        self.workers.close();
        let deadline = Instant::now() + self.state.config.shutdown_wait();
        self.reactor.clear();
        while self.workers.active() > 0 && Instant::now() < deadline {
            if let Err(e) = self.reactor.wait(Duration::from_millis(100))
                && e.kind() != io::ErrorKind::Interrupted
            {
                debug!(error = %e, "Wait during shutdown failed");
            }
        }
        let remaining = self.workers.shutdown(Duration::ZERO);
        let reaped = self.state.table.reap();
        debug!(reaped, remaining, "Connection table drained");

        self.state.logs.flush();
        self.backends.close_all();
        drop(self.signals.take());

        if reason == ShutdownReason::DiskFull
            && let Some(pid_file) = self.pid_file.take()
            && let Err(e) = pid_file.remove()
        {
            warn!(error = %e, "Failed to remove PID file");
        }

        match serde_json::to_string(&self.state.snapshot()) {
            Ok(snapshot) => debug!(snapshot = %snapshot, "Final connection table"),
            Err(e) => debug!(error = %e, "Failed to serialize connection table"),
        }
        info!(reason = %reason, "ldapd stopped");
        reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
    use std::thread;

    use crate::handler::DiscardHandler;

    fn loopback_ports() -> DaemonPorts {
        DaemonPorts::plain(0, [IpAddr::V4(Ipv4Addr::LOCALHOST)])
    }

    fn config() -> DaemonConfig {
        DaemonConfig::new(16, 2)
            .with_signal_handlers(false)
            .with_wakeup_interval(Duration::from_millis(20))
            .with_worker_threads(2)
    }

    fn inet_addr(daemon: &Daemon) -> SocketAddr {
        match daemon.local_addrs().first() {
            Some(ListenAddr::Inet(addr)) => *addr,
            other => panic!("unexpected listener {other:?}"),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn insufficient_descriptors_is_fatal() {
        let config = DaemonConfig::new(4, 4).with_signal_handlers(false);
        let err = Daemon::new(config, &loopback_ports(), Collaborators::new(DiscardHandler))
            .err()
            .unwrap();
        assert!(err.is_startup_fatal());
    }

    #[test]
    fn accepts_and_serves_connections() {
        let daemon = Daemon::new(config(), &loopback_ports(), Collaborators::new(DiscardHandler)).unwrap();
        let addr = inet_addr(&daemon);
        let state = Arc::clone(daemon.state());
        let shutdown = daemon.shutdown_handle();
        let runner = thread::spawn(move || daemon.run().unwrap());

        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        assert!(wait_for(|| state.snapshot().connections.iter().any(|c| c.ops_initiated > 0)));

        shutdown.trigger(ShutdownReason::Exit);
        assert_eq!(runner.join().unwrap(), ShutdownReason::Exit);

        let mut buf = [0u8; 8];
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        assert_eq!(state.table().current(), 0);
    }

    #[test]
    fn client_close_releases_slot() {
        let daemon = Daemon::new(config(), &loopback_ports(), Collaborators::new(DiscardHandler)).unwrap();
        let addr = inet_addr(&daemon);
        let state = Arc::clone(daemon.state());
        let shutdown = daemon.shutdown_handle();
        let runner = thread::spawn(move || daemon.run().unwrap());

        let client = TcpStream::connect(addr).unwrap();
        assert!(wait_for(|| state.table().current() == 1));
        drop(client);
        assert!(wait_for(|| state.table().current() == 0));
        assert_eq!(state.table().total(), 1);

        shutdown.trigger(ShutdownReason::Exit);
        runner.join().unwrap();
    }
}
