//! End-to-end tests over loopback sockets.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ldapd_server::{
    Activity, Collaborators, Connection, ConnectionHandler, Daemon, DaemonConfig, DaemonPorts,
    DaemonState, DiscardHandler, DiskMonitorConfig, ListenAddr, ShutdownHandle, ShutdownReason,
    SpaceProbe, Transport,
};
use tempfile::tempdir;

struct Running {
    state: Arc<DaemonState>,
    shutdown: ShutdownHandle,
    addrs: Vec<ListenAddr>,
    thread: JoinHandle<ShutdownReason>,
}

impl Running {
    fn start(config: DaemonConfig, ports: DaemonPorts, collaborators: Collaborators) -> Self {
        let daemon = Daemon::new(config, &ports, collaborators).unwrap();
        let state = Arc::clone(daemon.state());
        let shutdown = daemon.shutdown_handle();
        let addrs = daemon.local_addrs();
        let thread = thread::spawn(move || daemon.run().unwrap());
        Self {
            state,
            shutdown,
            addrs,
            thread,
        }
    }

    fn inet(&self) -> SocketAddr {
        self.addrs
            .iter()
            .find_map(|a| match a {
                ListenAddr::Inet(addr) => Some(*addr),
                ListenAddr::Local(_) => None,
            })
            .unwrap()
    }

    fn current(&self) -> usize {
        self.state.table().current()
    }

    fn stop(self, reason: ShutdownReason) -> ShutdownReason {
        self.shutdown.trigger(reason);
        self.thread.join().unwrap()
    }
}

fn loopback() -> DaemonPorts {
    DaemonPorts::plain(0, [IpAddr::V4(Ipv4Addr::LOCALHOST)])
}

fn config(capacity: usize, reserved: usize) -> DaemonConfig {
    DaemonConfig::new(capacity, reserved)
        .with_signal_handlers(false)
        .with_wakeup_interval(Duration::from_millis(20))
        .with_worker_threads(4)
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) => !matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
    }
}

#[test]
fn reserved_descriptors_cap_concurrent_connections() {
    let daemon = Running::start(config(10, 2), loopback(), Collaborators::new(DiscardHandler));
    let addr = daemon.inet();

    let mut clients: Vec<TcpStream> = (0..8).map(|_| TcpStream::connect(addr).unwrap()).collect();
    assert!(wait_for(Duration::from_secs(5), || daemon.current() == 8));
    assert!(!daemon.state.table().accepting());

    let ninth = TcpStream::connect(addr).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(daemon.current(), 8);
    assert_eq!(daemon.state.table().total(), 8);

    drop(clients.remove(0));
    assert!(wait_for(Duration::from_secs(5), || daemon.state.table().total() == 9));
    assert!(wait_for(Duration::from_secs(5), || daemon.current() == 8));

    drop(ninth);
    assert_eq!(daemon.stop(ShutdownReason::Exit), ShutdownReason::Exit);
}

#[test]
fn idle_connections_time_out_and_busy_ones_survive() {
    let daemon = Running::start(
        config(16, 2).with_idle_timeout(1),
        loopback(),
        Collaborators::new(DiscardHandler),
    );
    let addr = daemon.inet();

    let started = Instant::now();
    let mut idle = TcpStream::connect(addr).unwrap();
    let mut busy = TcpStream::connect(addr).unwrap();
    idle.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    busy.set_read_timeout(Some(Duration::from_millis(50))).unwrap();

    let mut idle_closed_at = None;
    while started.elapsed() < Duration::from_millis(2500) {
        busy.write_all(b"x").unwrap();
        if idle_closed_at.is_none() && closed_by_server(&mut idle) {
            idle_closed_at = Some(started.elapsed());
        }
        thread::sleep(Duration::from_millis(250));
    }

    let closed_after = idle_closed_at.expect("idle connection was not closed");
    assert!(closed_after >= Duration::from_secs(1));
    assert!(!closed_by_server(&mut busy));
    assert_eq!(daemon.current(), 1);

    daemon.stop(ShutdownReason::Exit);
}

#[test]
fn local_socket_connections() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ldapi");
    let daemon = Running::start(
        config(16, 2),
        DaemonPorts::none().with_local_path(&path),
        Collaborators::new(DiscardHandler),
    );

    let mut client = UnixStream::connect(&path).unwrap();
    client.write_all(b"hello").unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        daemon
            .state
            .snapshot()
            .connections
            .iter()
            .any(|c| c.transport == Transport::Local && c.ops_initiated > 0)
    }));

    daemon.stop(ShutdownReason::Exit);
    assert!(!path.exists());
}

#[test]
fn pid_file_kept_on_normal_shutdown() {
    let dir = tempdir().unwrap();
    let pid_path = dir.path().join("run").join("ldapd.pid");
    let daemon = Running::start(
        config(16, 2).with_pid_file(&pid_path),
        loopback(),
        Collaborators::new(DiscardHandler),
    );
    assert!(pid_path.exists());

    assert_eq!(daemon.stop(ShutdownReason::Signal), ShutdownReason::Signal);
    assert!(pid_path.exists());
}

#[derive(Default)]
struct ShrinkingDisk {
    free: AtomicU64,
}

impl SpaceProbe for ShrinkingDisk {
    fn available(&self, _dir: &Path) -> io::Result<u64> {
        Ok(self.free.load(Ordering::SeqCst))
    }

    fn device(&self, _dir: &Path) -> io::Result<u64> {
        Ok(7)
    }
}

#[test]
fn disk_full_stops_daemon_and_removes_pid_file() {
    let dir = tempdir().unwrap();
    let pid_path = dir.path().join("ldapd.pid");
    let probe = Arc::new(ShrinkingDisk::default());
    probe.free.store(64 * 1024 * 1024, Ordering::SeqCst);

    let disk = DiskMonitorConfig::new(2 * 1024 * 1024, vec![dir.path().to_path_buf()])
        .with_intervals(Duration::from_millis(20), Duration::from_millis(10));
    let daemon = Running::start(
        config(16, 2).with_pid_file(&pid_path).with_disk_monitor(disk),
        loopback(),
        Collaborators::new(DiscardHandler).with_probe(probe.clone()),
    );
    let mut client = TcpStream::connect(daemon.inet()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    assert!(wait_for(Duration::from_secs(5), || daemon.current() == 1));

    probe.free.store(1024, Ordering::SeqCst);
    let reason = daemon.thread.join().unwrap();
    assert_eq!(reason, ShutdownReason::DiskFull);
    assert!(!pid_path.exists());
    assert!(closed_by_server(&mut client));
}

/// Reads one request, then holds an operation open for a while.
struct SlowOperations {
    hold: Duration,
    release_reader: bool,
    running: AtomicUsize,
    peak: AtomicUsize,
    started: AtomicUsize,
    abandoned: Mutex<Option<(u64, Instant)>>,
}

impl SlowOperations {
    fn new(hold: Duration, release_reader: bool) -> Arc<Self> {
        Arc::new(Self {
            hold,
            release_reader,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            abandoned: Mutex::new(None),
        })
    }

    fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ConnectionHandler for SlowOperations {
    fn activity(&self, activity: &mut Activity<'_>) -> io::Result<()> {
        let mut buf = [0u8; 64];
        let mut read = 0;
        loop {
            let mut socket = activity.socket();
            match socket.read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => read += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if read == 0 {
            return Ok(());
        }

        activity.begin_operation();
        if self.release_reader {
            activity.done_reading();
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        self.started.fetch_add(1, Ordering::SeqCst);

        thread::sleep(self.hold);

        self.running.fetch_sub(1, Ordering::SeqCst);
        activity.end_operation();
        Ok(())
    }

    fn abandon_operations(&self, conn: &mut Connection) {
        let mut abandoned = self.abandoned.lock().unwrap();
        abandoned.get_or_insert((conn.pending_operations(), Instant::now()));
    }
}

fn with_handler(handler: &Arc<SlowOperations>) -> Collaborators {
    let handler: Arc<dyn ConnectionHandler> = handler.clone();
    Collaborators {
        handler,
        ..Collaborators::new(DiscardHandler)
    }
}

fn send_spaced(addr: SocketAddr, requests: usize) -> TcpStream {
    let mut client = TcpStream::connect(addr).unwrap();
    for _ in 0..requests {
        client.write_all(b"x").unwrap();
        thread::sleep(Duration::from_millis(100));
    }
    client
}

#[test]
fn done_reading_lets_workers_overlap_up_to_cap() {
    let handler = SlowOperations::new(Duration::from_millis(600), true);
    let daemon = Running::start(
        config(16, 2).with_max_threads_per_conn(2),
        loopback(),
        with_handler(&handler),
    );

    let _client = send_spaced(daemon.inet(), 3);
    assert!(wait_for(Duration::from_secs(5), || handler.started() == 3));
    assert_eq!(handler.peak(), 2);

    daemon.stop(ShutdownReason::Exit);
}

#[test]
fn reader_holds_connection_until_released() {
    let handler = SlowOperations::new(Duration::from_millis(300), false);
    let daemon = Running::start(
        config(16, 2).with_max_threads_per_conn(4),
        loopback(),
        with_handler(&handler),
    );

    let _client = send_spaced(daemon.inet(), 3);
    assert!(wait_for(Duration::from_secs(5), || handler.started() >= 2));
    thread::sleep(Duration::from_millis(400));
    assert_eq!(handler.peak(), 1);

    daemon.stop(ShutdownReason::Exit);
}

#[test]
fn shutdown_abandons_before_waiting_for_workers() {
    let hold = Duration::from_millis(1500);
    let handler = SlowOperations::new(hold, true);
    let daemon = Running::start(
        config(16, 2),
        loopback(),
        with_handler(&handler),
    );

    let _client = send_spaced(daemon.inet(), 1);
    assert!(wait_for(Duration::from_secs(5), || handler.started() == 1));

    let triggered = Instant::now();
    assert_eq!(daemon.stop(ShutdownReason::Exit), ShutdownReason::Exit);
    assert!(triggered.elapsed() >= Duration::from_millis(500));

    let abandoned = *handler.abandoned.lock().unwrap();
    let (pending, at) = abandoned.expect("operations were not abandoned");
    assert_eq!(pending, 1);
    assert!(at.duration_since(triggered) < Duration::from_secs(1));
}
