//! Daemon configuration.
//!
//! Every struct here deserializes with `#[serde(default)]`, so a partial
//! TOML table only overrides the fields it names.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Connection core settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Number of connection slots.
    pub conntable_size: usize,

    /// Upper bound on descriptors; caps the table size.
    pub max_descriptors: usize,

    /// Descriptors kept free for backends, logs and plugins.
    pub reserved_descriptors: usize,

    /// `listen()` backlog for every listener.
    pub listen_backlog: i32,

    /// Server-wide idle timeout in seconds, 0 disables it.
    pub idle_timeout: u64,

    /// Upper bound on one readiness wait, in milliseconds.
    pub wakeup_interval_ms: u64,

    /// Worker threads one connection may occupy at once.
    pub max_threads_per_conn: usize,

    /// Size of the worker pool.
    pub worker_threads: usize,

    /// Leave Nagle's algorithm on for TCP connections.
    pub enable_nagle: bool,

    /// Move accepted descriptors above the reserved range.
    pub renumber_descriptors: bool,

    /// Permissions applied to the local socket after bind.
    pub local_socket_mode: u32,

    /// Where to write the PID file once listening.
    pub pid_file: Option<PathBuf>,

    /// Identity that is never subject to resource limits.
    pub root_dn: String,

    /// Identity whose limits apply to anonymous connections.
    pub anon_limits_dn: Option<String>,

    /// Seconds to wait for busy workers during shutdown.
    pub shutdown_timeout: u64,

    /// Install SIGTERM/SIGINT/SIGHUP/SIGCHLD/SIGPIPE handlers.
    pub handle_signals: bool,

    /// Disk space monitoring.
    pub disk: DiskMonitorConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            conntable_size: 4096,
            max_descriptors: 4096,
            reserved_descriptors: 64,
            listen_backlog: 128,
            idle_timeout: 0,
            wakeup_interval_ms: 250,
            max_threads_per_conn: 5,
            worker_threads: 16,
            enable_nagle: false,
            renumber_descriptors: true,
            local_socket_mode: 0o666,
            pid_file: None,
            root_dn: "cn=Directory Manager".to_string(),
            anon_limits_dn: None,
            shutdown_timeout: 30,
            handle_signals: true,
            disk: DiskMonitorConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Creates a configuration with the given table size and reservation.
    pub fn new(conntable_size: usize, reserved_descriptors: usize) -> Self {
        Self {
            conntable_size,
            max_descriptors: conntable_size.max(Self::default().max_descriptors),
            reserved_descriptors,
            ..Default::default()
        }
    }

    /// Builder: set the server-wide idle timeout in seconds.
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.idle_timeout = secs;
        self
    }

    /// Builder: set the readiness wait bound.
    pub fn with_wakeup_interval(mut self, interval: Duration) -> Self {
        self.wakeup_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Builder: set the worker pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Builder: set the per-connection thread cap.
    pub fn with_max_threads_per_conn(mut self, threads: usize) -> Self {
        self.max_threads_per_conn = threads;
        self
    }

    /// Builder: set the PID file path.
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Builder: set the anonymous limits identity.
    pub fn with_anon_limits_dn(mut self, dn: impl Into<String>) -> Self {
        self.anon_limits_dn = Some(dn.into());
        self
    }

    /// Builder: toggle process signal handlers.
    pub fn with_signal_handlers(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Builder: set the disk monitor configuration.
    pub fn with_disk_monitor(mut self, disk: DiskMonitorConfig) -> Self {
        self.disk = disk;
        self
    }

    /// Effective number of slots.
    pub fn table_capacity(&self) -> usize {
        self.conntable_size.min(self.max_descriptors)
    }

    pub fn wakeup_interval(&self) -> Duration {
        Duration::from_millis(self.wakeup_interval_ms)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Checks values the daemon cannot start with.
    pub fn validate(&self) -> ServerResult<()> {
        let capacity = self.table_capacity();
        if capacity <= self.reserved_descriptors {
            return Err(ServerError::InsufficientDescriptors {
                capacity,
                reserved: self.reserved_descriptors,
            });
        }
        if self.worker_threads == 0 {
            return Err(ServerError::config("worker_threads must be at least 1"));
        }
        if self.max_threads_per_conn == 0 {
            return Err(ServerError::config("max_threads_per_conn must be at least 1"));
        }
        if self.wakeup_interval_ms == 0 {
            return Err(ServerError::config("wakeup_interval_ms must be positive"));
        }
        if self.local_socket_mode > 0o777 {
            return Err(ServerError::config(format!(
                "local_socket_mode {:o} is not a permission mask",
                self.local_socket_mode
            )));
        }
        self.disk.validate()
    }
}

/// Disk space monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskMonitorConfig {
    /// Run the monitor thread.
    pub enabled: bool,

    /// Free bytes below which the monitor starts degrading.
    pub threshold: u64,

    /// Seconds to wait below half the threshold before shutting down.
    pub grace_period_secs: u64,

    /// Keep access and audit logging on under pressure.
    pub logging_critical: bool,

    /// Put writable backends in read-only mode while below threshold.
    pub readonly_on_threshold: bool,

    /// Milliseconds between regular checks.
    pub poll_interval_ms: u64,

    /// Milliseconds between checks during the grace period.
    pub recheck_interval_ms: u64,

    /// Directories watched in addition to log and backend directories.
    pub directories: Vec<PathBuf>,
}

impl Default for DiskMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 2 * 1024 * 1024,
            grace_period_secs: 60 * 60,
            logging_critical: false,
            readonly_on_threshold: false,
            poll_interval_ms: 10_000,
            recheck_interval_ms: 1_000,
            directories: vec![PathBuf::from("/var")],
        }
    }
}

impl DiskMonitorConfig {
    /// Enabled monitor watching `directories` with the given threshold.
    pub fn new(threshold: u64, directories: Vec<PathBuf>) -> Self {
        Self {
            enabled: true,
            threshold,
            directories,
            ..Default::default()
        }
    }

    /// Builder: set the grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period_secs = grace.as_secs();
        self
    }

    /// Builder: set the polling cadence.
    pub fn with_intervals(mut self, poll: Duration, recheck: Duration) -> Self {
        self.poll_interval_ms = poll.as_millis() as u64;
        self.recheck_interval_ms = recheck.as_millis() as u64;
        self
    }

    /// Builder: set logging-critical.
    pub fn with_logging_critical(mut self, critical: bool) -> Self {
        self.logging_critical = critical;
        self
    }

    /// Builder: set readonly-on-threshold.
    pub fn with_readonly_on_threshold(mut self, readonly: bool) -> Self {
        self.readonly_on_threshold = readonly;
        self
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }

    /// Half of the threshold, where the grace period starts.
    pub fn halfway(&self) -> u64 {
        self.threshold / 2
    }

    fn validate(&self) -> ServerResult<()> {
        if self.enabled && self.threshold == 0 {
            return Err(ServerError::config("disk threshold must be positive"));
        }
        if self.enabled && (self.poll_interval_ms == 0 || self.recheck_interval_ms == 0) {
            return Err(ServerError::config("disk monitor intervals must be positive"));
        }
        Ok(())
    }
}

/// Requested listeners.
///
/// `None` disables a transport. A port of `Some(0)` binds an ephemeral
/// port, which tests rely on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonPorts {
    /// Plaintext LDAP port.
    pub plain_port: Option<u16>,

    /// LDAPS port.
    pub secure_port: Option<u16>,

    /// LDAPI (Unix-domain) socket path.
    pub local_path: Option<PathBuf>,

    /// Addresses the plain port binds to.
    pub listen_addrs: Vec<IpAddr>,

    /// Addresses the secure port binds to, defaults to `listen_addrs`.
    pub secure_listen_addrs: Vec<IpAddr>,
}

impl Default for DaemonPorts {
    fn default() -> Self {
        Self {
            plain_port: Some(389),
            secure_port: None,
            local_path: None,
            listen_addrs: vec![IpAddr::V4(Ipv4Addr::UNSPECIFIED)],
            secure_listen_addrs: Vec::new(),
        }
    }
}

impl DaemonPorts {
    /// No listeners at all.
    pub fn none() -> Self {
        Self {
            plain_port: None,
            listen_addrs: Vec::new(),
            ..Default::default()
        }
    }

    /// Plain listener on `port` for each of `addrs`.
    pub fn plain(port: u16, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            plain_port: Some(port),
            listen_addrs: addrs.into_iter().collect(),
            ..Self::none()
        }
    }

    /// Builder: set the secure port.
    pub fn with_secure_port(mut self, port: u16) -> Self {
        self.secure_port = Some(port);
        self
    }

    /// Builder: set the local socket path.
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Addresses for the secure port.
    pub fn secure_addrs(&self) -> &[IpAddr] {
        if self.secure_listen_addrs.is_empty() {
            &self.listen_addrs
        } else {
            &self.secure_listen_addrs
        }
    }

    /// True when no transport is enabled.
    pub fn is_empty(&self) -> bool {
        self.plain_port.is_none() && self.secure_port.is_none() && self.local_path.is_none()
    }
}
