//! Disk-space monitor.
//!
//! Runs on its own thread and degrades the server step by step as free
//! space on any monitored filesystem drops:
//!
//! 1. below the threshold: reset verbose error logging, then disable the
//!    access and audit logs, then delete rotated logs (one action per pass)
//! 2. below half the threshold: wait out the grace period, then shut down
//! 3. below [`CRITICAL_FLOOR`]: shut down at once
//!
//! Recovery above the threshold undoes every step that was taken.

use std::collections::HashSet;
use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ldapd_core::ShutdownReason;
use tracing::{debug, error, info, warn};

use crate::backend::Backends;
use crate::config::DiskMonitorConfig;
use crate::logs::{LogControl, LogKind};
use crate::signals::ShutdownHandle;

/// Free space below which the server stops immediately.
pub const CRITICAL_FLOOR: u64 = 4096;

/// Free-space lookups.
pub trait SpaceProbe: Send + Sync {
    /// Bytes available to unprivileged users on the filesystem of `dir`.
    fn available(&self, dir: &Path) -> io::Result<u64>;

    /// Device id of the filesystem holding `dir`.
    fn device(&self, dir: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    fn available(&self, dir: &Path) -> io::Result<u64> {
        let path = CString::new(dir.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: all-zero is a valid statvfs and the path is NUL terminated.
        let mut stat: libc::statvfs = unsafe { mem::zeroed() };
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::unnecessary_cast)]
        let bytes = stat.f_bavail as u64 * stat.f_frsize as u64;
        Ok(bytes)
    }

    fn device(&self, dir: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(dir)?.dev())
    }
}

/// The fullest monitored directory under the threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowDisk {
    pub directory: PathBuf,
    pub available: u64,
}

/// Outcome of one monitoring pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Healthy,
    Degraded,
    Shutdown,
    Stopped,
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    /// Sleeps up to `timeout`; returns true if a stop was requested.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_all();
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    threshold_passed: bool,
    verbose_reset: Option<u32>,
    logs_disabled: bool,
    rotated_deleted: bool,
    logs_in_use: HashSet<LogKind>,
    read_only: Vec<String>,
    previous_mark: u64,
}

/// Watches free space and reacts through the log, backend and shutdown
/// handles.
pub struct DiskMonitor {
    config: DiskMonitorConfig,
    probe: Arc<dyn SpaceProbe>,
    logs: Arc<dyn LogControl>,
    backends: Arc<dyn Backends>,
    shutdown: ShutdownHandle,
    stop: Arc<StopSignal>,
    state: MonitorState,
}

impl DiskMonitor {
    pub fn new(
        config: DiskMonitorConfig,
        probe: Arc<dyn SpaceProbe>,
        logs: Arc<dyn LogControl>,
        backends: Arc<dyn Backends>,
        shutdown: ShutdownHandle,
    ) -> Self {
        Self {
            config,
            probe,
            logs,
            backends,
            shutdown,
            stop: Arc::new(StopSignal::default()),
            state: MonitorState::default(),
        }
    }

    /// Monitored directories, one per filesystem.
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut candidates = self.config.directories.clone();
        candidates.extend(self.logs.log_directories());
        candidates.extend(self.backends.data_directories());

        let mut devices = HashSet::new();
        let mut dirs = Vec::new();
        for dir in candidates {
            match self.probe.device(&dir) {
                Ok(dev) => {
                    if devices.insert(dev) {
                        dirs.push(dir);
                    }
                }
                Err(e) => debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory"),
            }
        }
        dirs
    }

    /// Finds the directory with the least space below `threshold`.
    pub fn lowest_below(&self, threshold: u64) -> Option<LowDisk> {
        self.directories()
            .into_iter()
            .filter_map(|dir| match self.probe.available(&dir) {
                Ok(available) => Some(LowDisk {
                    directory: dir,
                    available,
                }),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Failed to read free space");
                    None
                }
            })
            .filter(|low| low.available < threshold)
            .min_by_key(|low| low.available)
    }

    /// Runs one pass.
    pub fn step(&mut self) -> Step {
        if self.stop.is_stopped() {
            return Step::Stopped;
        }
        for kind in LogKind::ALL {
            if self.logs.is_enabled(kind) {
                self.state.logs_in_use.insert(kind);
            }
        }

        let Some(low) = self.lowest_below(self.config.threshold) else {
            if self.state.threshold_passed {
                info!("Disk space is now within acceptable levels");
                self.recover();
            }
            return Step::Healthy;
        };

        if !self.state.threshold_passed {
            warn!(
                dir = %low.directory.display(),
                available = low.available,
                threshold = self.config.threshold,
                "Disk space is low on {}",
                low.directory.display()
            );
            self.state.threshold_passed = true;
            self.state.previous_mark = low.available;
        }

        if low.available < CRITICAL_FLOOR {
            return self.critical(&low);
        }

        if self.config.readonly_on_threshold {
            self.set_read_only();
        }

        if self.state.verbose_reset.is_none() && self.logs.verbose_error_logging() {
            let level = self.logs.error_log_level();
            self.logs.set_error_log_level(self.logs.default_error_log_level());
            self.state.verbose_reset = Some(level);
            warn!(
                dir = %low.directory.display(),
                available = low.available,
                "Disk space is low, verbose error logging disabled"
            );
            return Step::Degraded;
        }

        if !self.state.logs_disabled && !self.config.logging_critical {
            for kind in LogKind::ALL {
                self.logs.set_enabled(kind, false);
            }
            self.state.logs_disabled = true;
            warn!(
                dir = %low.directory.display(),
                available = low.available,
                "Disk space is too low, disabling access and audit logging"
            );
            return Step::Degraded;
        }

        if !self.state.rotated_deleted && !self.config.logging_critical {
            match self.logs.delete_rotated_logs() {
                Ok(removed) => warn!(
                    dir = %low.directory.display(),
                    available = low.available,
                    removed,
                    "Disk space is too low, deleted rotated logs"
                ),
                Err(e) => error!(error = %e, "Failed to delete rotated logs"),
            }
            self.state.rotated_deleted = true;
            return Step::Degraded;
        }

        if low.available < self.state.previous_mark {
            warn!(
                dir = %low.directory.display(),
                available = low.available,
                "Disk space is critically low on {}",
                low.directory.display()
            );
            self.state.previous_mark = low.available.saturating_sub(512);
        }

        if low.available < self.config.halfway() {
            return self.grace_period(low);
        }
        Step::Degraded
    }

    fn grace_period(&mut self, low: LowDisk) -> Step {
        let grace = self.config.grace();
        warn!(
            dir = %low.directory.display(),
            available = low.available,
            grace_secs = grace.as_secs(),
            "Disk space below half the threshold, shutting down unless space is freed"
        );

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.stop.wait(self.config.recheck_interval().min(remaining)) || self.shutdown.is_shutdown() {
                return Step::Stopped;
            }
            match self.lowest_below(self.config.threshold) {
                None => {
                    info!("Disk space is now within acceptable levels");
                    self.recover();
                    return Step::Healthy;
                }
                Some(low) if low.available < CRITICAL_FLOOR => return self.critical(&low),
                Some(_) => {}
            }
        }

        error!(
            dir = %low.directory.display(),
            "Disk space is still too low after the grace period, shutting down"
        );
        self.restore_backends();
        self.shutdown.trigger(ShutdownReason::DiskFull);
        Step::Shutdown
    }

    fn critical(&mut self, low: &LowDisk) -> Step {
        error!(
            dir = %low.directory.display(),
            available = low.available,
            "Disk space is critically low, shutting down"
        );
        if !self.state.read_only.is_empty() {
            error!(
                backends = ?self.state.read_only,
                "Backends left read-only, reset them manually once space is freed"
            );
        }
        self.shutdown.trigger(ShutdownReason::DiskFull);
        Step::Shutdown
    }

    fn set_read_only(&mut self) {
        if !self.state.read_only.is_empty() {
            return;
        }
        for backend in self.backends.writable_backends() {
            self.backends.set_read_only(&backend, true);
            warn!(backend = %backend, "Backend set to read-only");
            self.state.read_only.push(backend);
        }
    }

    fn restore_backends(&mut self) {
        for backend in self.state.read_only.drain(..) {
            self.backends.set_read_only(&backend, false);
            info!(backend = %backend, "Backend restored to read-write");
        }
    }

    fn recover(&mut self) {
        self.restore_backends();
        if self.state.logs_disabled {
            for kind in &self.state.logs_in_use {
                self.logs.set_enabled(*kind, true);
                info!(log = %kind, "Restored logging");
            }
        }
        if let Some(level) = self.state.verbose_reset {
            self.logs.set_error_log_level(level);
        }
        self.state = MonitorState::default();
    }

    /// Starts the monitor thread.
    pub fn spawn(mut self) -> io::Result<DiskMonitorHandle> {
        let stop = Arc::clone(&self.stop);
        let interval = self.config.poll_interval();
        let thread = thread::Builder::new()
            .name("ldapd-diskmon".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Disk monitor started");
                loop {
                    if matches!(self.step(), Step::Shutdown | Step::Stopped) {
                        break;
                    }
                    if self.stop.wait(interval) || self.shutdown.is_shutdown() {
                        break;
                    }
                }
                debug!("Disk monitor stopped");
            })?;
        Ok(DiskMonitorHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Handle to the running monitor thread.
#[derive(Debug)]
pub struct DiskMonitorHandle {
    stop: Arc<StopSignal>,
    thread: Option<JoinHandle<()>>,
}

impl DiskMonitorHandle {
    /// Wakes the monitor and waits for it to exit.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            error!("Disk monitor thread panicked");
        }
    }
}

impl Drop for DiskMonitorHandle {
    fn drop(&mut self) {
        self.join();
    }
}
