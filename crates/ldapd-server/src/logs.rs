//! Log configuration toggles used by the disk monitor.
//!
//! [`LogSettings`] keeps the toggles in atomics; the daemon consults
//! [`LogKind::Access`] before emitting access events. Rotated files in the
//! log directory follow the `<name>.<suffix>` convention next to the active
//! `<name>` file.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Logs the disk monitor may switch off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Access,
    Audit,
    AuditFail,
}

impl LogKind {
    pub const ALL: [LogKind; 3] = [LogKind::Access, LogKind::Audit, LogKind::AuditFail];

    /// Base file name of the active log.
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Access => "access",
            Self::Audit => "audit",
            Self::AuditFail => "auditfail",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Calls from the connection core into the logging configuration.
pub trait LogControl: Send + Sync {
    fn error_log_level(&self) -> u32;

    fn default_error_log_level(&self) -> u32;

    fn set_error_log_level(&self, level: u32);

    /// True when the error log level is above the default.
    fn verbose_error_logging(&self) -> bool {
        let level = self.error_log_level();
        level != 0 && level != self.default_error_log_level()
    }

    fn is_enabled(&self, kind: LogKind) -> bool;

    fn set_enabled(&self, kind: LogKind, enabled: bool);

    /// Deletes rotated log files, returning how many were removed.
    fn delete_rotated_logs(&self) -> io::Result<usize>;

    fn flush(&self) {}

    fn log_directories(&self) -> Vec<PathBuf>;
}

/// Default error log level.
pub const DEFAULT_ERROR_LOG_LEVEL: u32 = 16384;

const ROTATED_BASES: [&str; 4] = ["access", "audit", "auditfail", "errors"];

/// In-process log settings.
#[derive(Debug)]
pub struct LogSettings {
    directory: Option<PathBuf>,
    access: AtomicBool,
    audit: AtomicBool,
    audit_fail: AtomicBool,
    error_level: AtomicU32,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            directory: None,
            access: AtomicBool::new(true),
            audit: AtomicBool::new(false),
            audit_fail: AtomicBool::new(false),
            error_level: AtomicU32::new(DEFAULT_ERROR_LOG_LEVEL),
        }
    }
}

impl LogSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the log directory.
    pub fn with_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.directory = Some(dir.into());
        self
    }

    /// Builder: enable or disable a log.
    pub fn with_enabled(self, kind: LogKind, enabled: bool) -> Self {
        self.flag(kind).store(enabled, Ordering::Release);
        self
    }

    /// Builder: set the error log level.
    pub fn with_error_level(self, level: u32) -> Self {
        self.error_level.store(level, Ordering::Release);
        self
    }

    fn flag(&self, kind: LogKind) -> &AtomicBool {
        match kind {
            LogKind::Access => &self.access,
            LogKind::Audit => &self.audit,
            LogKind::AuditFail => &self.audit_fail,
        }
    }
}

impl LogControl for LogSettings {
    fn error_log_level(&self) -> u32 {
        self.error_level.load(Ordering::Acquire)
    }

    fn default_error_log_level(&self) -> u32 {
        DEFAULT_ERROR_LOG_LEVEL
    }

    fn set_error_log_level(&self, level: u32) {
        self.error_level.store(level, Ordering::Release);
    }

    fn is_enabled(&self, kind: LogKind) -> bool {
        self.flag(kind).load(Ordering::Acquire)
    }

    fn set_enabled(&self, kind: LogKind, enabled: bool) {
        self.flag(kind).store(enabled, Ordering::Release);
    }

    fn delete_rotated_logs(&self) -> io::Result<usize> {
        let Some(ref dir) = self.directory else {
            return Ok(0);
        };
        let mut removed = 0;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some((base, suffix)) = name.split_once('.') else {
                continue;
            };
            if !ROTATED_BASES.contains(&base) || suffix.is_empty() || suffix == "rotationinfo" {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(file = name, "Deleted rotated log");
                    removed += 1;
                }
                Err(e) => warn!(file = name, error = %e, "Failed to delete rotated log"),
            }
        }
        Ok(removed)
    }

    fn log_directories(&self) -> Vec<PathBuf> {
        self.directory.iter().cloned().collect()
    }
}
