//! Process-wide shutdown state.
//!
//! [`ShutdownFlag`] is a single atomic byte so it can be written from a
//! signal handler. It only ever moves forward: once a reason other than
//! [`ShutdownReason::Running`] is stored, later writes are ignored.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Why the server is (or is not) terminating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ShutdownReason {
    /// Normal operation.
    Running = 0,
    /// A terminate, interrupt or hangup signal arrived.
    Signal = 1,
    /// The disk monitor ran out of room.
    DiskFull = 2,
    /// Requested from inside the process.
    Exit = 3,
}

impl ShutdownReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Signal,
            2 => Self::DiskFull,
            _ => Self::Exit,
        }
    }

    /// Returns a short lowercase name, used in log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Signal => "signal",
            Self::DiskFull => "disk_full",
            Self::Exit => "exit",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic first-write-wins shutdown flag.
///
/// All methods are lock free and async-signal-safe.
#[derive(Debug)]
pub struct ShutdownFlag(AtomicU8);

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownFlag {
    /// Creates a flag in the running state.
    pub const fn new() -> Self {
        Self(AtomicU8::new(ShutdownReason::Running as u8))
    }

    /// Returns the current reason.
    pub fn get(&self) -> ShutdownReason {
        ShutdownReason::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Returns true while no shutdown has been requested.
    pub fn is_running(&self) -> bool {
        self.get() == ShutdownReason::Running
    }

    /// Records `reason` if the flag is still running.
    ///
    /// Returns true if this call performed the transition. Setting
    /// [`ShutdownReason::Running`] is always a no-op.
    pub fn set(&self, reason: ShutdownReason) -> bool {
        if reason == ShutdownReason::Running {
            return false;
        }
        self.0
            .compare_exchange(
                ShutdownReason::Running as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}
