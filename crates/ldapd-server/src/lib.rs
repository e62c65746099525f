//! Connection core of the ldapd directory server.
//!
//! This crate accepts and multiplexes client connections for the protocol
//! layer:
//! - Connection slot table with an intrusive active list
//! - Plain, secure and local (LDAPI) listeners
//! - `mio` event loop dispatching to a worker pool
//! - Per-identity idle timeout resolution
//! - Disk-space monitor with graceful degradation
//! - Signal-driven shutdown
//!
//! # Example
//!
//! ```rust,no_run
//! use ldapd_server::{Collaborators, Daemon, DaemonConfig, DaemonPorts, DiscardHandler};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let daemon = Daemon::new(
//!         DaemonConfig::default(),
//!         &DaemonPorts::default(),
//!         Collaborators::new(DiscardHandler),
//!     )?;
//!     let reason = daemon.run()?;
//!     println!("stopped: {reason}");
//!     Ok(())
//! }
//! ```

mod backend;
mod config;
mod connection;
mod conntable;
mod daemon;
mod diskmon;
mod error;
mod handler;
mod listener;
mod logs;
mod pidfile;
mod reactor;
mod reslimit;
mod signals;
mod workers;

pub use ldapd_core::{ShutdownFlag, ShutdownReason};

pub use backend::{Backends, NoBackends};
pub use config::{DaemonConfig, DaemonPorts, DiskMonitorConfig};
pub use connection::{Connection, DisconnectReason, PeerAddr, Socket, TlsSession, Transport};
pub use conntable::{ConnectionRecord, ConnectionTable, Pollable, SlotId, TableSnapshot};
pub use daemon::{ACCESS_LOG_TARGET, Collaborators, Daemon, DaemonState};
pub use diskmon::{
    CRITICAL_FLOOR, DiskMonitor, DiskMonitorHandle, LowDisk, SpaceProbe, StatvfsProbe, Step,
};
pub use error::{ServerError, ServerResult};
pub use handler::{Activity, ConnectionHandler, DiscardHandler};
pub use listener::{AcceptPolicy, ListenAddr, Listener, ListenerSet, TlsAcceptor};
pub use logs::{DEFAULT_ERROR_LOG_LEVEL, LogControl, LogKind, LogSettings};
pub use pidfile::PidFile;
pub use reactor::{MioReactor, Reactor, Readiness, Token, Waker};
pub use reslimit::{IDLE_TIMEOUT_LIMIT, LimitHandle, LimitSource, ResourceLimits, StaticLimits};
pub use signals::{ShutdownHandle, SignalRegistration, install as install_signal_handlers};
pub use workers::WorkerPool;
