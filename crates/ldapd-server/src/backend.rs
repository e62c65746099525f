//! Storage-layer collaborator.

use std::path::PathBuf;

/// Calls from the connection core into the backend layer.
pub trait Backends: Send + Sync {
    /// Stops persistent-search and other long-poll deliveries.
    fn stop_live_updates(&self) {}

    /// Closes all backends and plugins, in dependency order. Called once.
    fn close_all(&self) {}

    /// Directories holding backend data and transaction logs.
    fn data_directories(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    /// User backends currently accepting writes.
    fn writable_backends(&self) -> Vec<String> {
        Vec::new()
    }

    fn set_read_only(&self, _backend: &str, _read_only: bool) {}
}

/// No backends at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBackends;

impl Backends for NoBackends {}
