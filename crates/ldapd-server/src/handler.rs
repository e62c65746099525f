//! Protocol-layer collaborator.
//!
//! The connection core never parses requests. When a socket becomes
//! readable a worker thread calls [`ConnectionHandler::activity`] and the
//! handler consumes whatever bytes are available. The worker reads through
//! its own socket handle; the slot is locked only for the short state
//! updates [`Activity`] makes.

use std::io::{self, Read};
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

use crate::connection::{Connection, DisconnectReason, Socket};
use crate::conntable::{ConnectionTable, SlotId};
use crate::reslimit::ResourceLimits;

/// Callbacks from the connection core into the protocol layer.
pub trait ConnectionHandler: Send + Sync {
    /// Called before a new connection is activated. An error drops it.
    fn on_open(&self, _conn: &Connection) -> io::Result<()> {
        Ok(())
    }

    /// Consumes readable data.
    ///
    /// Call [`Activity::done_reading`] once the request bytes are in, so the
    /// event loop watches the socket again while the operation runs. Any
    /// error disconnects only this connection; `UnexpectedEof` is reported
    /// as a client close.
    fn activity(&self, activity: &mut Activity<'_>) -> io::Result<()>;

    /// Abandons in-flight operations at shutdown. Runs with the slot locked
    /// and must not wait for the operations themselves.
    fn abandon_operations(&self, _conn: &mut Connection) {}

    /// Called once after the server closed a connection.
    fn on_disconnect(&self, _conn_id: u64, _reason: DisconnectReason) {}
}

/// A worker's view of one readable connection.
pub struct Activity<'a> {
    table: &'a ConnectionTable,
    limits: &'a ResourceLimits,
    slot: SlotId,
    conn_id: u64,
    socket: Arc<Socket>,
    released: bool,
}

impl<'a> Activity<'a> {
    /// Resolves limits on first use and takes a socket handle for a slot
    /// claimed with [`ConnectionTable::begin_activity`]. `None` if the
    /// connection closed in between.
    pub(crate) fn open(table: &'a ConnectionTable, limits: &'a ResourceLimits, slot: SlotId) -> Option<Self> {
        let (conn_id, socket) = table.with_connection(slot, |conn| {
            limits.ensure_resolved(conn);
            (conn.id(), conn.socket_handle())
        })?;
        Some(Self {
            table,
            limits,
            slot,
            conn_id,
            socket,
            released: false,
        })
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Runs `f` with the slot locked. `None` once the connection is closing.
    pub fn with_connection<R>(&self, f: impl FnOnce(&Connection) -> R) -> Option<R> {
        self.table.with_connection(self.slot, |conn| f(conn))
    }

    /// Records a completed bind and re-resolves limits for the new
    /// identity. Returns the new idle timeout.
    pub fn bind(&mut self, dn: Option<&str>) -> Option<u64> {
        let is_root = dn.is_some_and(|dn| self.limits.is_root(dn));
        let limits = self.limits;
        self.table.with_connection(self.slot, |conn| {
            conn.set_bind(dn, is_root);
            limits.resolve_idle_timeout(conn)
        })
    }

    /// Signals that the request bytes have been consumed. Only the first
    /// call releases the reader; later ones are no-ops.
    pub fn done_reading(&mut self) {
        if !self.released {
            self.released = true;
            self.table.with_connection(self.slot, Connection::done_reading);
        }
    }

    /// Counts a new operation; the connection is not idle until it ends.
    pub fn begin_operation(&mut self) -> Option<u64> {
        self.table.with_connection(self.slot, Connection::begin_operation)
    }

    pub fn end_operation(&mut self) {
        self.table
            .with_connection(self.slot, |conn| conn.end_operation(Instant::now()));
    }
}

/// Reads and discards client data, counting each read as one operation.
///
/// Stands in for the protocol decoder when the core runs on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardHandler;

impl ConnectionHandler for DiscardHandler {
    fn activity(&self, activity: &mut Activity<'_>) -> io::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            let read = {
                let mut socket = activity.socket();
                socket.read(&mut buf)
            };
            match read {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                Ok(n) => {
                    activity.begin_operation();
                    activity.end_operation();
                    trace!(conn = activity.conn_id(), bytes = n, "Discarded request bytes");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    activity.done_reading();
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
