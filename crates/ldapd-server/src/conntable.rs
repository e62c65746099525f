//! Connection slot table.
//!
//! A fixed array of slots, each behind its own mutex, plus a table lock
//! that only guards the free pool and the intrusive active list. Lock order
//! is always slot, then table; enumeration takes the table lock alone and
//! never waits on a slot it is not visiting. Slot locks are only held to
//! read or update connection state, never across handler work.
//!
//! A slot's socket is open iff the slot holds a connection. Closing
//! connections stay linked until the event loop unlinks them, and return to
//! the free pool once unlinked with no worker left inside.

use std::collections::VecDeque;
use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};

use crate::connection::{Connection, DisconnectReason, Transport};
use crate::error::{ServerError, ServerResult};
use crate::reactor::Waker;

/// Identifies one use of a slot.
///
/// The generation changes every time the slot is handed out, so a stale id
/// never reaches the slot's next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    index: usize,
    generation: u64,
}

impl SlotId {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

/// A slot the event loop should watch this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pollable {
    pub id: SlotId,
    pub fd: RawFd,
}

#[derive(Debug, Default)]
struct SlotInner {
    generation: u64,
    conn: Option<Connection>,
    reserved: bool,
    retired: bool,
}

#[derive(Debug, Default)]
struct Slot {
    generation: AtomicU64,
    inner: Mutex<SlotInner>,
}

/// Free pool plus a circular doubly linked list with a sentinel at
/// index `capacity`.
#[derive(Debug)]
struct ActiveList {
    next: Vec<usize>,
    prev: Vec<usize>,
    linked: Vec<bool>,
    free: VecDeque<usize>,
}

impl ActiveList {
    fn new(capacity: usize) -> Self {
        let head = capacity;
        Self {
            next: vec![head; capacity + 1],
            prev: vec![head; capacity + 1],
            linked: vec![false; capacity],
            free: (0..capacity).collect(),
        }
    }

    fn head(&self) -> usize {
        self.linked.len()
    }

    fn push_front(&mut self, index: usize) {
        let head = self.head();
        let first = self.next[head];
        self.next[index] = first;
        self.prev[index] = head;
        self.prev[first] = index;
        self.next[head] = index;
        self.linked[index] = true;
    }

    fn remove(&mut self, index: usize) -> bool {
        if !self.linked[index] {
            return false;
        }
        let (prev, next) = (self.prev[index], self.next[index]);
        self.next[prev] = next;
        self.prev[next] = prev;
        self.linked[index] = false;
        true
    }

    fn successor(&self, index: usize) -> Option<usize> {
        let next = self.next[index];
        (next != self.head()).then_some(next)
    }
}

/// Monitor view of the table.
#[derive(Debug, Clone, Serialize)]
pub struct TableSnapshot {
    pub capacity: usize,
    pub reserved: usize,
    pub current_connections: usize,
    pub total_connections: u64,
    pub read_waiters: usize,
    pub connections_at_max_threads: usize,
    pub max_threads_hits: u64,
    pub connections: Vec<ConnectionRecord>,
}

/// One live connection in a [`TableSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub slot: usize,
    pub connection_id: u64,
    pub opened_at: DateTime<Utc>,
    pub transport: Transport,
    pub peer: String,
    pub bind_dn: Option<String>,
    pub ops_initiated: u64,
    pub ops_completed: u64,
    pub reading: bool,
    pub threads: usize,
    pub max_threads_hits: u64,
    pub polls_blocked: u64,
}

/// Fixed-capacity table of connection slots.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Box<[Slot]>,
    list: Mutex<ActiveList>,
    reserved: usize,
    current: AtomicUsize,
    total: AtomicU64,
    next_conn_id: AtomicU64,
    max_threads_hits: AtomicU64,
    waker: Option<Waker>,
}

impl ConnectionTable {
    /// Creates a table with `capacity` slots.
    ///
    /// Fails if `reserved` leaves no room for a single connection.
    pub fn new(capacity: usize, reserved: usize) -> ServerResult<Self> {
        if capacity <= reserved {
            return Err(ServerError::InsufficientDescriptors { capacity, reserved });
        }
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Ok(Self {
            slots,
            list: Mutex::new(ActiveList::new(capacity)),
            reserved,
            current: AtomicUsize::new(0),
            total: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(1),
            max_threads_hits: AtomicU64::new(0),
            waker: None,
        })
    }

    /// Wakes `waker` whenever a slot returns to the free pool.
    pub fn with_waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Slots handed out and not yet released.
    pub fn current(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Connections activated since startup.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// True while a new connection may be accepted.
    pub fn accepting(&self) -> bool {
        let free = !self.lock_list().free.is_empty();
        free && self.capacity().saturating_sub(self.current()) > self.reserved
    }

    /// Takes a free slot, or `None` when the table is exhausted.
    pub fn acquire(&self) -> Option<SlotId> {
        loop {
            let index = self.lock_list().free.pop_front()?;
            let slot = &self.slots[index];
            let mut inner = match slot.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => {
                    let mut inner = poisoned.into_inner();
                    inner.retired = true;
                    error!(slot = index, "Retiring free slot with a poisoned lock");
                    continue;
                }
            };
            inner.generation += 1;
            inner.reserved = true;
            slot.generation.store(inner.generation, Ordering::Release);
            self.current.fetch_add(1, Ordering::AcqRel);
            return Some(SlotId {
                index,
                generation: inner.generation,
            });
        }
    }

    /// Installs `conn` in an acquired slot and links it at the head of the
    /// active list. Returns the assigned connection id.
    pub fn activate(&self, id: SlotId, mut conn: Connection) -> Option<u64> {
        let mut inner = self.lock_slot(id)?;
        if !inner.reserved || inner.conn.is_some() {
            return None;
        }
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        conn.set_id(conn_id);
        inner.conn = Some(conn);
        inner.reserved = false;
        self.lock_list().push_front(id.index);
        self.total.fetch_add(1, Ordering::AcqRel);
        Some(conn_id)
    }

    /// Gives back an acquired slot that was never activated.
    pub fn cancel(&self, id: SlotId) {
        if let Some(mut inner) = self.lock_slot(id)
            && inner.reserved
        {
            inner.reserved = false;
            self.lock_list().free.push_back(id.index);
            self.current.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Unlinks a slot from the active list.
    ///
    /// A still-active connection is closed with [`DisconnectReason::Abort`].
    /// Returns false if the slot was not linked, so a second call is a
    /// no-op.
    pub fn deactivate(&self, id: SlotId) -> bool {
        let Some(slot) = self.slots.get(id.index) else {
            return false;
        };
        let mut inner = slot.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.generation != id.generation {
            return false;
        }
        if !self.lock_list().remove(id.index) {
            return false;
        }
        if let Some(conn) = inner.conn.as_mut() {
            conn.close(DisconnectReason::Abort);
        }
        self.try_release(id.index, &mut inner);
        true
    }

    /// First slot on the active list.
    pub fn first_active(&self) -> Option<SlotId> {
        let list = self.lock_list();
        let head = list.head();
        list.successor(head).map(|index| self.id_of(index))
    }

    /// Slot after `id`, or `None` at the end or if `id` is no longer linked.
    pub fn next_active(&self, id: SlotId) -> Option<SlotId> {
        let list = self.lock_list();
        if !list.linked.get(id.index).copied().unwrap_or(false) {
            return None;
        }
        list.successor(id.index).map(|index| self.id_of(index))
    }

    /// Number of linked slots.
    pub fn active_count(&self) -> usize {
        self.lock_list().linked.iter().filter(|l| **l).count()
    }

    /// Marks a connection closing and shuts its socket down. The slot is
    /// unlinked on the event loop's next pass.
    ///
    /// Returns the connection id if this call closed it.
    pub fn disconnect(&self, id: SlotId, reason: DisconnectReason) -> Option<u64> {
        let mut inner = self.lock_slot(id)?;
        let conn = inner.conn.as_mut()?;
        conn.close(reason).then(|| conn.id())
    }

    /// Closes `id` if it has outlived its idle timeout. Busy slots are
    /// skipped.
    pub fn disconnect_if_idle(&self, id: SlotId, now: Instant) -> Option<u64> {
        let mut inner = self.try_lock_slot(id)?;
        let conn = inner.conn.as_mut()?;
        if conn.is_closing() || !conn.is_idle(now) {
            return None;
        }
        conn.close(DisconnectReason::IdleTimeout);
        Some(conn.id())
    }

    /// Collects the slots to watch this pass.
    ///
    /// Closing or poisoned slots are unlinked on the way. Slots that are
    /// mid-read, at their thread cap, or locked by a worker are skipped.
    pub fn collect_pollable(&self, out: &mut Vec<Pollable>) {
        let mut cursor = self.first_active();
        while let Some(id) = cursor {
            cursor = self.next_active(id);
            let Some(mut inner) = self.try_lock_slot(id) else {
                continue;
            };
            let Some(conn) = inner.conn.as_mut() else {
                self.lock_list().remove(id.index);
                continue;
            };
            if conn.is_closing() {
                self.lock_list().remove(id.index);
                self.try_release(id.index, &mut inner);
                continue;
            }
            if conn.is_reading() {
                continue;
            }
            if conn.at_thread_cap() {
                conn.note_blocked_poll();
                continue;
            }
            out.push(Pollable {
                id,
                fd: conn.socket().as_raw_fd(),
            });
        }
    }

    /// Claims a ready slot for a worker. Returns false if the slot is
    /// closing, already being read or at its thread cap.
    pub fn begin_activity(&self, id: SlotId, now: Instant) -> bool {
        let Some(mut inner) = self.lock_slot(id) else {
            return false;
        };
        let Some(conn) = inner.conn.as_mut() else {
            return false;
        };
        if conn.is_closing() || conn.is_reading() || conn.at_thread_cap() {
            return false;
        }
        if conn.begin_read(now) {
            self.max_threads_hits.fetch_add(1, Ordering::Relaxed);
            debug!(conn = conn.id(), threads = conn.threads(), "Connection at thread cap");
        }
        true
    }

    /// Releases the worker's claim taken by [`ConnectionTable::begin_activity`].
    pub fn end_activity(&self, id: SlotId) {
        let Some(slot) = self.slots.get(id.index) else {
            return;
        };
        let mut inner = match slot.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => {
                let mut inner = poisoned.into_inner();
                self.retire(id.index, &mut inner);
                return;
            }
        };
        if inner.generation != id.generation {
            return;
        }
        if let Some(conn) = inner.conn.as_mut() {
            conn.end_read(Instant::now());
        }
        self.try_release(id.index, &mut inner);
        drop(inner);
        self.wake();
    }

    /// Runs `f` on an active connection, waiting for the slot lock. Keep
    /// `f` short: the event loop skips a locked slot for the whole pass.
    ///
    /// Returns `None` if the id is stale, the connection is closing, or the
    /// slot is poisoned.
    pub fn with_connection<R>(&self, id: SlotId, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut inner = self.lock_slot(id)?;
        let conn = inner.conn.as_mut()?;
        if conn.is_closing() {
            return None;
        }
        Some(f(conn))
    }

    /// Calls `f` for every linked, still-active connection.
    pub fn for_each_active(&self, mut f: impl FnMut(SlotId, &mut Connection)) {
        let mut cursor = self.first_active();
        while let Some(id) = cursor {
            cursor = self.next_active(id);
            if let Some(mut inner) = self.lock_slot(id)
                && let Some(conn) = inner.conn.as_mut()
                && !conn.is_closing()
            {
                f(id, conn);
            }
        }
    }

    /// Closes every active connection, returning the ids that were closed.
    pub fn disconnect_all(&self, reason: DisconnectReason) -> Vec<u64> {
        let mut closed = Vec::new();
        self.for_each_active(|_, conn| {
            if conn.close(reason) {
                closed.push(conn.id());
            }
        });
        closed
    }

    /// Unlinks every closing slot and releases those no worker holds.
    pub fn reap(&self) -> usize {
        let mut reaped = 0;
        let mut cursor = self.first_active();
        while let Some(id) = cursor {
            cursor = self.next_active(id);
            let Some(slot) = self.slots.get(id.index) else {
                continue;
            };
            let mut inner = match slot.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => {
                    let mut inner = poisoned.into_inner();
                    self.retire(id.index, &mut inner);
                    continue;
                }
            };
            if inner.generation != id.generation {
                continue;
            }
            if inner.conn.as_ref().is_none_or(Connection::is_closing) {
                self.lock_list().remove(id.index);
                self.try_release(id.index, &mut inner);
                reaped += 1;
            }
        }
        reaped
    }

    /// Builds the monitor view.
    pub fn snapshot(&self) -> TableSnapshot {
        let mut snapshot = TableSnapshot {
            capacity: self.capacity(),
            reserved: self.reserved,
            current_connections: self.current(),
            total_connections: self.total(),
            read_waiters: 0,
            connections_at_max_threads: 0,
            max_threads_hits: self.max_threads_hits.load(Ordering::Relaxed),
            connections: Vec::new(),
        };
        self.for_each_active(|id, conn| {
            if conn.is_reading() {
                snapshot.read_waiters += 1;
            }
            if conn.at_thread_cap() {
                snapshot.connections_at_max_threads += 1;
            }
            snapshot.connections.push(ConnectionRecord {
                slot: id.index,
                connection_id: conn.id(),
                opened_at: conn.opened_at(),
                transport: conn.transport(),
                peer: conn.peer().to_string(),
                bind_dn: conn.bind_dn().map(str::to_string),
                ops_initiated: conn.ops_initiated(),
                ops_completed: conn.ops_completed(),
                reading: conn.is_reading(),
                threads: conn.threads(),
                max_threads_hits: conn.max_threads_hits(),
                polls_blocked: conn.polls_blocked(),
            });
        });
        snapshot
    }

    fn id_of(&self, index: usize) -> SlotId {
        SlotId {
            index,
            generation: self.slots[index].generation.load(Ordering::Acquire),
        }
    }

    fn lock_list(&self) -> MutexGuard<'_, ActiveList> {
        self.list.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks a slot for `id`; poisoned slots are retired.
    fn lock_slot(&self, id: SlotId) -> Option<MutexGuard<'_, SlotInner>> {
        let slot = self.slots.get(id.index)?;
        let inner = match slot.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => {
                let mut inner = poisoned.into_inner();
                self.retire(id.index, &mut inner);
                return None;
            }
        };
        (inner.generation == id.generation).then_some(inner)
    }

    /// Like [`Self::lock_slot`] but gives up if the lock is held.
    fn try_lock_slot(&self, id: SlotId) -> Option<MutexGuard<'_, SlotInner>> {
        let slot = self.slots.get(id.index)?;
        let inner = match slot.inner.try_lock() {
            Ok(inner) => inner,
            Err(TryLockError::WouldBlock) => return None,
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut inner = poisoned.into_inner();
                self.retire(id.index, &mut inner);
                return None;
            }
        };
        (inner.generation == id.generation).then_some(inner)
    }

    /// Takes a slot whose lock was poisoned out of service for good.
    fn retire(&self, index: usize, inner: &mut SlotInner) {
        if inner.retired {
            return;
        }
        inner.retired = true;
        self.lock_list().remove(index);
        if inner.conn.take().is_some() || inner.reserved {
            inner.reserved = false;
            self.current.fetch_sub(1, Ordering::AcqRel);
        }
        error!(slot = index, "Slot lock poisoned, removing it from service");
    }

    /// Returns an unlinked, closing, unused slot to the free pool.
    fn try_release(&self, index: usize, inner: &mut SlotInner) {
        let releasable = inner
            .conn
            .as_ref()
            .is_some_and(|conn| conn.is_closing() && conn.threads() == 0);
        if !releasable {
            return;
        }
        {
            let mut list = self.lock_list();
            if list.linked[index] {
                return;
            }
            if !inner.retired {
                list.free.push_back(index);
            }
        }
        if let Some(conn) = inner.conn.take() {
            debug!(
                slot = index,
                conn = conn.id(),
                reason = ?conn.disconnect_reason(),
                "Released connection slot"
            );
        }
        self.current.fetch_sub(1, Ordering::AcqRel);
        self.wake();
    }

    fn wake(&self) {
        if let Some(ref waker) = self.waker {
            waker.wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::local_connection;
    use std::collections::HashSet;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn open(table: &ConnectionTable) -> (SlotId, UnixStream) {
        let (conn, client) = local_connection();
        let id = table.acquire().expect("free slot");
        table.activate(id, conn).expect("activated");
        (id, client)
    }

    fn active_ids(table: &ConnectionTable) -> Vec<SlotId> {
        let mut ids = Vec::new();
        let mut cursor = table.first_active();
        while let Some(id) = cursor {
            ids.push(id);
            cursor = table.next_active(id);
        }
        ids
    }

    #[test]
    fn reserved_must_leave_room() {
        assert!(matches!(
            ConnectionTable::new(4, 4),
            Err(ServerError::InsufficientDescriptors {
                capacity: 4,
                reserved: 4
            })
        ));
        assert!(ConnectionTable::new(4, 3).is_ok());
    }

    #[test]
    fn distinct_slots_up_to_capacity() {
        let table = ConnectionTable::new(8, 0).unwrap();
        let opened: Vec<_> = (0..8).map(|_| open(&table)).collect();

        let indices: HashSet<_> = opened.iter().map(|(id, _)| id.index()).collect();
        assert_eq!(indices.len(), 8);
        assert!(table.acquire().is_none());
        assert_eq!(table.current(), 8);
        assert_eq!(active_ids(&table).len(), 8);
    }

    #[test]
    fn accepting_honours_reserved() {
        let table = ConnectionTable::new(10, 2).unwrap();
        let mut held = Vec::new();
        while table.accepting() {
            held.push(open(&table));
        }
        assert_eq!(held.len(), 8);

        let (id, _client) = held.pop().unwrap();
        table.disconnect(id, DisconnectReason::ClientClosed);
        assert!(!table.accepting());
        table.deactivate(id);
        assert!(table.accepting());
    }

    #[test]
    fn deactivate_twice_is_noop() {
        let table = ConnectionTable::new(4, 0).unwrap();
        let (a, _ca) = open(&table);
        let (b, _cb) = open(&table);
        let (c, _cc) = open(&table);

        assert!(table.deactivate(b));
        assert!(!table.deactivate(b));
        assert_eq!(active_ids(&table), vec![c, a]);
        assert_eq!(table.current(), 2);
    }

    #[test]
    fn slot_not_reused_before_deactivation() {
        let table = ConnectionTable::new(2, 0).unwrap();
        let (a, _ca) = open(&table);
        let (_b, _cb) = open(&table);

        table.disconnect(a, DisconnectReason::IdleTimeout);
        assert!(table.acquire().is_none());

        table.deactivate(a);
        let reused = table.acquire().unwrap();
        assert_eq!(reused.index(), a.index());
        assert_ne!(reused.generation(), a.generation());
    }

    #[test]
    fn stale_id_is_ignored() {
        let table = ConnectionTable::new(1, 0).unwrap();
        let (old, _c1) = open(&table);
        table.deactivate(old);
        let (new, _c2) = open(&table);

        assert_eq!(old.index(), new.index());
        assert!(table.disconnect(old, DisconnectReason::Abort).is_none());
        assert!(!table.deactivate(old));
        assert_eq!(active_ids(&table), vec![new]);
    }

    #[test]
    fn collect_skips_reading_and_unlinks_closing() {
        let table = ConnectionTable::new(4, 0).unwrap();
        let (a, _ca) = open(&table);
        let (b, _cb) = open(&table);
        let (c, _cc) = open(&table);

        assert!(table.begin_activity(a, Instant::now()));
        table.disconnect(b, DisconnectReason::PollError);

        let mut out = Vec::new();
        table.collect_pollable(&mut out);
        let ids: Vec<_> = out.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![c]);
        assert_eq!(active_ids(&table), vec![c, a]);
        assert_eq!(table.current(), 2);

        table.end_activity(a);
        out.clear();
        table.collect_pollable(&mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn done_reading_admits_workers_up_to_cap() {
        let table = ConnectionTable::new(2, 0).unwrap();
        let (conn, _client) = local_connection();
        let id = table.acquire().unwrap();
        table.activate(id, conn.with_max_threads(2)).unwrap();
        let now = Instant::now();
        let mut out = Vec::new();

        assert!(table.begin_activity(id, now));
        assert!(!table.begin_activity(id, now));
        table.with_connection(id, Connection::done_reading);
        table.collect_pollable(&mut out);
        assert_eq!(out.len(), 1);

        assert!(table.begin_activity(id, now));
        table.with_connection(id, Connection::done_reading);
        out.clear();
        table.collect_pollable(&mut out);
        assert!(out.is_empty());
        assert!(!table.begin_activity(id, now));
        assert_eq!(table.snapshot().connections_at_max_threads, 1);

        table.end_activity(id);
        out.clear();
        table.collect_pollable(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn finishing_worker_leaves_newer_reader_alone() {
        let table = ConnectionTable::new(2, 0).unwrap();
        let (conn, _client) = local_connection();
        let id = table.acquire().unwrap();
        table.activate(id, conn.with_max_threads(3)).unwrap();
        let now = Instant::now();
        let mut out = Vec::new();

        assert!(table.begin_activity(id, now));
        table.with_connection(id, Connection::done_reading);
        assert!(table.begin_activity(id, now));

        table.end_activity(id);
        assert_eq!(table.with_connection(id, |c| c.is_reading()), Some(true));
        table.collect_pollable(&mut out);
        assert!(out.is_empty());

        table.end_activity(id);
        table.collect_pollable(&mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn closing_slot_waits_for_worker() {
        let table = ConnectionTable::new(2, 0).unwrap();
        let (a, _ca) = open(&table);

        assert!(table.begin_activity(a, Instant::now()));
        table.disconnect(a, DisconnectReason::IoError);
        assert!(table.deactivate(a));
        assert_eq!(table.current(), 1);

        table.end_activity(a);
        assert_eq!(table.current(), 0);
    }

    #[test]
    fn idle_disconnect() {
        let table = ConnectionTable::new(2, 0).unwrap();
        let (conn, _client) = local_connection();
        let conn = conn.with_idle_timeout(1);
        let id = table.acquire().unwrap();
        let conn_id = table.activate(id, conn).unwrap();

        let now = Instant::now();
        assert!(table.disconnect_if_idle(id, now).is_none());
        assert_eq!(
            table.disconnect_if_idle(id, now + Duration::from_secs(2)),
            Some(conn_id)
        );
        assert!(table.disconnect_if_idle(id, now + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn poisoned_slot_is_never_dispatched() {
        let table = Arc::new(ConnectionTable::new(2, 0).unwrap());
        let (a, _ca) = open(&table);
        let (b, _cb) = open(&table);

        let worker = Arc::clone(&table);
        let result = thread::spawn(move || {
            worker.with_connection(a, |conn| {
                if conn.id() > 0 {
                    panic!("worker died");
                }
            });
        })
        .join();
        assert!(result.is_err());

        let mut out = Vec::new();
        table.collect_pollable(&mut out);
        assert_eq!(out.iter().map(|p| p.id).collect::<Vec<_>>(), vec![b]);
        assert_eq!(active_ids(&table), vec![b]);
        assert_eq!(table.current(), 1);
        assert!(!table.begin_activity(a, Instant::now()));

        table.deactivate(b);
        assert_eq!(table.acquire().map(|id| id.index()), Some(b.index()));
        assert!(table.acquire().is_none());
    }

    #[test]
    fn disconnect_all_then_reap() {
        let table = ConnectionTable::new(4, 0).unwrap();
        let _held: Vec<_> = (0..3).map(|_| open(&table)).collect();

        assert_eq!(table.disconnect_all(DisconnectReason::Abort).len(), 3);
        assert_eq!(table.reap(), 3);
        assert_eq!(table.current(), 0);
        assert!(table.first_active().is_none());
    }

    #[test]
    fn snapshot_reports_connections() {
        let table = ConnectionTable::new(4, 1).unwrap();
        let (a, _ca) = open(&table);
        let (_b, _cb) = open(&table);
        table.begin_activity(a, Instant::now());

        let snapshot = table.snapshot();
        assert_eq!(snapshot.capacity, 4);
        assert_eq!(snapshot.current_connections, 2);
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.read_waiters, 1);
        assert_eq!(snapshot.connections.len(), 2);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["connections"][0]["transport"], "local");
    }

    #[test]
    fn cancel_returns_slot() {
        let table = ConnectionTable::new(1, 0).unwrap();
        let id = table.acquire().unwrap();
        assert!(table.acquire().is_none());
        table.cancel(id);
        assert_eq!(table.current(), 0);
        assert!(table.acquire().is_some());
    }
}
