//! Readiness waiting.
//!
//! The event loop rebuilds its interest set every pass. [`MioReactor`]
//! re-arms each registration right before the wait and drops the ones that
//! were not renewed, so a slot is watched iff it was registered under its
//! current [`SlotId`] for that pass, and bytes nobody read yet are reported
//! again on the next pass.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll};
use tracing::{debug, trace};

use crate::conntable::SlotId;

const WAKE_TOKEN: mio::Token = mio::Token(0);

/// What a registered descriptor stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Token {
    /// The reactor's own waker.
    Wakeup,
    /// A listener, by position in the listener set.
    Listener(usize),
    /// A connection slot.
    Slot(SlotId),
}

/// Readiness reported for one registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or EOF) can be read.
    pub readable: bool,
    /// Error condition on the descriptor.
    pub error: bool,
}

/// A readiness multiplexer.
pub trait Reactor {
    /// Drops every registration.
    fn clear(&mut self);

    /// Watches `fd` for readability until the next [`Reactor::clear`].
    fn register(&mut self, fd: RawFd, token: Token);

    /// Blocks until something is ready or `timeout` elapses.
    ///
    /// Returns the number of ready registrations.
    fn wait(&mut self, timeout: Duration) -> io::Result<usize>;

    /// Ready registrations from the last wait.
    fn events(&self) -> impl Iterator<Item = (Token, Readiness)> + '_;
}

/// Interrupts a blocked [`Reactor::wait`]. Cheap to clone, usable from any
/// thread.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<mio::Waker>,
}

impl Waker {
    pub fn wake(&self) {
        if let Err(e) = self.inner.wake() {
            trace!(error = %e, "Wakeup failed");
        }
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}

/// `mio` backed reactor.
pub struct MioReactor {
    poll: Poll,
    events: Events,
    waker: Waker,
    fds: Vec<RawFd>,
    tokens: Vec<Token>,
    armed: HashSet<RawFd>,
}

impl MioReactor {
    /// Creates a reactor sized for about `capacity` registrations.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker {
            inner: Arc::new(mio::Waker::new(poll.registry(), WAKE_TOKEN)?),
        };
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.max(1)),
            waker,
            fds: Vec::with_capacity(capacity),
            tokens: Vec::with_capacity(capacity),
            armed: HashSet::new(),
        })
    }

    pub fn waker(&self) -> Waker {
        self.waker.clone()
    }

    /// Number of registrations for the current pass.
    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Brings the kernel interest list in line with this pass.
    ///
    /// Re-registering queues an event for a descriptor that is already
    /// readable, which turns mio's edge-triggered registrations into
    /// per-pass level semantics.
    fn arm(&mut self) {
        let registry = self.poll.registry();
        let mut armed = HashSet::with_capacity(self.fds.len());

        for (index, fd) in self.fds.iter().enumerate() {
            let token = mio::Token(index + 1);
            let mut source = SourceFd(fd);
            let result = if self.armed.contains(fd) {
                match registry.reregister(&mut source, token, Interest::READABLE) {
                    // Closed and reused since the last pass.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        registry.register(&mut source, token, Interest::READABLE)
                    }
                    other => other,
                }
            } else {
                match registry.register(&mut source, token, Interest::READABLE) {
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        registry.reregister(&mut source, token, Interest::READABLE)
                    }
                    other => other,
                }
            };
            match result {
                Ok(()) => {
                    armed.insert(*fd);
                }
                Err(e) => debug!(fd, error = %e, "Could not watch descriptor"),
            }
        }

        for fd in self.armed.difference(&armed) {
            // Descriptors closed since the last pass already left the
            // interest list.
            let _ = registry.deregister(&mut SourceFd(fd));
        }
        self.armed = armed;
    }
}

impl Reactor for MioReactor {
    fn clear(&mut self) {
        self.fds.clear();
        self.tokens.clear();
    }

    fn register(&mut self, fd: RawFd, token: Token) {
        self.fds.push(fd);
        self.tokens.push(token);
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<usize> {
        self.arm();
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(self.events.iter().count())
    }

    fn events(&self) -> impl Iterator<Item = (Token, Readiness)> + '_ {
        self.events.iter().filter_map(|event| {
            let token = match event.token() {
                WAKE_TOKEN => Token::Wakeup,
                mio::Token(n) => *self.tokens.get(n - 1)?,
            };
            let readiness = Readiness {
                readable: event.is_readable() || event.is_read_closed(),
                error: event.is_error(),
            };
            Some((token, readiness))
        })
    }
}
