//! Shutdown coordination and Unix signal handling.
//!
//! - SIGTERM/SIGINT/SIGHUP: set the shutdown flag to `Signal` and wake the
//!   event loop
//! - SIGCHLD: reap exited children
//! - SIGPIPE: swallowed, writes report `EPIPE` instead
//!
//! The handlers installed by `signal-hook` only record the signal and poke
//! a self-pipe. The `ldapd-signals` thread turns that into a shutdown
//! request, so nothing here runs in signal context.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ldapd_core::{ShutdownFlag, ShutdownReason};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGPIPE, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::{debug, info, trace};

use crate::reactor::Waker;

const HANDLED: [libc::c_int; 5] = [SIGTERM, SIGINT, SIGHUP, SIGCHLD, SIGPIPE];

/// A handle for triggering or checking shutdown status.
///
/// This is the only in-process writer of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    flag: Arc<ShutdownFlag>,
    waker: Waker,
}

impl ShutdownHandle {
    pub fn new(waker: Waker) -> Self {
        Self {
            flag: Arc::new(ShutdownFlag::new()),
            waker,
        }
    }

    /// Requests shutdown and wakes the event loop.
    ///
    /// Returns false if a shutdown reason was already recorded; the first
    /// reason is kept.
    pub fn trigger(&self, reason: ShutdownReason) -> bool {
        let first = self.flag.set(reason);
        self.waker.wake();
        first
    }

    /// Returns the recorded reason.
    pub fn reason(&self) -> ShutdownReason {
        self.flag.get()
    }

    /// Returns true if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        !self.flag.is_running()
    }

    /// Interrupts the event loop's wait without changing the flag.
    pub fn wake(&self) {
        self.waker.wake();
    }

    pub fn waker(&self) -> &Waker {
        &self.waker
    }
}

/// Installed process signal handlers and the thread serving them.
///
/// Dropping the registration stops and joins the thread. The thread owns
/// its own [`ShutdownHandle`], so a signal arriving during teardown never
/// reaches a released waker.
pub struct SignalRegistration {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

/// Installs the process signal handlers for `shutdown`.
pub fn install(shutdown: &ShutdownHandle) -> io::Result<SignalRegistration> {
    let mut signals = Signals::new(HANDLED)?;
    let handle = signals.handle();
    let shutdown = shutdown.clone();

    let thread = thread::Builder::new()
        .name("ldapd-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                match signal {
                    SIGCHLD => reap_children(),
                    SIGPIPE => trace!("Ignoring SIGPIPE"),
                    _ => {
                        if shutdown.trigger(ShutdownReason::Signal) {
                            info!(signal, "Received terminating signal");
                        }
                    }
                }
            }
            debug!("Signal thread stopped");
        })?;

    debug!("Installed signal handlers");
    Ok(SignalRegistration {
        handle,
        thread: Some(thread),
    })
}

impl fmt::Debug for SignalRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistration")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl Drop for SignalRegistration {
    fn drop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            debug!("Signal thread panicked");
        }
    }
}

fn reap_children() {
    loop {
        // SAFETY: a null status pointer is allowed; WNOHANG never blocks.
        let pid = unsafe { libc::waitpid(-1, ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        debug!(pid, "Reaped child process");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{MioReactor, Reactor, Token};
    use std::time::Duration;

    #[test]
    fn trigger_records_first_reason() {
        let reactor = MioReactor::new(1).unwrap();
        let handle = ShutdownHandle::new(reactor.waker());

        assert!(!handle.is_shutdown());
        assert!(handle.trigger(ShutdownReason::DiskFull));
        assert!(!handle.trigger(ShutdownReason::Signal));
        assert_eq!(handle.reason(), ShutdownReason::DiskFull);
    }

    #[test]
    fn trigger_wakes_loop() {
        let mut reactor = MioReactor::new(1).unwrap();
        let handle = ShutdownHandle::new(reactor.waker());

        handle.trigger(ShutdownReason::Exit);
        reactor.wait(Duration::from_secs(1)).unwrap();
        assert!(reactor.events().any(|(token, _)| token == Token::Wakeup));
    }

    #[test]
    fn clones_share_flag() {
        let reactor = MioReactor::new(1).unwrap();
        let handle = ShutdownHandle::new(reactor.waker());
        let other = handle.clone();

        other.trigger(ShutdownReason::Exit);
        assert!(handle.is_shutdown());
        assert_eq!(handle.reason(), ShutdownReason::Exit);
    }
}
