//! Worker pool that runs connection activity off the event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::error::{ServerError, ServerResult};

/// Blocking worker threads backed by a tokio runtime.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Option<Runtime>,
    active: Arc<AtomicUsize>,
    closed: AtomicBool,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WorkerPool {
    /// Creates a pool with at most `threads` concurrent jobs.
    pub fn new(threads: usize) -> ServerResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("ldapd-worker")
            .enable_time()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            active: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    /// Queues `job`. Fails once the pool is closed.
    pub fn submit<F>(&self, job: F) -> ServerResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Shutdown);
        }
        let Some(runtime) = self.runtime.as_ref() else {
            return Err(ServerError::Shutdown);
        };
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(Arc::clone(&self.active));
        runtime.spawn_blocking(move || {
            let _guard = guard;
            job();
        });
        Ok(())
    }

    /// Jobs queued or running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Stops accepting new jobs.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Waits up to `timeout` for running jobs, then drops the runtime.
    /// Returns the number of jobs still running at the deadline.
    pub fn shutdown(&mut self, timeout: Duration) -> usize {
        self.close();
        let deadline = Instant::now() + timeout;
        while self.active() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let remaining = self.active();
        if remaining > 0 {
            warn!(remaining, "Worker threads still busy at shutdown");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_millis(100));
        }
        debug!("Worker pool stopped");
        remaining
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
