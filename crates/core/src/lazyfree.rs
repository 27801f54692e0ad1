//! Hand-off boundary to the lazy-free background worker.
//!
//! Large teardown work is packaged as a self-contained closure owning all
//! dependent allocations and deposited on the worker queue in a single
//! enqueue call. Once handed off, the enqueuing thread must not touch the
//! transferred structures again.

use std::sync::mpsc::{self, Sender};
use std::thread::JoinHandle;

use tracing::debug;

/// A self-contained teardown job.
pub type TeardownJob = Box<dyn FnOnce() + Send + 'static>;

/// Sink for teardown jobs.
pub trait LazyFree: Send + Sync {
    /// Deposits one job on the worker queue.
    fn enqueue(&self, job: TeardownJob);
}

/// Runs teardown jobs inline on the calling thread.
///
/// Used where no background worker is wired up (tests, shutdown paths that
/// must complete synchronously).
pub struct InlineLazyFree;

impl LazyFree for InlineLazyFree {
    fn enqueue(&self, job: TeardownJob) {
        job();
    }
}

/// Background worker draining teardown jobs on a dedicated thread.
///
/// Dropping the worker closes the queue and joins the thread, so every
/// accepted job runs before the worker is gone.
pub struct LazyFreeWorker {
    tx: Option<Sender<TeardownJob>>,
    handle: Option<JoinHandle<()>>,
}

impl LazyFreeWorker {
    /// Spawns the worker thread.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel::<TeardownJob>();
        let handle = std::thread::Builder::new()
            .name("lazyfree".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("lazy-free worker drained and stopped");
            })
            .ok();
        Self {
            tx: Some(tx),
            handle,
        }
    }

    /// Waits for all pending jobs to complete and stops the worker.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the sender ends the drain loop once the queue is empty.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LazyFreeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LazyFree for LazyFreeWorker {
    fn enqueue(&self, job: TeardownJob) {
        let Some(tx) = &self.tx else {
            debug!("lazy-free worker gone; running job inline");
            job();
            return;
        };
        if let Err(returned) = tx.send(job) {
            debug!("lazy-free worker gone; running job inline");
            (returned.0)();
        }
    }
}
