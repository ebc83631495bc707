//! Cross-thread handoff of jobs into a reactor loop.
//!
//! Two buckets: producers append to the write bucket under the lock; the
//! reactor swaps it for the empty spare and runs the batch without holding
//! the lock, so enqueues during a drain land in the next batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

pub struct JobQueue<J> {
    inner: Arc<Inner<J>>,
}

struct Inner<J> {
    buckets: Mutex<Buckets<J>>,
    wake: Notify,
    shut_down: AtomicBool,
}

struct Buckets<J> {
    write: Vec<J>,
    /// Drained bucket handed back for reuse.
    spare: Vec<J>,
}

/// Why [`JobQueue::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Jobs,
    Shutdown,
}

impl<J> Clone for JobQueue<J> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<J> Default for JobQueue<J> {
    fn default() -> Self {
        Self::new()
    }
}

impl<J> JobQueue<J> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: Mutex::new(Buckets {
                    write: Vec::new(),
                    spare: Vec::new(),
                }),
                wake: Notify::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Publish `job` to the reactor. The caller must not touch anything the
    /// job owns afterwards.
    pub fn enqueue(&self, job: J) {
        self.lock().write.push(job);
        self.inner.wake.notify_one();
    }

    /// Ask the reactor loop to exit once its current callbacks return.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Jobs waiting for the next drain.
    pub fn len(&self) -> usize {
        self.lock().write.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sleep until there is work or shutdown was requested. Shutdown wins.
    pub async fn wait(&self) -> Wake {
        loop {
            let notified = self.inner.wake.notified();
            if self.is_shut_down() {
                return Wake::Shutdown;
            }
            if !self.is_empty() {
                return Wake::Jobs;
            }
            notified.await;
        }
    }

    /// Swap buckets and hand each queued job to `run`, in enqueue order.
    /// Returns how many ran.
    pub fn run_pending<F>(&self, mut run: F) -> usize
    where
        F: FnMut(J),
    {
        let mut batch = {
            let mut buckets = self.lock();
            let spare = std::mem::take(&mut buckets.spare);
            std::mem::replace(&mut buckets.write, spare)
        };
        let n = batch.len();
        for job in batch.drain(..) {
            run(job);
        }
        let mut buckets = self.lock();
        if buckets.spare.capacity() < batch.capacity() {
            buckets.spare = batch;
        }
        n
    }

    fn lock(&self) -> MutexGuard<'_, Buckets<J>> {
        self.inner
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
