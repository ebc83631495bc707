//! Reactor loops: one OS thread each, running a single-threaded tokio
//! runtime. Jobs arrive through a [`JobQueue`] and run as local tasks, so a
//! context never leaves the loop thread once handed off.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::watch;
use tokio::task::{JoinSet, LocalSet};
use tracing::{debug, error, info};

use crate::job_queue::{JobQueue, Wake};

pub type LocalFuture = Pin<Box<dyn Future<Output = ()>>>;

/// Work handed to a loop. Built on any thread; run on the loop thread.
pub trait Job: Send + 'static {
    fn run(self: Box<Self>, shutdown: Shutdown) -> LocalFuture;
}

pub type BoxedJob = Box<dyn Job>;

/// Process-wide cancellation, observed by every running job.
#[derive(Clone)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    rx: watch::Receiver<bool>,
}

/// Fires [`Shutdown`].
pub struct ShutdownTrigger {
    flag: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

pub fn shutdown_pair() -> (ShutdownTrigger, Shutdown) {
    let flag = Arc::new(AtomicBool::new(false));
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger {
            flag: flag.clone(),
            tx,
        },
        Shutdown { flag, rx },
    )
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.flag.store(true, Ordering::Release);
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    /// The flag alone, for code that polls instead of awaiting.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    /// Resolves once shutdown fires. A dropped trigger counts as fired.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|fired| *fired).await;
    }
}

/// Start a loop thread named `name` draining `queue`.
pub fn spawn(name: &str, queue: JobQueue<BoxedJob>, shutdown: Shutdown) -> std::io::Result<JoinHandle<()>> {
    let thread_name = name.to_string();
    std::thread::Builder::new().name(thread_name.clone()).spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                error!(loop = %thread_name, "cannot build runtime: {}", e);
                return;
            }
        };
        let local = LocalSet::new();
        local.block_on(&rt, run(&thread_name, queue, shutdown));
    })
}

/// The loop body. Exits after shutdown once every started job finished.
pub async fn run(name: &str, queue: JobQueue<BoxedJob>, shutdown: Shutdown) {
    let mut tasks = JoinSet::new();
    info!(loop = name, "event loop running");
    loop {
        tokio::select! {
            wake = queue.wait() => {
                let n = queue.run_pending(|job| {
                    tasks.spawn_local(job.run(shutdown.clone()));
                });
                if n > 0 {
                    debug!(loop = name, jobs = n, "started jobs");
                }
                if wake == Wake::Shutdown {
                    break;
                }
            }
            Some(res) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = res {
                    error!(loop = name, "job failed: {}", e);
                }
            }
        }
    }
    // Jobs queued before shutdown still run their shutdown path.
    queue.run_pending(|job| {
        tasks.spawn_local(job.run(shutdown.clone()));
    });
    while let Some(res) = tasks.join_next().await {
        if let Err(e) = res {
            error!(loop = name, "job failed: {}", e);
        }
    }
    info!(loop = name, "event loop stopped");
}
