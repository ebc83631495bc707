//! Administrator mailbox. Notices raised on the client loop are handed to the
//! database loop, which writes one file per notice.

use std::path::{Path, PathBuf};

use ignet_core::{AdminNotice, Notifier};
use tracing::{error, info};

use crate::event_loop::{BoxedJob, Job, LocalFuture, Shutdown};
use crate::job_queue::JobQueue;

/// Queues each notice as a job on the database loop.
pub struct AideNotifier {
    queue: JobQueue<BoxedJob>,
    dir: PathBuf,
}

impl AideNotifier {
    pub fn new(queue: JobQueue<BoxedJob>, dir: PathBuf) -> Self {
        Self { queue, dir }
    }
}

impl Notifier for AideNotifier {
    fn notify(&self, notice: AdminNotice) {
        self.queue.enqueue(Box::new(NoticeJob {
            notice,
            dir: self.dir.clone(),
        }));
    }
}

struct NoticeJob {
    notice: AdminNotice,
    dir: PathBuf,
}

impl Job for NoticeJob {
    fn run(self: Box<Self>, _shutdown: Shutdown) -> LocalFuture {
        Box::pin(async move {
            match deliver(&self.dir, &self.notice) {
                Ok(path) => info!(
                    io = self.notice.io,
                    node = %self.notice.node,
                    "{}: {} ({})",
                    self.notice.subject,
                    self.notice.body,
                    path.display()
                ),
                Err(e) => error!(
                    io = self.notice.io,
                    node = %self.notice.node,
                    "cannot write notice to {}: {}",
                    self.dir.display(),
                    e
                ),
            }
        })
    }
}

/// Write `notice` as `<dir>/<uuid>.txt`.
pub fn deliver(dir: &Path, notice: &AdminNotice) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.txt", uuid::Uuid::new_v4()));
    let text = format!(
        "Subject: {}\nNode: {}\n\n{}\n",
        notice.subject, notice.node, notice.body
    );
    std::fs::write(&path, text)?;
    Ok(path)
}
