//! Administrator notifications for failures an operator should see.

use std::sync::{Arc, Mutex};

/// One message for the administrators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminNotice {
    pub subject: String,
    pub node: String,
    pub body: String,
    /// Context id of the session that raised it.
    pub io: u64,
}

/// Delivers notices off the client reactor thread. Implementations must not
/// block; the daemon hands each notice to its database loop.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: AdminNotice);
}

/// Keeps notices in memory. Used where no delivery is wanted.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    notices: Arc<Mutex<Vec<AdminNotice>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<AdminNotice> {
        std::mem::take(&mut *self.notices.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notice: AdminNotice) {
        self.notices
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(notice);
    }
}
