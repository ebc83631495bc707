//! "Talking to" registry: at most one live session per remote node.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Shared set of node names with an active session. Constructed once and
/// handed to every component that starts or checks sessions.
#[derive(Debug, Clone, Default)]
pub struct TalkingTo {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl TalkingTo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `node`. Returns `None` if a session with it is already running.
    /// The claim is released when the guard drops.
    pub fn try_enter(&self, node: &str) -> Option<TalkingGuard> {
        let mut set = self.lock();
        if !set.insert(node.to_string()) {
            return None;
        }
        Some(TalkingGuard {
            registry: self.clone(),
            node: node.to_string(),
        })
    }

    pub fn is_talking(&self, node: &str) -> bool {
        self.lock().contains(node)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // A panic while holding the lock cannot leave the set half-updated.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Proof that this session owns the node's slot.
#[derive(Debug)]
pub struct TalkingGuard {
    registry: TalkingTo,
    node: String,
}

impl TalkingGuard {
    pub fn node(&self) -> &str {
        &self.node
    }
}

impl Drop for TalkingGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.node);
    }
}
