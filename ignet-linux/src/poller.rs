//! Decides which neighbors to contact and hands their sessions to the
//! client loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ignet_core::{NodeConfig, NodeSession, SessionEnv};
use tracing::{debug, info};

use crate::connection::{ClientJob, Connector};
use crate::event_loop::BoxedJob;
use crate::job_queue::JobQueue;

pub struct Poller {
    neighbors: Vec<NodeConfig>,
    env: SessionEnv,
    connector: Arc<Connector>,
    queue: JobQueue<BoxedJob>,
    interval: Duration,
    last_full: Option<Instant>,
    /// Session counter; also used as the context id.
    sessions: u64,
}

impl Poller {
    pub fn new(
        neighbors: Vec<NodeConfig>,
        env: SessionEnv,
        connector: Arc<Connector>,
        queue: JobQueue<BoxedJob>,
        interval: Duration,
    ) -> Self {
        Self {
            neighbors,
            env,
            connector,
            queue,
            interval,
            last_full: None,
            sessions: 0,
        }
    }

    fn full_poll_due(&self, now: Instant) -> bool {
        match self.last_full {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.interval,
        }
    }

    /// Should `node` be contacted on this pass?
    pub fn should_poll(&self, node: &NodeConfig, full_poll: bool) -> bool {
        if !node.is_pollable() {
            return false;
        }
        if self.env.talking.is_talking(&node.name) {
            debug!(node = %node.name, "already talking");
            return false;
        }
        full_poll || self.env.dirs.has_outbound(&node.name)
    }

    /// One pass over the neighbors. Returns how many sessions were queued.
    pub fn tick(&mut self, now: Instant) -> usize {
        if self.queue.is_shut_down() {
            return 0;
        }
        let full = self.full_poll_due(now);
        if full {
            self.last_full = Some(now);
        }
        let mut started = 0;
        for i in 0..self.neighbors.len() {
            if !self.should_poll(&self.neighbors[i], full) {
                continue;
            }
            let n = self.sessions + 1;
            let Some(session) = NodeSession::start(n, n, self.neighbors[i].clone(), &self.env) else {
                continue;
            };
            self.sessions = n;
            info!(node = %self.neighbors[i].name, n, full, "polling");
            self.queue
                .enqueue(Box::new(ClientJob::new(session, self.connector.clone())));
            started += 1;
        }
        started
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions
    }
}
