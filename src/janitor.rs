//! Periodic sweep that expires past-despawn entries and times out overdue
//! scouts. Runs independently of the dispatcher and webhook filter.
//!
//! Spec §4.6 has no dedicated original-source file — the original inlines
//! this into `lazyivqueue.py`'s startup task list — so the background-task
//! shape is grounded on the teacher's `eviction()` interval loop instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::queue::PriorityQueue;

pub struct Janitor {
    queue: Arc<PriorityQueue>,
}

impl Janitor {
    pub fn new(queue: Arc<PriorityQueue>) -> Self {
        Janitor { queue }
    }

    /// Spawns the sweep loop: `sweepExpired` then `sweepTimedOut`, every
    /// `interval`, using the current `timeout_secs` read fresh each tick so
    /// a hot-reloaded `timeout_iv` takes effect without a restart.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        timeout_secs: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;

                let expired = self.queue.sweep_expired().await;
                if !expired.is_empty() {
                    tracing::debug!(count = expired.len(), "janitor expired stale entries");
                }

                let timed_out = self.queue.sweep_timed_out(timeout_secs()).await;
                if !timed_out.is_empty() {
                    tracing::info!(count = timed_out.len(), "janitor timed out overdue scouts");
                }
            }
        })
    }
}
