//! Drains the priority queue under a concurrency cap and dispatches scout
//! requests, one `tokio::spawn`'d task per entry.
//!
//! Grounded on `LazyIVQueue/scout/coordinator.py` (`ScoutCoordinator`):
//! `_run_loop` becomes the polling loop below, `_execute_scout` becomes
//! [`dispatch_one`], and its `finally: mark_scout_complete` becomes the
//! unconditional completion call regardless of the scout's outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::queue::{PriorityQueue, ScoutLease};
use crate::queue::SeenType;
use crate::s2grid;
use crate::scout_client::ScoutClient;

/// Lifetime counters backing `/stats`. Kept separate from the queue's
/// per-species counters since these describe the dispatcher's own view of
/// success/failure, not the queue's match bookkeeping.
#[derive(Default)]
pub struct DispatcherStats {
    pub dispatched: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

pub struct Dispatcher {
    queue: Arc<PriorityQueue>,
    scout_client: ScoutClient,
    stats: Arc<DispatcherStats>,
}

async fn dispatch_one(queue: Arc<PriorityQueue>, scout_client: ScoutClient, stats: Arc<DispatcherStats>, lease: ScoutLease) {
    stats.dispatched.fetch_add(1, Ordering::Relaxed);

    let result = if lease.entry.seen_type == SeenType::NearbyCell {
        let grid = s2grid::nine_point_grid(lease.entry.lat, lease.entry.lon);
        scout_client.scout(&grid).await
    } else {
        scout_client.scout_single(lease.entry.lat, lease.entry.lon).await
    };
    let success = result.is_ok();
    if let Err(err) = &result {
        stats.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            pokemon = %lease.entry.display(),
            area = %lease.entry.area,
            error = %err,
            "scout request failed"
        );
    } else {
        stats.succeeded.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            pokemon = %lease.entry.display(),
            area = %lease.entry.area,
            seen_type = lease.entry.seen_type.as_str(),
            "scout dispatched"
        );
    }

    // Unconditional: a failed scout still moves to awaiting_match so a late
    // IV webhook can close it out, per spec §7 / §9's documented choice.
    queue.mark_scout_complete(lease, success).await;
}

impl Dispatcher {
    pub fn new(queue: Arc<PriorityQueue>, scout_client: ScoutClient) -> Self {
        Dispatcher { queue, scout_client, stats: Arc::new(DispatcherStats::default()) }
    }

    pub fn stats(&self) -> Arc<DispatcherStats> {
        self.stats.clone()
    }

    /// Spawns the drain loop. Polls at `check_interval` whenever the queue
    /// has no eligible entry or no free concurrency slot; otherwise spawns a
    /// per-entry scout task and loops immediately.
    pub fn spawn(self: Arc<Self>, check_interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match self.queue.next_for_scout().await {
                    Some(lease) => {
                        let queue = self.queue.clone();
                        let client = self.scout_client.clone();
                        let stats = self.stats.clone();
                        tokio::spawn(dispatch_one(queue, client, stats, lease));
                    }
                    None => {
                        tokio::time::sleep(check_interval).await;
                    }
                }
            }
        })
    }
}
