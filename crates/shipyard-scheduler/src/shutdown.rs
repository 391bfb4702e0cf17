//! Graceful shutdown of a running engine.

use shipyard_core::Stage;
use std::sync::Arc;
use tracing::{error, info};

use crate::store::JobStore;
use crate::worker::WorkerPool;

/// Outcome of draining one worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub stage: Stage,
    /// Whether every in-flight job finished within the grace period.
    pub finished_in_time: bool,
    /// Jobs handed back to the queue because their handler was aborted.
    pub released: u64,
}

/// Owns the running pools and stops them in pipeline order.
///
/// Upstream pools drain first, so work they finish can still be picked up by
/// the downstream pools, which are still running.
pub struct ShutdownCoordinator {
    pools: Vec<WorkerPool>,
    store: Arc<dyn JobStore>,
}

impl ShutdownCoordinator {
    pub fn new(mut pools: Vec<WorkerPool>, store: Arc<dyn JobStore>) -> Self {
        pools.sort_by_key(|pool| pool.stage());
        Self { pools, store }
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.pools.iter().map(|pool| pool.stage()).collect()
    }

    /// Drain every pool with its configured grace period, then close the store.
    pub async fn shutdown(self) -> Vec<DrainReport> {
        info!(pools = self.pools.len(), "Shutting down");

        let mut reports = Vec::with_capacity(self.pools.len());
        for mut pool in self.pools {
            let grace = pool.settings().shutdown_grace;
            match pool.drain(grace).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(stage = %pool.stage(), error = %e, "Failed to drain worker pool"),
            }
        }

        self.store.close().await;
        info!(store = self.store.name(), "Job store closed");
        reports
    }
}
