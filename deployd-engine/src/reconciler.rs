use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;

use crate::service::DeployService;

/// Background worker that keeps draining the deploy task queue.
#[derive(Debug, Clone)]
pub struct ReconcilerLoop {
    worker_id: String,
    interval: Duration,
    lease_ttl: Duration,
}

impl ReconcilerLoop {
    pub fn new(worker_id: &str, interval: Duration, lease_ttl: Duration) -> Result<Self> {
        let worker_id = worker_id.trim();
        if worker_id.is_empty() {
            return Err(anyhow!("runtime deploy reconciler worker id is required"));
        }
        if interval.is_zero() {
            return Err(anyhow!("runtime deploy reconciler interval must be positive"));
        }
        if lease_ttl.is_zero() {
            return Err(anyhow!("runtime deploy reconciler lease ttl must be positive"));
        }
        Ok(Self {
            worker_id: worker_id.to_string(),
            interval,
            lease_ttl,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one pass right away and another on every tick until `shutdown`.
    pub async fn run(&self, service: &DeployService, shutdown: CancellationToken) {
        tracing::info!(
            worker_id = %self.worker_id,
            interval = ?self.interval,
            lease_ttl = ?self.lease_ttl,
            "runtime deploy reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_pass(service, &shutdown).await {
                if shutdown.is_cancelled() {
                    break;
                }
                tracing::error!(worker_id = %self.worker_id, "runtime deploy reconcile failed: {e:#}");
            }
        }
        tracing::info!(worker_id = %self.worker_id, "runtime deploy reconciler stopped");
    }

    /// Reconciles tasks until the queue has nothing claimable left.
    pub async fn run_pass(&self, service: &DeployService, shutdown: &CancellationToken) -> Result<usize> {
        let mut handled = 0;
        while !shutdown.is_cancelled() {
            if !service
                .reconcile_next(&self.worker_id, self.lease_ttl, shutdown)
                .await?
            {
                break;
            }
            handled += 1;
        }
        Ok(handled)
    }
}
