//! Periodic eviction of idle runtimes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lifecycle::LifecycleManager;
use crate::registry::RuntimeRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub evicted: usize,
    pub failed: usize,
}

pub struct IdleReaper {
    registry: Arc<RuntimeRegistry>,
    lifecycle: Arc<LifecycleManager>,
    idle_timeout: Duration,
}

impl IdleReaper {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        lifecycle: Arc<LifecycleManager>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            lifecycle,
            idle_timeout,
        }
    }

    /// Evict every `Running` runtime idle longer than the timeout, as of `now`.
    /// `Error` records past the same threshold are retried for removal too.
    /// Each candidate is checked again under its tenant lock, so a runtime
    /// used or replaced while the sweep runs is left alone.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for record in self.registry.list_all().await {
            report.examined += 1;
            if !record.idle_past(now, self.idle_timeout) {
                continue;
            }
            match self
                .lifecycle
                .evict_if_idle(&record.tenant_id, record.runtime_id, now, self.idle_timeout)
                .await
            {
                Ok(true) => report.evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(tenant = %record.tenant_id, error = %e, "eviction failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Sweep every `every` until `cancel` fires.
    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report.evicted > 0 || report.failed > 0 {
                        info!(?report, "idle sweep finished");
                    } else {
                        debug!(examined = report.examined, "idle sweep finished");
                    }
                }
            }
        }
        debug!("idle reaper stopped");
    }
}
