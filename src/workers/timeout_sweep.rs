use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::WorkerConfig;
use crate::services::settlement_orchestrator::{SettlementOrchestrator, SweepReport};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutSweepConfig {
    /// How often the worker wakes up.
    pub interval: Duration,
    /// Maximum number of stale intents handled per kind group and cycle.
    pub batch_size: i64,
}

impl Default for TimeoutSweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl From<&WorkerConfig> for TimeoutSweepConfig {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Times out intents whose result callback never came.
///
/// A failing cycle is logged and the next one runs as usual.
pub struct TimeoutSweepWorker {
    orchestrator: Arc<SettlementOrchestrator>,
    config: TimeoutSweepConfig,
}

impl TimeoutSweepWorker {
    pub fn new(orchestrator: Arc<SettlementOrchestrator>, config: TimeoutSweepConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            collection_deadline_secs = self.orchestrator.config().collection_deadline.as_secs(),
            disbursement_deadline_secs = self.orchestrator.config().disbursement_deadline.as_secs(),
            "timeout sweep worker started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("timeout sweep worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    self.run_cycle().await;
                }
            }
        }

        info!("timeout sweep worker stopped");
    }

    pub async fn run_cycle(&self) -> Option<SweepReport> {
        match self.orchestrator.sweep_timeouts(self.config.batch_size).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(error = %e, "timeout sweep cycle failed");
                None
            }
        }
    }
}
