use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use crate::services::webhook_processor::WebhookProcessor;

const RETRY_BATCH_SIZE: i64 = 50;

/// Replays callbacks that could not be applied on arrival
pub struct WebhookRetryWorker {
    processor: Arc<WebhookProcessor>,
    interval: Duration,
    max_retries: i32,
}

impl WebhookRetryWorker {
    pub fn new(processor: Arc<WebhookProcessor>, interval: Duration, max_retries: i32) -> Self {
        Self {
            processor,
            interval,
            max_retries,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        info!(
            interval_secs = self.interval.as_secs(),
            max_retries = self.max_retries,
            "Webhook retry worker started"
        );

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.run_once().await,
            }
        }

        info!("Webhook retry worker stopped");
    }

    pub async fn run_once(&self) {
        match self
            .processor
            .retry_pending(RETRY_BATCH_SIZE, self.max_retries)
            .await
        {
            Ok(count) => {
                if count > 0 {
                    info!(processed = count, "Retried pending webhooks");
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to retry pending webhooks");
            }
        }
    }
}
