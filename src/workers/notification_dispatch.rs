use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::services::notification::{Notification, NotificationSink};

const MAX_DELIVERY_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Workers sharing one notification queue
pub struct NotificationWorkerPool {
    receiver: Arc<Mutex<mpsc::Receiver<Notification>>>,
    sink: Arc<dyn NotificationSink>,
    workers: usize,
}

impl NotificationWorkerPool {
    pub fn new(
        receiver: mpsc::Receiver<Notification>,
        sink: Arc<dyn NotificationSink>,
        workers: usize,
    ) -> Self {
        Self {
            receiver: Arc::new(Mutex::new(receiver)),
            sink,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. They stop on shutdown or when every sender is gone.
    pub fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "notification workers started");
        (0..self.workers)
            .map(|worker_id| {
                let receiver = Arc::clone(&self.receiver);
                let sink = Arc::clone(&self.sink);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(run_worker(worker_id, receiver, sink, shutdown_rx))
            })
            .collect()
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Notification>>>,
    sink: Arc<dyn NotificationSink>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
            next = async { receiver.lock().await.recv().await } => next,
        };

        let Some(notification) = next else {
            break;
        };
        deliver_with_retry(sink.as_ref(), &notification).await;
    }
    debug!(worker_id = worker_id, "notification worker stopped");
}

/// Deliver, retrying with doubling backoff. Returns whether delivery succeeded.
pub async fn deliver_with_retry(sink: &dyn NotificationSink, notification: &Notification) -> bool {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_DELIVERY_ATTEMPTS {
        match sink.deliver(notification).await {
            Ok(()) => return true,
            Err(e) if attempt < MAX_DELIVERY_ATTEMPTS => {
                warn!(
                    notification_id = %notification.id,
                    template = notification.template.as_str(),
                    attempt = attempt,
                    error = %e,
                    "notification delivery failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                error!(
                    notification_id = %notification.id,
                    template = notification.template.as_str(),
                    booking_id = notification.booking_id,
                    error = %e,
                    "notification dropped after {} attempts",
                    MAX_DELIVERY_ATTEMPTS
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::notification::{
        Audience, NotificationDispatcher, NotificationError, NotificationTemplate,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakySink {
        failures_left: AtomicU32,
        delivered: AtomicU32,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver(&self, _notification: &Notification) -> Result<(), NotificationError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(NotificationError::Delivery("smtp down".to_string()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn flaky(failures: u32) -> Arc<FlakySink> {
        Arc::new(FlakySink {
            failures_left: AtomicU32::new(failures),
            delivered: AtomicU32::new(0),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_delivered() {
        let sink = flaky(2);
        let n = Notification::new(NotificationTemplate::RefundProcessed, Audience::Guest, 1);
        assert!(deliver_with_retry(sink.as_ref(), &n).await);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_attempts() {
        let sink = flaky(5);
        let n = Notification::new(NotificationTemplate::RefundFailed, Audience::Guest, 1);
        assert!(!deliver_with_retry(sink.as_ref(), &n).await);
        assert_eq!(sink.failures_left.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_when_senders_close() {
        let sink = flaky(0);
        let (dispatcher, receiver) = NotificationDispatcher::new(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = NotificationWorkerPool::new(receiver, sink.clone(), 2).spawn(shutdown_rx);

        for booking_id in 0..5 {
            dispatcher.notify(NotificationTemplate::BookingConfirmed, Audience::Guest, booking_id);
        }
        drop(dispatcher);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 5);
    }
}
