//! Templated notifications queued for background delivery.
//!
//! Producers enqueue and move on; the worker pool in
//! `workers::notification_dispatch` delivers through a `NotificationSink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::logging::mask_phone;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTemplate {
    BookingConfirmed,
    PaymentFailed,
    PaymentTimedOut,
    RefundProcessed,
    RefundFailed,
    RefundNotApplicable,
    OwnerPayoutSent,
    OwnerPayoutFailed,
    OperatorAlert,
}

impl NotificationTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationTemplate::BookingConfirmed => "booking_confirmed",
            NotificationTemplate::PaymentFailed => "payment_failed",
            NotificationTemplate::PaymentTimedOut => "payment_timed_out",
            NotificationTemplate::RefundProcessed => "refund_processed",
            NotificationTemplate::RefundFailed => "refund_failed",
            NotificationTemplate::RefundNotApplicable => "refund_not_applicable",
            NotificationTemplate::OwnerPayoutSent => "owner_payout_sent",
            NotificationTemplate::OwnerPayoutFailed => "owner_payout_failed",
            NotificationTemplate::OperatorAlert => "operator_alert",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Audience {
    Guest,
    Owner,
    Operators,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub template: NotificationTemplate,
    pub audience: Audience,
    pub booking_id: i64,
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(template: NotificationTemplate, audience: Audience, booking_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            template,
            audience,
            booking_id,
            context: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// Final delivery channel (email, SMS, push...)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the log
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotificationError> {
        let phone = notification
            .context
            .get("phone")
            .map(|p| mask_phone(p))
            .unwrap_or_default();
        if notification.template == NotificationTemplate::OperatorAlert {
            error!(
                notification_id = %notification.id,
                template = notification.template.as_str(),
                booking_id = notification.booking_id,
                context = ?notification.context,
                "operator alert raised"
            );
        } else {
            info!(
                notification_id = %notification.id,
                template = notification.template.as_str(),
                audience = ?notification.audience,
                booking_id = notification.booking_id,
                phone = %phone,
                "notification delivered"
            );
        }
        Ok(())
    }
}

/// Handle for enqueueing notifications
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Queue without waiting. A full queue hands the send to a background task.
    pub fn enqueue(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(notification)) => {
                warn!(
                    template = notification.template.as_str(),
                    booking_id = notification.booking_id,
                    "notification queue full, deferring"
                );
                let sender = self.sender.clone();
                tokio::spawn(async move {
                    if sender.send(notification).await.is_err() {
                        error!("notification queue closed, notification dropped");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(notification)) => {
                error!(
                    template = notification.template.as_str(),
                    booking_id = notification.booking_id,
                    "notification queue closed, notification dropped"
                );
            }
        }
    }

    pub fn notify(&self, template: NotificationTemplate, audience: Audience, booking_id: i64) {
        self.enqueue(Notification::new(template, audience, booking_id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_reaches_receiver() {
        let (dispatcher, mut receiver) = NotificationDispatcher::new(4);
        dispatcher.enqueue(
            Notification::new(NotificationTemplate::BookingConfirmed, Audience::Guest, 3)
                .with("amount", "5000.00"),
        );
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.template, NotificationTemplate::BookingConfirmed);
        assert_eq!(received.context.get("amount").map(String::as_str), Some("5000.00"));
    }

    #[tokio::test]
    async fn full_queue_defers_instead_of_dropping() {
        let (dispatcher, mut receiver) = NotificationDispatcher::new(1);
        dispatcher.notify(NotificationTemplate::PaymentFailed, Audience::Guest, 1);
        dispatcher.notify(NotificationTemplate::PaymentTimedOut, Audience::Guest, 2);

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert_eq!(first.booking_id, 1);
        assert_eq!(second.booking_id, 2);
    }

    #[tokio::test]
    async fn log_sink_accepts_everything() {
        let n = Notification::new(NotificationTemplate::OperatorAlert, Audience::Operators, 9)
            .with("reason", "late success after retry");
        assert!(LogSink.deliver(&n).await.is_ok());
    }

    #[test]
    fn template_names_are_snake_case() {
        assert_eq!(
            serde_json::to_value(NotificationTemplate::RefundNotApplicable).unwrap(),
            "refund_not_applicable"
        );
        assert_eq!(NotificationTemplate::OwnerPayoutSent.as_str(), "owner_payout_sent");
    }
}
