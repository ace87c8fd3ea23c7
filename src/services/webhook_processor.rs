use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::intent::AppliedOutcome;
use crate::database::webhook_inbox::{WebhookEvent, WebhookFlow, WebhookInbox};
use crate::payments::callback::{
    parse_collection_callback, parse_disbursement_callback, parse_queue_timeout, CallbackError,
};
use crate::services::settlement_orchestrator::{OrchestratorError, SettlementOrchestrator};

#[derive(Debug, Error)]
pub enum WebhookProcessorError {
    #[error("Malformed callback: {0}")]
    Malformed(#[from] CallbackError),
    #[error("Database error: {0}")]
    DatabaseError(#[from] DatabaseError),
    #[error("Processing error: {0}")]
    ProcessingError(String),
}

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookReceipt {
    /// Applied to an intent (`transitioned` is false for replays the ledger ignored)
    Processed {
        event_id: String,
        intent_id: Uuid,
        state: String,
        transitioned: bool,
    },
    /// Same event already completed
    Duplicate { event_id: String },
    /// No intent knows the key yet; left for the retry worker
    Deferred { event_id: String },
}

pub struct WebhookProcessor {
    inbox: Arc<dyn WebhookInbox>,
    orchestrator: Arc<SettlementOrchestrator>,
}

impl WebhookProcessor {
    pub fn new(inbox: Arc<dyn WebhookInbox>, orchestrator: Arc<SettlementOrchestrator>) -> Self {
        Self {
            inbox,
            orchestrator,
        }
    }

    pub async fn process_webhook(
        &self,
        flow: WebhookFlow,
        payload: &JsonValue,
    ) -> Result<WebhookReceipt, WebhookProcessorError> {
        let (event_id, correlation_key) = event_identity(flow, payload)?;

        // Log first; a duplicate event id returns the existing row
        let webhook_event = self
            .inbox
            .log_event(&event_id, flow, &correlation_key, payload.clone())
            .await?;

        if webhook_event.is_completed() {
            info!(event_id = %event_id, "Webhook already processed");
            return Ok(WebhookReceipt::Duplicate { event_id });
        }

        match self.apply(flow, payload).await {
            Ok(applied) => {
                self.inbox.mark_processed(webhook_event.id).await?;
                info!(
                    event_id = %event_id,
                    intent_id = %applied.intent.id,
                    transitioned = applied.applied,
                    "Webhook processed successfully"
                );
                Ok(WebhookReceipt::Processed {
                    event_id,
                    intent_id: applied.intent.id,
                    state: applied.intent.state.to_string(),
                    transitioned: applied.applied,
                })
            }
            Err(e) if e.is_unknown_correlation_key() => {
                warn!(
                    event_id = %event_id,
                    correlation_key = %correlation_key,
                    "Webhook for unknown intent, deferring"
                );
                self.inbox
                    .record_failure(webhook_event.id, &e.to_string())
                    .await?;
                Ok(WebhookReceipt::Deferred { event_id })
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Webhook processing failed");
                self.inbox
                    .record_failure(webhook_event.id, &e.to_string())
                    .await?;
                Err(WebhookProcessorError::ProcessingError(e.to_string()))
            }
        }
    }

    async fn apply(
        &self,
        flow: WebhookFlow,
        payload: &JsonValue,
    ) -> Result<AppliedOutcome, OrchestratorError> {
        match flow {
            WebhookFlow::CollectionResult => {
                self.orchestrator.process_collection_webhook(payload).await
            }
            WebhookFlow::CollectionTimeout => {
                self.orchestrator
                    .process_collection_timeout_webhook(payload)
                    .await
            }
            WebhookFlow::DisbursementResult => {
                self.orchestrator.process_disbursement_webhook(payload).await
            }
            WebhookFlow::DisbursementTimeout => {
                self.orchestrator
                    .process_disbursement_timeout_webhook(payload)
                    .await
            }
        }
    }

    /// Retry pending webhooks (called by background worker)
    pub async fn retry_pending(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<usize, WebhookProcessorError> {
        let pending = self.inbox.get_pending_events(limit, max_retries).await?;

        let mut processed = 0;
        for webhook in pending {
            if self.replay(&webhook).await {
                processed += 1;
            }
        }

        Ok(processed)
    }

    async fn replay(&self, webhook: &WebhookEvent) -> bool {
        match self.apply(webhook.flow, &webhook.payload).await {
            Ok(_) => {
                if let Err(e) = self.inbox.mark_processed(webhook.id).await {
                    error!(event_id = %webhook.event_id, error = %e, "Failed to mark webhook processed");
                    return false;
                }
                info!(
                    event_id = %webhook.event_id,
                    attempt = webhook.retry_count + 1,
                    "Pending webhook applied"
                );
                true
            }
            Err(OrchestratorError::Callback(e)) => {
                // Cannot become valid by waiting
                if let Err(db) = self.inbox.mark_failed(webhook.id, &e.to_string()).await {
                    error!(event_id = %webhook.event_id, error = %db, "Failed to mark webhook failed");
                }
                false
            }
            Err(e) => {
                if let Err(db) = self.inbox.record_failure(webhook.id, &e.to_string()).await {
                    error!(event_id = %webhook.event_id, error = %db, "Failed to record webhook failure");
                }
                false
            }
        }
    }
}

/// Event id and lookup key of a callback.
///
/// The event id combines flow, correlation key and result code so a redelivery
/// of the same result collapses while a different result for the same intent
/// is still logged.
pub fn event_identity(
    flow: WebhookFlow,
    payload: &JsonValue,
) -> Result<(String, String), CallbackError> {
    let (key, code) = match flow {
        WebhookFlow::CollectionResult => {
            let callback = parse_collection_callback(payload)?;
            (first_key(callback.correlation_keys())?, Some(callback.result_code))
        }
        WebhookFlow::DisbursementResult => {
            let callback = parse_disbursement_callback(payload)?;
            (first_key(callback.correlation_keys())?, Some(callback.result_code))
        }
        WebhookFlow::CollectionTimeout | WebhookFlow::DisbursementTimeout => {
            let timeout = parse_queue_timeout(payload)?;
            (first_key(timeout.correlation_keys)?, None)
        }
    };

    let event_id = match code {
        Some(code) => format!("{}:{}:{}", flow.as_str(), key, code),
        None => format!("{}:{}", flow.as_str(), key),
    };
    Ok((event_id, key))
}

fn first_key(keys: Vec<String>) -> Result<String, CallbackError> {
    keys.into_iter()
        .next()
        .ok_or(CallbackError::MissingCorrelationKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_event_id_includes_result_code() {
        let payload = json!({
            "Body": {"stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": "ws_CO_191220191020363925",
                "ResultCode": 1032,
                "ResultDesc": "Request cancelled by user"
            }}
        });
        let (event_id, key) = event_identity(WebhookFlow::CollectionResult, &payload).unwrap();
        assert_eq!(key, "ws_CO_191220191020363925");
        assert_eq!(event_id, "collection_result:ws_CO_191220191020363925:1032");
    }

    #[test]
    fn disbursement_event_id_prefers_originator() {
        let payload = json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "OriginatorConversationID": "5f0c3b0e-origin",
                "ConversationID": "AG_20191219_00005797af5d7d75f652",
                "TransactionID": "NLJ41HAY6Q"
            }
        });
        let (event_id, key) = event_identity(WebhookFlow::DisbursementResult, &payload).unwrap();
        assert_eq!(key, "5f0c3b0e-origin");
        assert_eq!(event_id, "disbursement_result:5f0c3b0e-origin:0");
    }

    #[test]
    fn payload_without_keys_is_malformed() {
        let payload = json!({"Body": {"stkCallback": {"ResultCode": 0, "ResultDesc": "ok"}}});
        assert!(event_identity(WebhookFlow::CollectionResult, &payload).is_err());
    }
}
