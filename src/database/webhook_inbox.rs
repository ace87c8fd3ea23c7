use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::repository::TransactionalRepository;

/// Which callback route an event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookFlow {
    CollectionResult,
    CollectionTimeout,
    DisbursementResult,
    DisbursementTimeout,
}

impl WebhookFlow {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookFlow::CollectionResult => "collection_result",
            WebhookFlow::CollectionTimeout => "collection_timeout",
            WebhookFlow::DisbursementResult => "disbursement_result",
            WebhookFlow::DisbursementTimeout => "disbursement_timeout",
        }
    }
}

impl FromStr for WebhookFlow {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection_result" => Ok(WebhookFlow::CollectionResult),
            "collection_timeout" => Ok(WebhookFlow::CollectionTimeout),
            "disbursement_result" => Ok(WebhookFlow::DisbursementResult),
            "disbursement_timeout" => Ok(WebhookFlow::DisbursementTimeout),
            other => Err(DatabaseError::unknown(format!(
                "unknown webhook flow '{}'",
                other
            ))),
        }
    }
}

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_COMPLETED: &str = "completed";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    /// Flow, correlation key and result code; duplicates share it
    pub event_id: String,
    pub flow: WebhookFlow,
    pub correlation_key: String,
    pub payload: JsonValue,
    pub status: String,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl WebhookEvent {
    pub fn is_completed(&self) -> bool {
        self.status == STATUS_COMPLETED
    }
}

/// Log of inbound callbacks, written before they are applied
#[async_trait]
pub trait WebhookInbox: Send + Sync {
    /// Record an event, or return the existing row for a duplicate `event_id`.
    async fn log_event(
        &self,
        event_id: &str,
        flow: WebhookFlow,
        correlation_key: &str,
        payload: JsonValue,
    ) -> Result<WebhookEvent, DatabaseError>;

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Count a failed attempt. The event stays pending for the retry worker.
    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Give up on an event that can never be applied.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Pending events with fewer than `max_retries` attempts, oldest first
    async fn get_pending_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;
}

#[derive(Debug, FromRow)]
struct WebhookEventRow {
    id: Uuid,
    event_id: String,
    flow: String,
    correlation_key: String,
    payload: JsonValue,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<WebhookEventRow> for WebhookEvent {
    type Error = DatabaseError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            id: row.id,
            event_id: row.event_id,
            flow: row.flow.parse()?,
            correlation_key: row.correlation_key,
            payload: row.payload,
            status: row.status,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
            processed_at: row.processed_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, event_id, flow, correlation_key, payload, status, retry_count, \
                             last_error, created_at, processed_at";

pub struct PgWebhookInbox {
    pool: PgPool,
}

impl PgWebhookInbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl TransactionalRepository for PgWebhookInbox {
    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WebhookInbox for PgWebhookInbox {
    async fn log_event(
        &self,
        event_id: &str,
        flow: WebhookFlow,
        correlation_key: &str,
        payload: JsonValue,
    ) -> Result<WebhookEvent, DatabaseError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let sql = format!(
            "INSERT INTO webhook_events (id, event_id, flow, correlation_key, payload) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (event_id) DO UPDATE SET event_id = EXCLUDED.event_id \
             RETURNING {}",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(event_id)
            .bind(flow.as_str())
            .bind(correlation_key)
            .bind(payload)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .try_into()
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = 'completed', processed_at = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET retry_count = retry_count + 1, last_error = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE webhook_events \
             SET status = 'failed', last_error = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn get_pending_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM webhook_events \
             WHERE status = 'pending' AND retry_count < $2 \
             ORDER BY created_at ASC LIMIT $1",
            EVENT_COLUMNS
        );
        sqlx::query_as::<_, WebhookEventRow>(&sql)
            .bind(limit)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .into_iter()
            .map(WebhookEvent::try_from)
            .collect()
    }
}

#[derive(Default)]
struct InboxState {
    events: HashMap<Uuid, WebhookEvent>,
    by_event_id: HashMap<String, Uuid>,
}

/// Inbox kept in process memory
#[derive(Default)]
pub struct MemoryWebhookInbox {
    state: Mutex<InboxState>,
}

impl MemoryWebhookInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<WebhookEvent> {
        self.state.lock().await.events.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl WebhookInbox for MemoryWebhookInbox {
    async fn log_event(
        &self,
        event_id: &str,
        flow: WebhookFlow,
        correlation_key: &str,
        payload: JsonValue,
    ) -> Result<WebhookEvent, DatabaseError> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .by_event_id
            .get(event_id)
            .and_then(|id| state.events.get(id))
        {
            return Ok(existing.clone());
        }

        let event = WebhookEvent {
            id: Uuid::new_v4(),
            event_id: event_id.to_string(),
            flow,
            correlation_key: correlation_key.to_string(),
            payload,
            status: STATUS_PENDING.to_string(),
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
            processed_at: None,
        };
        state.by_event_id.insert(event.event_id.clone(), event.id);
        state.events.insert(event.id, event.clone());
        Ok(event)
    }

    async fn mark_processed(&self, id: Uuid) -> Result<(), DatabaseError> {
        if let Some(event) = self.state.lock().await.events.get_mut(&id) {
            event.status = STATUS_COMPLETED.to_string();
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        if let Some(event) = self.state.lock().await.events.get_mut(&id) {
            if event.status == STATUS_PENDING {
                event.retry_count += 1;
                event.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), DatabaseError> {
        if let Some(event) = self.state.lock().await.events.get_mut(&id) {
            if event.status == STATUS_PENDING {
                event.status = STATUS_FAILED.to_string();
                event.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn get_pending_events(
        &self,
        limit: i64,
        max_retries: i32,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        let state = self.state.lock().await;
        let mut pending: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| e.status == STATUS_PENDING && e.retry_count < max_retries)
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_event_id_returns_existing_row() {
        let inbox = MemoryWebhookInbox::new();
        let first = inbox
            .log_event("collection:ws_CO_1:0", WebhookFlow::CollectionResult, "ws_CO_1", json!({}))
            .await
            .unwrap();
        inbox.mark_processed(first.id).await.unwrap();

        let second = inbox
            .log_event("collection:ws_CO_1:0", WebhookFlow::CollectionResult, "ws_CO_1", json!({}))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert!(second.is_completed());
        assert_eq!(inbox.len().await, 1);
    }

    #[tokio::test]
    async fn pending_events_respect_retry_cap() {
        let inbox = MemoryWebhookInbox::new();
        let event = inbox
            .log_event("e1", WebhookFlow::DisbursementResult, "AG_1", json!({}))
            .await
            .unwrap();
        for _ in 0..2 {
            inbox.record_failure(event.id, "unknown key").await.unwrap();
        }
        assert_eq!(inbox.get_pending_events(10, 3).await.unwrap().len(), 1);
        inbox.record_failure(event.id, "unknown key").await.unwrap();
        assert!(inbox.get_pending_events(10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_events_are_not_replayed() {
        let inbox = MemoryWebhookInbox::new();
        let event = inbox
            .log_event("e2", WebhookFlow::CollectionTimeout, "ws_CO_2", json!({}))
            .await
            .unwrap();
        inbox.mark_failed(event.id, "malformed").await.unwrap();
        assert!(inbox.get_pending_events(10, 5).await.unwrap().is_empty());
        assert_eq!(inbox.get(event.id).await.unwrap().status, STATUS_FAILED);
    }

    #[test]
    fn flow_names_parse() {
        assert_eq!(
            "disbursement_timeout".parse::<WebhookFlow>().unwrap(),
            WebhookFlow::DisbursementTimeout
        );
        assert!("other".parse::<WebhookFlow>().is_err());
    }
}
