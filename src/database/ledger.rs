use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::intent::{
    AppliedOutcome, CorrelationKeys, Intent, IntentKind, IntentState, NewIntent, Outcome,
    TimeoutTransition,
};
use crate::error::{AppError, AppErrorKind, DomainError};

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("booking {booking_id} already has an active {kind} intent")]
    DuplicateActiveIntent {
        booking_id: i64,
        kind: IntentKind,
        existing_id: Option<Uuid>,
    },

    #[error("intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("no intent registered for correlation key {0}")]
    UnknownCorrelationKey(String),

    #[error("intent {intent_id} cannot move from {from} to {to}")]
    InvalidTransition {
        intent_id: Uuid,
        from: IntentState,
        to: IntentState,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        let kind = match err {
            LedgerError::DuplicateActiveIntent {
                booking_id,
                kind,
                existing_id,
            } => AppErrorKind::Domain(DomainError::DuplicateActiveIntent {
                booking_id,
                kind: kind.to_string(),
                existing_intent_id: existing_id.map(|id| id.to_string()),
            }),
            LedgerError::IntentNotFound(id) => AppErrorKind::Domain(DomainError::IntentNotFound {
                reference: id.to_string(),
            }),
            LedgerError::UnknownCorrelationKey(key) => {
                AppErrorKind::Domain(DomainError::IntentNotFound { reference: key })
            }
            LedgerError::InvalidTransition {
                intent_id,
                from,
                to,
            } => AppErrorKind::Domain(DomainError::InvalidTransition {
                intent_id: intent_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            LedgerError::Database(db) => return db.into(),
        };
        AppError::new(kind)
    }
}

/// Durable store of settlement intents.
///
/// The ledger is the only writer of intent state. Every write is atomic and no
/// implementation holds a transaction across a gateway call.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Insert a `created` intent. Fails with `DuplicateActiveIntent` while the
    /// booking has a non-terminal intent of the same kind.
    async fn create_intent(&self, new: NewIntent) -> LedgerResult<Intent>;

    /// Insert an intent that is `succeeded` from the start (nothing to send).
    async fn record_completed(&self, new: NewIntent, receipt: Option<String>)
        -> LedgerResult<Intent>;

    /// `created -> submitted`, registering locally generated keys first so a
    /// callback that overtakes the submission write still resolves.
    async fn begin_submission(
        &self,
        intent_id: Uuid,
        pre_keys: &CorrelationKeys,
    ) -> LedgerResult<Intent>;

    /// `created|submitted -> awaiting_callback` plus key registration. An
    /// intent that already reached a terminal state is returned unchanged.
    async fn record_submission(
        &self,
        intent_id: Uuid,
        keys: &CorrelationKeys,
    ) -> LedgerResult<Intent>;

    /// Apply a gateway outcome to the intent registered under `correlation_key`.
    async fn apply_outcome(
        &self,
        correlation_key: &str,
        outcome: Outcome,
    ) -> LedgerResult<AppliedOutcome>;

    /// `created|submitted -> failed` after a synchronous gateway rejection.
    async fn mark_failed(
        &self,
        intent_id: Uuid,
        reason: &str,
        result_code: Option<&str>,
    ) -> LedgerResult<Intent>;

    /// Compare-and-set from any non-terminal state to `timed_out`.
    async fn mark_timed_out(&self, intent_id: Uuid, reason: &str)
        -> LedgerResult<TimeoutTransition>;

    async fn get_intent(&self, intent_id: Uuid) -> LedgerResult<Option<Intent>>;

    async fn find_by_correlation_key(&self, key: &str) -> LedgerResult<Option<Intent>>;

    /// Oldest first
    async fn list_for_booking(&self, booking_id: i64) -> LedgerResult<Vec<Intent>>;

    async fn latest_for_booking(
        &self,
        booking_id: i64,
        kind: IntentKind,
    ) -> LedgerResult<Option<Intent>>;

    /// Non-terminal intents of `kinds` whose last transition is older than `older_than`.
    async fn find_stale(
        &self,
        kinds: &[IntentKind],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Intent>>;

    /// Whether a later attempt names this intent as `retry_of`
    async fn has_superseding_attempt(&self, intent_id: Uuid) -> LedgerResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::error::DatabaseErrorKind;

    #[test]
    fn duplicate_maps_to_conflict() {
        let id = Uuid::new_v4();
        let err: AppError = LedgerError::DuplicateActiveIntent {
            booking_id: 4,
            kind: IntentKind::OwnerPayout,
            existing_id: Some(id),
        }
        .into();
        assert_eq!(err.status_code(), 409);
        assert!(err.user_message().contains("owner payout"));
    }

    #[test]
    fn unknown_key_maps_to_not_found() {
        let err: AppError = LedgerError::UnknownCorrelationKey("ws_CO_1".to_string()).into();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn database_errors_keep_retry_class() {
        let err: AppError =
            LedgerError::Database(DatabaseError::new(DatabaseErrorKind::PoolExhausted)).into();
        assert_eq!(err.status_code(), 500);
        assert!(err.is_retryable());
    }
}
