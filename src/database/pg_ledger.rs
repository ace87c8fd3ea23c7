use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::database::error::DatabaseError;
use crate::database::intent::{
    AppliedOutcome, CorrelationKeys, Intent, IntentBreakdown, IntentKind, IntentState, NewIntent,
    Outcome, TimeoutTransition,
};
use crate::database::ledger::{Ledger, LedgerError, LedgerResult};
use crate::database::repository::TransactionalRepository;

const ONE_ACTIVE_CONSTRAINT: &str = "settlement_intents_one_active";

const INTENT_COLUMNS: &str = "id, booking_id, kind, state, phone, amount, currency, \
     merchant_request_id, checkout_request_id, conversation_id, originator_conversation_id, \
     receipt, result_code, failure_reason, raw_result, breakdown, retry_of, attempt, late, \
     created_at, submitted_at, completed_at, updated_at";

#[derive(Debug, FromRow)]
struct IntentRow {
    id: Uuid,
    booking_id: i64,
    kind: String,
    state: String,
    phone: String,
    amount: Decimal,
    currency: String,
    merchant_request_id: Option<String>,
    checkout_request_id: Option<String>,
    conversation_id: Option<String>,
    originator_conversation_id: Option<String>,
    receipt: Option<String>,
    result_code: Option<String>,
    failure_reason: Option<String>,
    raw_result: Option<JsonValue>,
    breakdown: Json<IntentBreakdown>,
    retry_of: Option<Uuid>,
    attempt: i32,
    late: bool,
    created_at: DateTime<Utc>,
    submitted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<IntentRow> for Intent {
    type Error = DatabaseError;

    fn try_from(row: IntentRow) -> Result<Self, Self::Error> {
        Ok(Intent {
            id: row.id,
            booking_id: row.booking_id,
            kind: row.kind.parse().map_err(DatabaseError::unknown)?,
            state: row.state.parse().map_err(DatabaseError::unknown)?,
            phone: row.phone,
            amount: row.amount,
            currency: row.currency,
            merchant_request_id: row.merchant_request_id,
            checkout_request_id: row.checkout_request_id,
            conversation_id: row.conversation_id,
            originator_conversation_id: row.originator_conversation_id,
            receipt: row.receipt,
            result_code: row.result_code,
            failure_reason: row.failure_reason,
            raw_result: row.raw_result,
            breakdown: row.breakdown.0,
            retry_of: row.retry_of,
            attempt: row.attempt,
            late: row.late,
            created_at: row.created_at,
            submitted_at: row.submitted_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

fn non_terminal_states() -> Vec<String> {
    IntentState::NON_TERMINAL
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

/// PostgreSQL ledger.
///
/// Each operation runs in its own transaction; the row is locked with
/// `FOR UPDATE` before any state check.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert(
        &self,
        new: NewIntent,
        state: IntentState,
        receipt: Option<&str>,
    ) -> LedgerResult<Intent> {
        let sql = format!(
            "INSERT INTO settlement_intents \
             (id, booking_id, kind, state, phone, amount, currency, breakdown, retry_of, attempt, \
              receipt, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, \
                     CASE WHEN $4 = 'succeeded' THEN NOW() ELSE NULL END) \
             RETURNING {}",
            INTENT_COLUMNS
        );

        let result = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.booking_id)
            .bind(new.kind.as_str())
            .bind(state.as_str())
            .bind(&new.phone)
            .bind(new.amount)
            .bind(&new.currency)
            .bind(Json(&new.breakdown))
            .bind(new.retry_of)
            .bind(new.attempt)
            .bind(receipt)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx);

        match result {
            Ok(row) => Ok(row.try_into()?),
            Err(err) if err.constraint() == Some(ONE_ACTIVE_CONSTRAINT) => {
                let existing = self.active_intent_id(new.booking_id, new.kind).await?;
                debug!(
                    booking_id = new.booking_id,
                    kind = %new.kind,
                    existing_intent_id = ?existing,
                    "active intent already exists"
                );
                Err(LedgerError::DuplicateActiveIntent {
                    booking_id: new.booking_id,
                    kind: new.kind,
                    existing_id: existing,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn active_intent_id(
        &self,
        booking_id: i64,
        kind: IntentKind,
    ) -> Result<Option<Uuid>, DatabaseError> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT id FROM settlement_intents \
             WHERE booking_id = $1 AND kind = $2 AND state = ANY($3) \
             LIMIT 1",
        )
        .bind(booking_id)
        .bind(kind.as_str())
        .bind(non_terminal_states())
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    async fn lock_intent(
        tx: &mut Transaction<'static, Postgres>,
        intent_id: Uuid,
    ) -> LedgerResult<Intent> {
        let sql = format!(
            "SELECT {} FROM settlement_intents WHERE id = $1 FOR UPDATE",
            INTENT_COLUMNS
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(intent_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .ok_or(LedgerError::IntentNotFound(intent_id))?;
        Ok(row.try_into()?)
    }

    async fn register_keys(
        tx: &mut Transaction<'static, Postgres>,
        intent_id: Uuid,
        keys: &CorrelationKeys,
    ) -> Result<(), DatabaseError> {
        for key in keys.keys() {
            let owner = sqlx::query_scalar::<_, Uuid>(
                "INSERT INTO intent_correlation_keys (correlation_key, intent_id) \
                 VALUES ($1, $2) \
                 ON CONFLICT (correlation_key) DO UPDATE SET correlation_key = EXCLUDED.correlation_key \
                 RETURNING intent_id",
            )
            .bind(key)
            .bind(intent_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            if owner != intent_id {
                warn!(
                    correlation_key = %key,
                    intent_id = %intent_id,
                    registered_to = %owner,
                    "correlation key already registered to another intent"
                );
            }
        }
        Ok(())
    }

    /// Persist the columns an outcome or submission touches
    async fn write_intent(
        tx: &mut Transaction<'static, Postgres>,
        intent: &Intent,
    ) -> LedgerResult<Intent> {
        let sql = format!(
            "UPDATE settlement_intents SET \
                state = $2, merchant_request_id = $3, checkout_request_id = $4, \
                conversation_id = $5, originator_conversation_id = $6, receipt = $7, \
                result_code = $8, failure_reason = $9, raw_result = $10, late = $11, \
                submitted_at = $12, completed_at = $13, updated_at = $14 \
             WHERE id = $1 \
             RETURNING {}",
            INTENT_COLUMNS
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(intent.id)
            .bind(intent.state.as_str())
            .bind(&intent.merchant_request_id)
            .bind(&intent.checkout_request_id)
            .bind(&intent.conversation_id)
            .bind(&intent.originator_conversation_id)
            .bind(&intent.receipt)
            .bind(&intent.result_code)
            .bind(&intent.failure_reason)
            .bind(&intent.raw_result)
            .bind(intent.late)
            .bind(intent.submitted_at)
            .bind(intent.completed_at)
            .bind(intent.updated_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.try_into()?)
    }

    async fn fetch_many(&self, sql: &str, booking_id: i64) -> LedgerResult<Vec<Intent>> {
        let rows = sqlx::query_as::<_, IntentRow>(sql)
            .bind(booking_id)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter()
            .map(|row| Intent::try_from(row).map_err(LedgerError::from))
            .collect()
    }
}

impl TransactionalRepository for PgLedger {
    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn create_intent(&self, new: NewIntent) -> LedgerResult<Intent> {
        self.insert(new, IntentState::Created, None).await
    }

    async fn record_completed(
        &self,
        new: NewIntent,
        receipt: Option<String>,
    ) -> LedgerResult<Intent> {
        self.insert(new, IntentState::Succeeded, receipt.as_deref())
            .await
    }

    async fn begin_submission(
        &self,
        intent_id: Uuid,
        pre_keys: &CorrelationKeys,
    ) -> LedgerResult<Intent> {
        let mut tx = self.begin().await?;
        let mut intent = Self::lock_intent(&mut tx, intent_id).await?;
        if intent.state != IntentState::Created {
            return Err(LedgerError::InvalidTransition {
                intent_id,
                from: intent.state,
                to: IntentState::Submitted,
            });
        }

        Self::register_keys(&mut tx, intent_id, pre_keys).await?;
        let now = Utc::now();
        pre_keys.write_to(&mut intent);
        intent.state = IntentState::Submitted;
        intent.submitted_at = Some(now);
        intent.updated_at = now;
        let intent = Self::write_intent(&mut tx, &intent).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(intent)
    }

    async fn record_submission(
        &self,
        intent_id: Uuid,
        keys: &CorrelationKeys,
    ) -> LedgerResult<Intent> {
        let mut tx = self.begin().await?;
        let mut intent = Self::lock_intent(&mut tx, intent_id).await?;

        Self::register_keys(&mut tx, intent_id, keys).await?;
        keys.write_to(&mut intent);
        if !intent.is_terminal() {
            let now = Utc::now();
            intent.state = IntentState::AwaitingCallback;
            intent.submitted_at.get_or_insert(now);
            intent.updated_at = now;
        }
        let intent = Self::write_intent(&mut tx, &intent).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(intent)
    }

    async fn apply_outcome(
        &self,
        correlation_key: &str,
        outcome: Outcome,
    ) -> LedgerResult<AppliedOutcome> {
        let mut tx = self.begin().await?;
        let intent_id = sqlx::query_scalar::<_, Uuid>(
            "SELECT intent_id FROM intent_correlation_keys WHERE correlation_key = $1",
        )
        .bind(correlation_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DatabaseError::from_sqlx)?
        .ok_or_else(|| LedgerError::UnknownCorrelationKey(correlation_key.to_string()))?;

        let mut intent = Self::lock_intent(&mut tx, intent_id).await?;
        let previous_state = intent.state;
        if !outcome.applies_to(previous_state) {
            return Ok(AppliedOutcome {
                intent,
                previous_state,
                applied: false,
                late: false,
            });
        }

        outcome.apply(&mut intent, Utc::now());
        let intent = Self::write_intent(&mut tx, &intent).await?;
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;

        Ok(AppliedOutcome {
            late: intent.late,
            intent,
            previous_state,
            applied: true,
        })
    }

    async fn mark_failed(
        &self,
        intent_id: Uuid,
        reason: &str,
        result_code: Option<&str>,
    ) -> LedgerResult<Intent> {
        let mut tx = self.begin().await?;
        let mut intent = Self::lock_intent(&mut tx, intent_id).await?;
        if !matches!(intent.state, IntentState::Created | IntentState::Submitted) {
            return Err(LedgerError::InvalidTransition {
                intent_id,
                from: intent.state,
                to: IntentState::Failed,
            });
        }

        Outcome::Failed {
            reason: reason.to_string(),
            result_code: result_code.map(str::to_string),
            raw: None,
        }
        .apply(&mut intent, Utc::now());
        let intent = Self::write_intent(&mut tx, &intent).await?;

        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(intent)
    }

    async fn mark_timed_out(
        &self,
        intent_id: Uuid,
        reason: &str,
    ) -> LedgerResult<TimeoutTransition> {
        let sql = format!(
            "UPDATE settlement_intents \
             SET state = 'timed_out', failure_reason = $3, completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND state = ANY($2) \
             RETURNING {}",
            INTENT_COLUMNS
        );
        let updated = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(intent_id)
            .bind(non_terminal_states())
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        match updated {
            Some(row) => Ok(TimeoutTransition::TimedOut(row.try_into()?)),
            None => {
                let current = self
                    .get_intent(intent_id)
                    .await?
                    .ok_or(LedgerError::IntentNotFound(intent_id))?;
                Ok(TimeoutTransition::AlreadyTerminal(current))
            }
        }
    }

    async fn get_intent(&self, intent_id: Uuid) -> LedgerResult<Option<Intent>> {
        let sql = format!("SELECT {} FROM settlement_intents WHERE id = $1", INTENT_COLUMNS);
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(intent_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Intent::try_from).transpose()?)
    }

    async fn find_by_correlation_key(&self, key: &str) -> LedgerResult<Option<Intent>> {
        let sql = format!(
            "SELECT {} FROM settlement_intents \
             WHERE id = (SELECT intent_id FROM intent_correlation_keys WHERE correlation_key = $1)",
            INTENT_COLUMNS
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Intent::try_from).transpose()?)
    }

    async fn list_for_booking(&self, booking_id: i64) -> LedgerResult<Vec<Intent>> {
        let sql = format!(
            "SELECT {} FROM settlement_intents WHERE booking_id = $1 \
             ORDER BY created_at ASC, attempt ASC",
            INTENT_COLUMNS
        );
        self.fetch_many(&sql, booking_id).await
    }

    async fn latest_for_booking(
        &self,
        booking_id: i64,
        kind: IntentKind,
    ) -> LedgerResult<Option<Intent>> {
        let sql = format!(
            "SELECT {} FROM settlement_intents WHERE booking_id = $1 AND kind = $2 \
             ORDER BY created_at DESC, attempt DESC LIMIT 1",
            INTENT_COLUMNS
        );
        let row = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(booking_id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(row.map(Intent::try_from).transpose()?)
    }

    async fn find_stale(
        &self,
        kinds: &[IntentKind],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Intent>> {
        let kinds: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {} FROM settlement_intents \
             WHERE kind = ANY($1) AND state = ANY($2) AND updated_at <= $3 \
             ORDER BY updated_at ASC LIMIT $4",
            INTENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, IntentRow>(&sql)
            .bind(kinds)
            .bind(non_terminal_states())
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        rows.into_iter()
            .map(|row| Intent::try_from(row).map_err(LedgerError::from))
            .collect()
    }

    async fn has_superseding_attempt(&self, intent_id: Uuid) -> LedgerResult<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM settlement_intents WHERE retry_of = $1)",
        )
        .bind(intent_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DatabaseError::from_sqlx(e).into())
    }
}
