//! In-process ledger behind one async mutex.
//!
//! Used by the test-suite and by the service when started without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::intent::{
    AppliedOutcome, CorrelationKeys, Intent, IntentKind, IntentState, NewIntent, Outcome,
    TimeoutTransition,
};
use crate::database::ledger::{Ledger, LedgerError, LedgerResult};

#[derive(Default)]
struct LedgerState {
    intents: HashMap<Uuid, Intent>,
    /// Insertion order
    order: Vec<Uuid>,
    correlation_keys: HashMap<String, Uuid>,
}

impl LedgerState {
    fn active_for(&self, booking_id: i64, kind: IntentKind) -> Option<&Intent> {
        self.intents
            .values()
            .find(|i| i.booking_id == booking_id && i.kind == kind && !i.is_terminal())
    }

    fn insert(&mut self, new: NewIntent, state: IntentState) -> LedgerResult<Intent> {
        if let Some(existing) = self.active_for(new.booking_id, new.kind) {
            return Err(LedgerError::DuplicateActiveIntent {
                booking_id: new.booking_id,
                kind: new.kind,
                existing_id: Some(existing.id),
            });
        }

        let now = Utc::now();
        let intent = Intent {
            id: Uuid::new_v4(),
            booking_id: new.booking_id,
            kind: new.kind,
            state,
            phone: new.phone,
            amount: new.amount,
            currency: new.currency,
            merchant_request_id: None,
            checkout_request_id: None,
            conversation_id: None,
            originator_conversation_id: None,
            receipt: None,
            result_code: None,
            failure_reason: None,
            raw_result: None,
            breakdown: new.breakdown,
            retry_of: new.retry_of,
            attempt: new.attempt,
            late: false,
            created_at: now,
            submitted_at: None,
            completed_at: state.is_terminal().then_some(now),
            updated_at: now,
        };
        self.order.push(intent.id);
        self.intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    fn register_keys(&mut self, intent_id: Uuid, keys: &CorrelationKeys) {
        for key in keys.keys() {
            self.correlation_keys
                .entry(key.to_string())
                .or_insert(intent_id);
        }
    }

    fn intent_mut(&mut self, intent_id: Uuid) -> LedgerResult<&mut Intent> {
        self.intents
            .get_mut(&intent_id)
            .ok_or(LedgerError::IntentNotFound(intent_id))
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create_intent(&self, new: NewIntent) -> LedgerResult<Intent> {
        self.state.lock().await.insert(new, IntentState::Created)
    }

    async fn record_completed(
        &self,
        new: NewIntent,
        receipt: Option<String>,
    ) -> LedgerResult<Intent> {
        let mut state = self.state.lock().await;
        let mut intent = state.insert(new, IntentState::Succeeded)?;
        intent.receipt = receipt;
        state.intents.insert(intent.id, intent.clone());
        Ok(intent)
    }

    async fn begin_submission(
        &self,
        intent_id: Uuid,
        pre_keys: &CorrelationKeys,
    ) -> LedgerResult<Intent> {
        let mut state = self.state.lock().await;
        let current = state.intent_mut(intent_id)?.state;
        if current != IntentState::Created {
            return Err(LedgerError::InvalidTransition {
                intent_id,
                from: current,
                to: IntentState::Submitted,
            });
        }
        state.register_keys(intent_id, pre_keys);
        let intent = state.intent_mut(intent_id)?;
        let now = Utc::now();
        pre_keys.write_to(intent);
        intent.state = IntentState::Submitted;
        intent.submitted_at = Some(now);
        intent.updated_at = now;
        Ok(intent.clone())
    }

    async fn record_submission(
        &self,
        intent_id: Uuid,
        keys: &CorrelationKeys,
    ) -> LedgerResult<Intent> {
        let mut state = self.state.lock().await;
        state.intent_mut(intent_id)?;
        state.register_keys(intent_id, keys);
        let intent = state.intent_mut(intent_id)?;
        keys.write_to(intent);
        if !intent.is_terminal() {
            let now = Utc::now();
            intent.state = IntentState::AwaitingCallback;
            intent.submitted_at.get_or_insert(now);
            intent.updated_at = now;
        }
        Ok(intent.clone())
    }

    async fn apply_outcome(
        &self,
        correlation_key: &str,
        outcome: Outcome,
    ) -> LedgerResult<AppliedOutcome> {
        let mut state = self.state.lock().await;
        let intent_id = *state
            .correlation_keys
            .get(correlation_key)
            .ok_or_else(|| LedgerError::UnknownCorrelationKey(correlation_key.to_string()))?;
        let intent = state.intent_mut(intent_id)?;
        let previous_state = intent.state;

        if !outcome.applies_to(previous_state) {
            return Ok(AppliedOutcome {
                intent: intent.clone(),
                previous_state,
                applied: false,
                late: false,
            });
        }

        outcome.apply(intent, Utc::now());
        Ok(AppliedOutcome {
            late: intent.late,
            intent: intent.clone(),
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
        let mut state = self.state.lock().await;
        let intent = state.intent_mut(intent_id)?;
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
        .apply(intent, Utc::now());
        Ok(intent.clone())
    }

    async fn mark_timed_out(
        &self,
        intent_id: Uuid,
        reason: &str,
    ) -> LedgerResult<TimeoutTransition> {
        let mut state = self.state.lock().await;
        let intent = state.intent_mut(intent_id)?;
        if intent.is_terminal() {
            return Ok(TimeoutTransition::AlreadyTerminal(intent.clone()));
        }
        Outcome::TimedOut {
            reason: reason.to_string(),
            raw: None,
        }
        .apply(intent, Utc::now());
        Ok(TimeoutTransition::TimedOut(intent.clone()))
    }

    async fn get_intent(&self, intent_id: Uuid) -> LedgerResult<Option<Intent>> {
        Ok(self.state.lock().await.intents.get(&intent_id).cloned())
    }

    async fn find_by_correlation_key(&self, key: &str) -> LedgerResult<Option<Intent>> {
        let state = self.state.lock().await;
        Ok(state
            .correlation_keys
            .get(key)
            .and_then(|id| state.intents.get(id))
            .cloned())
    }

    async fn list_for_booking(&self, booking_id: i64) -> LedgerResult<Vec<Intent>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.intents.get(id))
            .filter(|i| i.booking_id == booking_id)
            .cloned()
            .collect())
    }

    async fn latest_for_booking(
        &self,
        booking_id: i64,
        kind: IntentKind,
    ) -> LedgerResult<Option<Intent>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .rev()
            .filter_map(|id| state.intents.get(id))
            .find(|i| i.booking_id == booking_id && i.kind == kind)
            .cloned())
    }

    async fn find_stale(
        &self,
        kinds: &[IntentKind],
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Intent>> {
        let state = self.state.lock().await;
        Ok(state
            .order
            .iter()
            .filter_map(|id| state.intents.get(id))
            .filter(|i| kinds.contains(&i.kind) && !i.is_terminal() && i.updated_at <= older_than)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn has_superseding_attempt(&self, intent_id: Uuid) -> LedgerResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .intents
            .values()
            .any(|i| i.retry_of == Some(intent_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payout(booking_id: i64) -> NewIntent {
        NewIntent::new(
            booking_id,
            IntentKind::OwnerPayout,
            "254700000001",
            dec!(9000),
            "KES",
        )
    }

    #[tokio::test]
    async fn one_active_intent_per_booking_and_kind() {
        let ledger = MemoryLedger::new();
        let first = ledger.create_intent(payout(1)).await.unwrap();

        let err = ledger.create_intent(payout(1)).await.unwrap_err();
        match err {
            LedgerError::DuplicateActiveIntent { existing_id, .. } => {
                assert_eq!(existing_id, Some(first.id))
            }
            other => panic!("unexpected error: {other}"),
        }

        // Other kinds and other bookings are independent
        ledger
            .create_intent(NewIntent::new(1, IntentKind::Refund, "254712345678", dec!(10), "KES"))
            .await
            .unwrap();
        ledger.create_intent(payout(2)).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_intent_frees_the_slot() {
        let ledger = MemoryLedger::new();
        let first = ledger.create_intent(payout(1)).await.unwrap();
        ledger.mark_failed(first.id, "declined", Some("2001")).await.unwrap();
        assert!(ledger.create_intent(payout(1)).await.is_ok());
    }

    #[tokio::test]
    async fn early_keys_resolve_before_submission_is_recorded() {
        let ledger = MemoryLedger::new();
        let intent = ledger.create_intent(payout(1)).await.unwrap();
        let origin = intent.id.to_string();
        ledger
            .begin_submission(intent.id, &CorrelationKeys::originator(&origin))
            .await
            .unwrap();

        let applied = ledger
            .apply_outcome(
                &origin,
                Outcome::Succeeded {
                    receipt: Some("R1".to_string()),
                    result_code: Some("0".to_string()),
                    raw: None,
                },
            )
            .await
            .unwrap();
        assert!(applied.applied);

        let after = ledger
            .record_submission(intent.id, &CorrelationKeys::disbursement("AG_1", &origin))
            .await
            .unwrap();
        assert_eq!(after.state, IntentState::Succeeded);
        assert_eq!(after.conversation_id.as_deref(), Some("AG_1"));
    }

    #[tokio::test]
    async fn unknown_key_is_reported() {
        let ledger = MemoryLedger::new();
        let err = ledger
            .apply_outcome(
                "nope",
                Outcome::TimedOut {
                    reason: "queue timeout".to_string(),
                    raw: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownCorrelationKey(_)));
    }

    #[tokio::test]
    async fn begin_submission_requires_created() {
        let ledger = MemoryLedger::new();
        let intent = ledger.create_intent(payout(3)).await.unwrap();
        let keys = CorrelationKeys::originator("o-3");
        ledger.begin_submission(intent.id, &keys).await.unwrap();
        assert!(matches!(
            ledger.begin_submission(intent.id, &keys).await,
            Err(LedgerError::InvalidTransition { .. })
        ));
    }
}
