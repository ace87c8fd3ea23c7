//! Settlement Orchestrator
//!
//! Drives every money movement for a booking: push collections from the
//! guest, refunds on cancellation and owner payouts. Each attempt is an
//! [`Intent`] in the ledger. The orchestrator creates it, talks to the
//! gateway outside any ledger transaction, records the result, and triggers
//! booking updates and notifications only after the ledger transition that
//! earned them has committed.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SettlementConfig;
use crate::database::booking_repository::{
    Booking, BookingRepository, BookingStatus, PayeeDirectory, PayoutStatus, RefundStatus,
};
use crate::database::error::DatabaseError;
use crate::database::intent::{
    AppliedOutcome, CorrelationKeys, Intent, IntentBreakdown, IntentKind, IntentState, NewIntent,
    Outcome, TimeoutTransition,
};
use crate::database::ledger::{Ledger, LedgerError};
use crate::error::{AppError, AppErrorKind, DomainError, ValidationError};
use crate::logging::mask_phone;
use crate::payments::callback::{
    parse_collection_callback, parse_disbursement_callback, parse_queue_timeout, CallbackError,
    SUCCESS_RESULT_CODE,
};
use crate::payments::error::GatewayError;
use crate::payments::provider::{CollectionGateway, DisbursementGateway};
use crate::payments::types::{
    to_gateway_amount, CollectionRequest, CollectionStatus, DisbursementRequest, Msisdn,
};
use crate::services::amount_policy::{AmountPolicy, AmountPolicyError, RefundQuote};
use crate::services::notification::{
    Audience, Notification, NotificationDispatcher, NotificationTemplate,
};

// ============================================================================
// Error Types
// ============================================================================

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("booking {0} not found")]
    BookingNotFound(i64),

    #[error("booking {booking_id} is not eligible: {reason}")]
    NotEligible { booking_id: i64, reason: String },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: String, reason: String },

    #[error("invalid phone number {phone}: {reason}")]
    InvalidPhone { phone: String, reason: String },

    #[error("no {party} phone number on record for booking {booking_id}")]
    MissingPayeeContact {
        booking_id: i64,
        party: &'static str,
    },

    #[error("intent {0} not found")]
    IntentNotFound(Uuid),

    #[error("intent {intent_id} ({state}) cannot be retried: {reason}")]
    NotRetryable {
        intent_id: Uuid,
        state: IntentState,
        reason: String,
    },

    #[error("intent {intent_id} reached the retry limit after {attempts} attempts")]
    RetriesExhausted { intent_id: Uuid, attempts: u32 },

    /// The gateway call for `intent_id` did not go through. The intent has
    /// already been moved to `failed` or `timed_out`.
    #[error("submission of intent {intent_id} failed: {source}")]
    Submission {
        intent_id: Uuid,
        #[source]
        source: GatewayError,
    },

    #[error(transparent)]
    Callback(#[from] CallbackError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    AmountPolicy(#[from] AmountPolicyError),
}

impl OrchestratorError {
    /// A callback whose intent is not (yet) in the ledger
    pub fn is_unknown_correlation_key(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Ledger(LedgerError::UnknownCorrelationKey(_))
        )
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        let kind = match err {
            OrchestratorError::BookingNotFound(booking_id) => {
                AppErrorKind::Domain(DomainError::BookingNotFound { booking_id })
            }
            OrchestratorError::NotEligible { booking_id, reason } => {
                AppErrorKind::Domain(DomainError::NotEligible { booking_id, reason })
            }
            OrchestratorError::InvalidAmount { amount, reason } => {
                AppErrorKind::Validation(ValidationError::InvalidAmount { amount, reason })
            }
            OrchestratorError::InvalidPhone { phone, reason } => {
                AppErrorKind::Validation(ValidationError::InvalidPhone { phone, reason })
            }
            OrchestratorError::MissingPayeeContact { booking_id, party } => {
                AppErrorKind::Validation(ValidationError::MissingPayeeContact {
                    booking_id,
                    party: party.to_string(),
                })
            }
            OrchestratorError::IntentNotFound(id) => {
                AppErrorKind::Domain(DomainError::IntentNotFound {
                    reference: id.to_string(),
                })
            }
            OrchestratorError::NotRetryable {
                intent_id, state, ..
            } => AppErrorKind::Domain(DomainError::InvalidTransition {
                intent_id: intent_id.to_string(),
                from: state.to_string(),
                to: "retry".to_string(),
            }),
            OrchestratorError::RetriesExhausted {
                intent_id,
                attempts,
            } => AppErrorKind::Domain(DomainError::RetriesExhausted {
                intent_id: intent_id.to_string(),
                attempts,
            }),
            OrchestratorError::Submission { intent_id, source } => {
                return AppError::from(source).with_context(format!("intent {}", intent_id));
            }
            OrchestratorError::Callback(err) => {
                AppErrorKind::Validation(ValidationError::MissingField {
                    field: err.to_string(),
                })
            }
            OrchestratorError::Ledger(err) => return err.into(),
            OrchestratorError::Database(err) => return err.into(),
            OrchestratorError::AmountPolicy(err) => return err.into(),
        };
        AppError::new(kind)
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// What a collect / refund / payout / retry call produced
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub intent: Intent,
    /// Message from the gateway meant for the payer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund: Option<RefundQuote>,
}

impl FlowResult {
    fn new(intent: Intent) -> Self {
        Self {
            intent,
            customer_message: None,
            refund: None,
        }
    }
}

/// Settlement view of one booking
#[derive(Debug, Clone, Serialize)]
pub struct SettlementStatus {
    pub booking_id: i64,
    pub booking_status: BookingStatus,
    pub payout_status: PayoutStatus,
    pub refund_status: RefundStatus,
    pub total_amount: Option<Decimal>,
    pub collection: Option<Intent>,
    pub refund: Option<Intent>,
    pub owner_payout: Option<Intent>,
    /// Every attempt, oldest first
    pub history: Vec<Intent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub timed_out: usize,
    /// Settled by a status query instead of timing out
    pub resolved: usize,
    pub errors: usize,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Collaborators the orchestrator is built from
pub struct OrchestratorDeps {
    pub ledger: Arc<dyn Ledger>,
    pub bookings: Arc<dyn BookingRepository>,
    pub payees: Arc<dyn PayeeDirectory>,
    pub collections: Arc<dyn CollectionGateway>,
    pub disbursements: Arc<dyn DisbursementGateway>,
    pub notifications: NotificationDispatcher,
}

pub struct SettlementOrchestrator {
    ledger: Arc<dyn Ledger>,
    bookings: Arc<dyn BookingRepository>,
    payees: Arc<dyn PayeeDirectory>,
    collections: Arc<dyn CollectionGateway>,
    disbursements: Arc<dyn DisbursementGateway>,
    notifications: NotificationDispatcher,
    policy: AmountPolicy,
    config: SettlementConfig,
    currency: String,
    country_code: String,
}

impl SettlementOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: SettlementConfig) -> Self {
        Self {
            ledger: deps.ledger,
            bookings: deps.bookings,
            payees: deps.payees,
            collections: deps.collections,
            disbursements: deps.disbursements,
            notifications: deps.notifications,
            policy: AmountPolicy::new(config.commission_percent),
            config,
            currency: "KES".to_string(),
            country_code: "254".to_string(),
        }
    }

    pub fn with_market(mut self, currency: impl Into<String>, country_code: impl Into<String>) -> Self {
        self.currency = currency.into();
        self.country_code = country_code.into();
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    // ------------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------------

    /// Ask the guest to pay for a booking with a push prompt on their phone.
    ///
    /// The booking total is always what is collected. `expected_amount` is the
    /// amount the caller showed the guest and must equal that total.
    ///
    /// The returned intent is `awaiting_callback`; the booking is confirmed
    /// when the result callback arrives.
    pub async fn collect(
        &self,
        booking_id: i64,
        payer_phone: &str,
        expected_amount: Option<Decimal>,
    ) -> OrchestratorResult<FlowResult> {
        let booking = self.load_booking(booking_id).await?;
        if booking.is_deleted {
            return Err(not_eligible(booking_id, "booking has been deleted"));
        }
        if booking.status != BookingStatus::Pending {
            return Err(not_eligible(
                booking_id,
                format!("booking is already {}", booking.status),
            ));
        }

        let amount = booking
            .total_amount
            .ok_or_else(|| OrchestratorError::InvalidAmount {
                amount: String::new(),
                reason: "booking has no total amount".to_string(),
            })?;
        if amount <= Decimal::ZERO {
            return Err(OrchestratorError::InvalidAmount {
                amount: amount.to_string(),
                reason: "amount must be greater than zero".to_string(),
            });
        }
        if let Some(expected) = expected_amount {
            if expected != amount {
                return Err(OrchestratorError::InvalidAmount {
                    amount: expected.to_string(),
                    reason: format!("amount must equal the booking total {}", amount),
                });
            }
        }
        let payer = self.parse_phone(payer_phone)?;

        let new = NewIntent::new(
            booking_id,
            IntentKind::Collection,
            payer.as_str(),
            amount,
            self.currency.clone(),
        );
        let intent = self.create_collection_intent(new).await?;

        info!(
            intent_id = %intent.id,
            booking_id = booking_id,
            amount = %amount,
            phone = %mask_phone(payer.as_str()),
            "Requesting collection"
        );

        let request = CollectionRequest {
            payer_phone: payer,
            amount,
            account_reference: format!("BK{}", booking_id),
            description: format!("Booking {}", booking_id),
        };

        self.ledger
            .begin_submission(intent.id, &CorrelationKeys::default())
            .await?;

        match self.collections.request_collection(request).await {
            Ok(ack) => {
                let keys =
                    CorrelationKeys::collection(&ack.merchant_request_id, &ack.checkout_request_id);
                let intent = self.ledger.record_submission(intent.id, &keys).await?;
                info!(
                    intent_id = %intent.id,
                    checkout_request_id = %ack.checkout_request_id,
                    "Collection accepted by gateway"
                );
                Ok(FlowResult {
                    customer_message: ack.customer_message,
                    ..FlowResult::new(intent)
                })
            }
            Err(err) => Err(self.submission_failed(intent, err).await),
        }
    }

    /// Create the collection intent. A conflicting intent that has sat past
    /// its deadline is settled first and creation is tried once more.
    async fn create_collection_intent(&self, new: NewIntent) -> OrchestratorResult<Intent> {
        let booking_id = new.booking_id;
        let existing_id = match self.ledger.create_intent(new.clone()).await {
            Ok(intent) => return Ok(intent),
            Err(LedgerError::DuplicateActiveIntent {
                existing_id: Some(existing_id),
                ..
            }) => existing_id,
            Err(err) => return Err(err.into()),
        };

        let duplicate = || LedgerError::DuplicateActiveIntent {
            booking_id,
            kind: IntentKind::Collection,
            existing_id: Some(existing_id),
        };

        let existing = self
            .ledger
            .get_intent(existing_id)
            .await?
            .ok_or(OrchestratorError::IntentNotFound(existing_id))?;
        if !self.is_stale(&existing, Utc::now()) {
            return Err(duplicate().into());
        }

        info!(
            intent_id = %existing.id,
            booking_id = booking_id,
            state = %existing.state,
            "Settling stale collection before creating a new one"
        );
        let settled = self.settle_stale(existing).await?;
        match settled.state {
            IntentState::Succeeded => Err(not_eligible(booking_id, "booking has already been paid")),
            state if !state.is_terminal() => Err(duplicate().into()),
            _ => Ok(self.ledger.create_intent(new).await?),
        }
    }

    /// Apply a push-collection result callback.
    pub async fn process_collection_webhook(
        &self,
        payload: &JsonValue,
    ) -> OrchestratorResult<AppliedOutcome> {
        let callback = parse_collection_callback(payload)?;

        let outcome = if callback.is_success() {
            Outcome::Succeeded {
                receipt: callback.receipt_number.clone(),
                result_code: Some(callback.result_code.clone()),
                raw: Some(payload.clone()),
            }
        } else {
            Outcome::Failed {
                reason: callback.result_desc.clone(),
                result_code: Some(callback.result_code.clone()),
                raw: Some(payload.clone()),
            }
        };

        let applied = self
            .apply_by_keys(&callback.correlation_keys(), outcome)
            .await?;

        if callback.is_success() {
            if let Some(paid) = callback.amount {
                if is_underpaid(paid, applied.intent.amount) {
                    // Money moved, so the intent keeps its success; the
                    // booking waits for an operator.
                    if applied.applied {
                        self.flag_underpayment(&applied.intent, paid);
                    }
                    return Ok(applied);
                }
                if !amounts_match(paid, applied.intent.amount) {
                    warn!(
                        intent_id = %applied.intent.id,
                        expected = %applied.intent.amount,
                        received = %paid,
                        "Collected amount differs from intent amount"
                    );
                }
            }
            debug!(
                intent_id = %applied.intent.id,
                transaction_date = ?callback.transaction_date,
                phone = %callback.phone_number.as_deref().map(mask_phone).unwrap_or_default(),
                "Collection callback details"
            );
        }

        self.after_outcome(&applied).await?;
        Ok(applied)
    }

    /// A collection the gateway gave up on before the payer answered.
    pub async fn process_collection_timeout_webhook(
        &self,
        payload: &JsonValue,
    ) -> OrchestratorResult<AppliedOutcome> {
        self.process_queue_timeout(payload).await
    }

    // ------------------------------------------------------------------------
    // Disbursements
    // ------------------------------------------------------------------------

    /// Refund the guest of a cancelled booking according to the refund tiers.
    ///
    /// A cancellation too close to check-in records a zero refund without any
    /// gateway call.
    pub async fn refund(
        &self,
        booking_id: i64,
        cancelled_at: Option<DateTime<Utc>>,
    ) -> OrchestratorResult<FlowResult> {
        let booking = self.load_booking(booking_id).await?;
        if booking.is_deleted {
            return Err(not_eligible(booking_id, "booking has been deleted"));
        }
        if booking.status != BookingStatus::Cancelled {
            return Err(not_eligible(
                booking_id,
                format!("booking is {}, only cancelled bookings are refunded", booking.status),
            ));
        }
        if matches!(
            booking.refund_status,
            RefundStatus::Completed | RefundStatus::NotApplicable
        ) {
            return Err(not_eligible(
                booking_id,
                format!("refund already settled ({})", booking.refund_status),
            ));
        }
        let total = booking
            .total_amount
            .ok_or_else(|| OrchestratorError::InvalidAmount {
                amount: String::new(),
                reason: "booking has no total amount".to_string(),
            })?;

        let cancelled_at = cancelled_at
            .or(booking.cancelled_at)
            .unwrap_or_else(Utc::now);
        let quote = self
            .policy
            .calculate_refund(&booking.check_in, total, &cancelled_at)?;

        let breakdown = IntentBreakdown {
            refund_percentage: Some(quote.percentage),
            refund_tier: Some(quote.tier.as_str().to_string()),
            reason: Some(quote.reason.clone()),
            ..IntentBreakdown::default()
        };

        if !quote.is_refundable() {
            let phone = self.payees.guest_phone(booking_id).await?.unwrap_or_default();
            let new = NewIntent::new(
                booking_id,
                IntentKind::Refund,
                phone,
                Decimal::ZERO,
                self.currency.clone(),
            )
            .with_breakdown(breakdown);
            let intent = self.ledger.record_completed(new, None).await?;
            self.bookings
                .update_refund_status(booking_id, RefundStatus::NotApplicable)
                .await?;
            self.notifications.enqueue(
                Notification::new(
                    NotificationTemplate::RefundNotApplicable,
                    Audience::Guest,
                    booking_id,
                )
                .with("reason", &quote.reason)
                .with("hours_before_check_in", quote.hours_before_check_in),
            );
            info!(
                intent_id = %intent.id,
                booking_id = booking_id,
                hours_before_check_in = quote.hours_before_check_in,
                "Cancellation not refundable"
            );
            return Ok(FlowResult {
                refund: Some(quote),
                ..FlowResult::new(intent)
            });
        }

        let payee = self.refund_payee(booking_id).await?;
        let new = NewIntent::new(
            booking_id,
            IntentKind::Refund,
            payee.as_str(),
            quote.amount,
            self.currency.clone(),
        )
        .with_breakdown(breakdown);
        let intent = self.ledger.create_intent(new).await?;

        info!(
            intent_id = %intent.id,
            booking_id = booking_id,
            amount = %quote.amount,
            percentage = %quote.percentage,
            "Sending refund"
        );

        let result = self.submit_disbursement(intent, payee).await?;
        Ok(FlowResult {
            refund: Some(quote),
            ..result
        })
    }

    /// Pay the owner their share of a confirmed booking.
    pub async fn pay_owner(
        &self,
        booking_id: i64,
        owner_phone: Option<&str>,
    ) -> OrchestratorResult<FlowResult> {
        let booking = self.load_booking(booking_id).await?;
        if booking.is_deleted {
            return Err(not_eligible(booking_id, "booking has been deleted"));
        }
        if !matches!(
            booking.status,
            BookingStatus::Confirmed | BookingStatus::Completed
        ) {
            return Err(not_eligible(
                booking_id,
                format!("booking is {}", booking.status),
            ));
        }
        if booking.payout_status == PayoutStatus::Paid {
            return Err(not_eligible(booking_id, "owner has already been paid"));
        }
        if matches!(
            booking.refund_status,
            RefundStatus::Processing | RefundStatus::Completed
        ) {
            return Err(not_eligible(
                booking_id,
                format!("guest refund is {}", booking.refund_status),
            ));
        }

        let split = self
            .policy
            .split_revenue(booking.total_amount)
            .ok_or_else(|| not_eligible(booking_id, "booking has no positive total amount"))?;

        let phone = match owner_phone {
            Some(phone) => phone.to_string(),
            None => self
                .payees
                .owner_phone(booking_id)
                .await?
                .ok_or(OrchestratorError::MissingPayeeContact {
                    booking_id,
                    party: "owner",
                })?,
        };
        let payee = self.parse_phone(&phone)?;

        let new = NewIntent::new(
            booking_id,
            IntentKind::OwnerPayout,
            payee.as_str(),
            split.owner_amount,
            self.currency.clone(),
        )
        .with_breakdown(IntentBreakdown {
            platform_amount: Some(split.platform_amount),
            owner_amount: Some(split.owner_amount),
            commission_percent: Some(split.commission_percent),
            ..IntentBreakdown::default()
        });
        let intent = self.ledger.create_intent(new).await?;

        info!(
            intent_id = %intent.id,
            booking_id = booking_id,
            owner_amount = %split.owner_amount,
            platform_amount = %split.platform_amount,
            "Sending owner payout"
        );

        self.submit_disbursement(intent, payee).await
    }

    /// Start the next attempt of a failed or timed-out disbursement.
    pub async fn retry_disbursement(&self, intent_id: Uuid) -> OrchestratorResult<FlowResult> {
        let previous = self
            .ledger
            .get_intent(intent_id)
            .await?
            .ok_or(OrchestratorError::IntentNotFound(intent_id))?;

        let not_retryable = |reason: &str| OrchestratorError::NotRetryable {
            intent_id,
            state: previous.state,
            reason: reason.to_string(),
        };

        if !previous.kind.is_disbursement() {
            return Err(not_retryable("collections are retried with a new collection"));
        }
        if !matches!(previous.state, IntentState::Failed | IntentState::TimedOut) {
            return Err(not_retryable("only failed or timed out attempts can be retried"));
        }
        let latest = self
            .ledger
            .latest_for_booking(previous.booking_id, previous.kind)
            .await?;
        if latest.map(|l| l.id) != Some(previous.id) {
            return Err(not_retryable("a newer attempt exists"));
        }

        let booking = self.load_booking(previous.booking_id).await?;
        let settled = match previous.kind {
            IntentKind::Refund => booking.refund_status == RefundStatus::Completed,
            _ => booking.payout_status == PayoutStatus::Paid,
        };
        if settled {
            return Err(not_eligible(
                previous.booking_id,
                format!("{} already settled", previous.kind),
            ));
        }

        let attempts = u32::try_from(previous.attempt).unwrap_or(u32::MAX);
        if attempts >= self.config.max_disbursement_attempts {
            error!(
                intent_id = %previous.id,
                booking_id = previous.booking_id,
                kind = %previous.kind,
                attempts = attempts,
                "Disbursement retries exhausted"
            );
            self.notifications.enqueue(
                Notification::new(
                    NotificationTemplate::OperatorAlert,
                    Audience::Operators,
                    previous.booking_id,
                )
                .with("alert", "disbursement_retries_exhausted")
                .with("intent_id", previous.id)
                .with("kind", previous.kind)
                .with("amount", previous.amount)
                .with("attempts", attempts)
                .with(
                    "last_failure",
                    previous.failure_reason.as_deref().unwrap_or("unknown"),
                ),
            );
            return Err(OrchestratorError::RetriesExhausted {
                intent_id: previous.id,
                attempts,
            });
        }

        let payee = self.parse_phone(&previous.phone)?;
        let intent = self.ledger.create_intent(NewIntent::retry_of(&previous)).await?;
        info!(
            intent_id = %intent.id,
            retry_of = %previous.id,
            attempt = intent.attempt,
            kind = %intent.kind,
            "Retrying disbursement"
        );

        self.submit_disbursement(intent, payee).await
    }

    /// Apply a disbursement result callback.
    pub async fn process_disbursement_webhook(
        &self,
        payload: &JsonValue,
    ) -> OrchestratorResult<AppliedOutcome> {
        let callback = parse_disbursement_callback(payload)?;

        let outcome = if callback.is_success() {
            Outcome::Succeeded {
                receipt: callback.receipt(),
                result_code: Some(callback.result_code.clone()),
                raw: Some(payload.clone()),
            }
        } else {
            Outcome::Failed {
                reason: callback.result_desc.clone(),
                result_code: Some(callback.result_code.clone()),
                raw: Some(payload.clone()),
            }
        };

        let applied = self
            .apply_by_keys(&callback.correlation_keys(), outcome)
            .await?;

        if let Some(sent) = callback.amount {
            if callback.is_success() && !amounts_match(sent, applied.intent.amount) {
                warn!(
                    intent_id = %applied.intent.id,
                    expected = %applied.intent.amount,
                    received = %sent,
                    "Disbursed amount differs from intent amount"
                );
            }
        }

        self.after_outcome(&applied).await?;
        Ok(applied)
    }

    /// A disbursement the gateway queue expired.
    pub async fn process_disbursement_timeout_webhook(
        &self,
        payload: &JsonValue,
    ) -> OrchestratorResult<AppliedOutcome> {
        self.process_queue_timeout(payload).await
    }

    async fn submit_disbursement(
        &self,
        intent: Intent,
        payee: Msisdn,
    ) -> OrchestratorResult<FlowResult> {
        let originator = intent.id.to_string();
        let intent = self
            .ledger
            .begin_submission(intent.id, &CorrelationKeys::originator(&originator))
            .await?;

        match intent.kind {
            IntentKind::Refund => {
                self.bookings
                    .update_refund_status(intent.booking_id, RefundStatus::Processing)
                    .await?;
            }
            _ => {
                self.bookings
                    .update_payout_status(intent.booking_id, PayoutStatus::Processing)
                    .await?;
            }
        }

        let request = DisbursementRequest {
            payee_phone: payee,
            amount: intent.amount,
            remarks: match intent.kind {
                IntentKind::Refund => format!("Refund for booking {}", intent.booking_id),
                _ => format!("Payout for booking {}", intent.booking_id),
            },
            originator_conversation_id: originator,
            occasion: Some(format!("BK{}", intent.booking_id)),
        };

        match self.disbursements.send_disbursement(request).await {
            Ok(ack) => {
                let keys = CorrelationKeys::disbursement(
                    &ack.conversation_id,
                    &ack.originator_conversation_id,
                );
                let intent = self.ledger.record_submission(intent.id, &keys).await?;
                info!(
                    intent_id = %intent.id,
                    conversation_id = %ack.conversation_id,
                    state = %intent.state,
                    "Disbursement accepted by gateway"
                );
                Ok(FlowResult {
                    customer_message: ack.response_description,
                    ..FlowResult::new(intent)
                })
            }
            Err(err) => Err(self.submission_failed(intent, err).await),
        }
    }

    // ------------------------------------------------------------------------
    // Timeouts
    // ------------------------------------------------------------------------

    /// Time out intents that have waited past their deadline.
    ///
    /// Collections get one status query first so a payment that went through
    /// is not reported as timed out.
    pub async fn sweep_timeouts(&self, batch_size: i64) -> OrchestratorResult<SweepReport> {
        let now = Utc::now();
        let mut report = SweepReport::default();

        let groups: [(&[IntentKind], Duration); 2] = [
            (&[IntentKind::Collection], self.config.collection_deadline),
            (&IntentKind::DISBURSEMENTS, self.config.disbursement_deadline),
        ];

        for (kinds, deadline) in groups {
            let cutoff = now - to_chrono(deadline);
            let stale = self.ledger.find_stale(kinds, cutoff, batch_size).await?;

            for intent in stale {
                report.examined += 1;
                let intent_id = intent.id;
                match self.settle_stale(intent).await {
                    Ok(settled) => match settled.state {
                        IntentState::TimedOut => report.timed_out += 1,
                        IntentState::Succeeded | IntentState::Failed => report.resolved += 1,
                        _ => {}
                    },
                    Err(err) => {
                        report.errors += 1;
                        error!(intent_id = %intent_id, error = %err, "Failed to settle stale intent");
                    }
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                timed_out = report.timed_out,
                resolved = report.resolved,
                errors = report.errors,
                "Timeout sweep finished"
            );
        }
        Ok(report)
    }

    /// Drive a stale intent to a terminal state and return it.
    async fn settle_stale(&self, intent: Intent) -> OrchestratorResult<Intent> {
        if intent.is_terminal() {
            return Ok(intent);
        }

        if intent.kind == IntentKind::Collection {
            if let Some(checkout) = intent.checkout_request_id.clone() {
                let outcome = match self.collections.query_collection_status(&checkout).await {
                    Ok(CollectionStatus::Succeeded) => Some(Outcome::Succeeded {
                        receipt: None,
                        result_code: Some(SUCCESS_RESULT_CODE.to_string()),
                        raw: None,
                    }),
                    Ok(CollectionStatus::Failed { code, reason }) => Some(Outcome::Failed {
                        reason,
                        result_code: Some(code),
                        raw: None,
                    }),
                    Ok(CollectionStatus::Pending) => None,
                    Err(err) => {
                        warn!(
                            intent_id = %intent.id,
                            error = %err,
                            "Status query failed, timing out collection"
                        );
                        None
                    }
                };

                if let Some(outcome) = outcome {
                    let applied = self.ledger.apply_outcome(&checkout, outcome).await?;
                    self.after_outcome(&applied).await?;
                    return Ok(applied.intent);
                }
            }
        }

        let reason = format!(
            "no result within {}s",
            self.deadline(intent.kind).as_secs()
        );
        match self.ledger.mark_timed_out(intent.id, &reason).await? {
            TimeoutTransition::TimedOut(intent) => {
                warn!(
                    intent_id = %intent.id,
                    booking_id = intent.booking_id,
                    kind = %intent.kind,
                    "Intent timed out"
                );
                self.after_transition(&intent).await?;
                Ok(intent)
            }
            TimeoutTransition::AlreadyTerminal(intent) => Ok(intent),
        }
    }

    async fn process_queue_timeout(
        &self,
        payload: &JsonValue,
    ) -> OrchestratorResult<AppliedOutcome> {
        let timeout = parse_queue_timeout(payload)?;
        let outcome = Outcome::TimedOut {
            reason: timeout.description.clone(),
            raw: Some(payload.clone()),
        };
        let applied = self.apply_by_keys(&timeout.correlation_keys, outcome).await?;
        self.after_outcome(&applied).await?;
        Ok(applied)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub async fn settlement_status(&self, booking_id: i64) -> OrchestratorResult<SettlementStatus> {
        let booking = self.load_booking(booking_id).await?;
        let history = self.ledger.list_for_booking(booking_id).await?;

        let latest = |kind: IntentKind| history.iter().rev().find(|i| i.kind == kind).cloned();

        Ok(SettlementStatus {
            booking_id,
            booking_status: booking.status,
            payout_status: booking.payout_status,
            refund_status: booking.refund_status,
            total_amount: booking.total_amount,
            collection: latest(IntentKind::Collection),
            refund: latest(IntentKind::Refund),
            owner_payout: latest(IntentKind::OwnerPayout),
            history,
        })
    }

    // ------------------------------------------------------------------------
    // Side effects
    // ------------------------------------------------------------------------

    /// Follow-up work for an outcome.
    ///
    /// A replay still redoes the booking write, since the delivery that made
    /// the transition may have failed after the ledger commit.
    async fn after_outcome(&self, applied: &AppliedOutcome) -> OrchestratorResult<()> {
        if !applied.applied {
            debug!(
                intent_id = %applied.intent.id,
                state = %applied.intent.state,
                "Outcome already recorded"
            );
            return self.reapply_side_effects(&applied.intent).await;
        }

        if applied.late {
            self.flag_late_success(&applied.intent).await?;
        }
        self.after_transition(&applied.intent).await
    }

    async fn after_transition(&self, intent: &Intent) -> OrchestratorResult<()> {
        self.run_side_effects(intent, true).await
    }

    /// Only the latest attempt of its kind is replayed, so an old attempt
    /// cannot overwrite the status a newer one set.
    async fn reapply_side_effects(&self, intent: &Intent) -> OrchestratorResult<()> {
        if !intent.is_terminal() {
            return Ok(());
        }
        let latest = self
            .ledger
            .latest_for_booking(intent.booking_id, intent.kind)
            .await?;
        if latest.map(|l| l.id) != Some(intent.id) {
            return Ok(());
        }
        self.run_side_effects(intent, false).await
    }

    /// Booking write first, then the notification. Where there is a booking
    /// write, its conditional update decides whether to notify, so concurrent
    /// deliveries notify once. Otherwise only the transitioning delivery does.
    async fn run_side_effects(&self, intent: &Intent, transitioned: bool) -> OrchestratorResult<()> {
        let changed = self.update_booking(intent).await?;
        if changed == Some(true) && !transitioned {
            info!(
                intent_id = %intent.id,
                booking_id = intent.booking_id,
                state = %intent.state,
                "Recovered booking update on redelivery"
            );
        }
        if changed.unwrap_or(transitioned) {
            self.notify_outcome(intent);
        }
        Ok(())
    }

    /// Returns whether the booking row changed, `None` when the outcome has
    /// no booking write.
    async fn update_booking(&self, intent: &Intent) -> OrchestratorResult<Option<bool>> {
        let booking_id = intent.booking_id;
        let changed = match (intent.kind, intent.state) {
            (IntentKind::Collection, IntentState::Succeeded) => {
                let confirmed = self.bookings.confirm_booking(booking_id).await?;
                if confirmed {
                    info!(booking_id = booking_id, intent_id = %intent.id, "Booking confirmed");
                }
                confirmed
            }
            (IntentKind::Refund, IntentState::Succeeded) => {
                self.bookings
                    .update_refund_status(booking_id, RefundStatus::Completed)
                    .await?
            }
            (IntentKind::Refund, IntentState::Failed | IntentState::TimedOut) => {
                self.bookings
                    .update_refund_status(booking_id, RefundStatus::Failed)
                    .await?
            }
            (IntentKind::OwnerPayout, IntentState::Succeeded) => {
                self.bookings
                    .update_payout_status(booking_id, PayoutStatus::Paid)
                    .await?
            }
            (IntentKind::OwnerPayout, IntentState::Failed | IntentState::TimedOut) => {
                self.bookings
                    .update_payout_status(booking_id, PayoutStatus::Failed)
                    .await?
            }
            _ => return Ok(None),
        };
        Ok(Some(changed))
    }

    fn notify_outcome(&self, intent: &Intent) {
        let booking_id = intent.booking_id;
        let guest = |template| {
            Notification::new(template, Audience::Guest, booking_id)
                .with("intent_id", intent.id)
                .with("amount", intent.amount)
                .with("currency", &intent.currency)
                .with("phone", &intent.phone)
        };
        let receipt = intent.receipt.as_deref().unwrap_or_default();
        let reason = intent.failure_reason.as_deref().unwrap_or_default();

        let notification = match (intent.kind, intent.state) {
            (IntentKind::Collection, IntentState::Succeeded) => {
                guest(NotificationTemplate::BookingConfirmed).with("receipt", receipt)
            }
            (IntentKind::Collection, IntentState::Failed) => {
                guest(NotificationTemplate::PaymentFailed).with("reason", reason)
            }
            (IntentKind::Collection, IntentState::TimedOut) => {
                guest(NotificationTemplate::PaymentTimedOut)
            }
            (IntentKind::Refund, IntentState::Succeeded) => {
                guest(NotificationTemplate::RefundProcessed).with("receipt", receipt)
            }
            (IntentKind::Refund, IntentState::Failed) => {
                guest(NotificationTemplate::RefundFailed).with("reason", reason)
            }
            (IntentKind::OwnerPayout, IntentState::Succeeded) => {
                Notification::new(NotificationTemplate::OwnerPayoutSent, Audience::Owner, booking_id)
                    .with("intent_id", intent.id)
                    .with("amount", intent.amount)
                    .with("currency", &intent.currency)
                    .with("phone", &intent.phone)
                    .with("receipt", receipt)
            }
            (IntentKind::OwnerPayout, IntentState::Failed) => Notification::new(
                NotificationTemplate::OwnerPayoutFailed,
                Audience::Owner,
                booking_id,
            )
            .with("intent_id", intent.id)
            .with("amount", intent.amount)
            .with("reason", reason),
            _ => return,
        };
        self.notifications.enqueue(notification);
    }

    fn flag_underpayment(&self, intent: &Intent, paid: Decimal) {
        error!(
            intent_id = %intent.id,
            booking_id = intent.booking_id,
            expected = %intent.amount,
            received = %paid,
            "Collection paid less than the booking total, booking left unconfirmed"
        );
        self.notifications.enqueue(
            Notification::new(
                NotificationTemplate::OperatorAlert,
                Audience::Operators,
                intent.booking_id,
            )
            .with("alert", "collection_underpaid")
            .with("intent_id", intent.id)
            .with("expected", intent.amount)
            .with("received", paid)
            .with("receipt", intent.receipt.as_deref().unwrap_or_default()),
        );
    }

    /// A success that arrived after we gave up. Money moved, so it is kept;
    /// operators hear about it when another attempt may have moved it again.
    async fn flag_late_success(&self, intent: &Intent) -> OrchestratorResult<()> {
        let latest = self
            .ledger
            .latest_for_booking(intent.booking_id, intent.kind)
            .await?;
        let superseded = self.ledger.has_superseding_attempt(intent.id).await?
            || latest.is_some_and(|l| l.id != intent.id);

        warn!(
            intent_id = %intent.id,
            booking_id = intent.booking_id,
            kind = %intent.kind,
            superseded = superseded,
            "Late success on timed out intent"
        );

        if superseded {
            self.notifications.enqueue(
                Notification::new(
                    NotificationTemplate::OperatorAlert,
                    Audience::Operators,
                    intent.booking_id,
                )
                .with("alert", "late_success_after_retry")
                .with("intent_id", intent.id)
                .with("kind", intent.kind)
                .with("amount", intent.amount)
                .with("receipt", intent.receipt.as_deref().unwrap_or_default()),
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Record a failed gateway call against the intent and build the error.
    ///
    /// An answer we never got leaves the outcome open (`timed_out`, upgradable
    /// by a late callback); an explicit refusal is `failed`.
    async fn submission_failed(&self, intent: Intent, err: GatewayError) -> OrchestratorError {
        let intent_id = intent.id;
        let recorded = if err.is_outcome_unknown() {
            warn!(intent_id = %intent_id, error = %err, "Submission outcome unknown");
            self.ledger
                .mark_timed_out(intent_id, &err.failure_reason())
                .await
                .map(|transition| transition.transitioned().then(|| transition.intent().clone()))
        } else {
            warn!(intent_id = %intent_id, error = %err, "Submission rejected");
            self.ledger
                .mark_failed(intent_id, &err.failure_reason(), err.code())
                .await
                .map(|intent| (intent.state == IntentState::Failed).then_some(intent))
        };

        match recorded {
            Ok(Some(intent)) => {
                if let Err(side_effect) = self.after_transition(&intent).await {
                    error!(
                        intent_id = %intent_id,
                        error = %side_effect,
                        "Failed to apply submission failure side effects"
                    );
                }
            }
            Ok(None) => {}
            Err(ledger_err) => {
                error!(
                    intent_id = %intent_id,
                    error = %ledger_err,
                    "Failed to record submission failure"
                );
            }
        }

        OrchestratorError::Submission {
            intent_id,
            source: err,
        }
    }

    /// Apply `outcome` under the first key the ledger knows.
    async fn apply_by_keys(
        &self,
        keys: &[String],
        outcome: Outcome,
    ) -> OrchestratorResult<AppliedOutcome> {
        for key in keys {
            match self.ledger.apply_outcome(key, outcome.clone()).await {
                Ok(applied) => {
                    info!(
                        intent_id = %applied.intent.id,
                        correlation_key = %key,
                        state = %applied.intent.state,
                        applied = applied.applied,
                        late = applied.late,
                        "Gateway outcome processed"
                    );
                    return Ok(applied);
                }
                Err(LedgerError::UnknownCorrelationKey(_)) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        let first = keys.first().cloned().unwrap_or_default();
        warn!(correlation_key = %first, "No intent registered for callback");
        Err(LedgerError::UnknownCorrelationKey(first).into())
    }

    /// The phone that actually paid, else the guest contact on record
    async fn refund_payee(&self, booking_id: i64) -> OrchestratorResult<Msisdn> {
        let paid_from = self
            .ledger
            .list_for_booking(booking_id)
            .await?
            .into_iter()
            .rev()
            .find(|i| i.kind == IntentKind::Collection && i.state == IntentState::Succeeded)
            .map(|i| i.phone);

        let phone = match paid_from {
            Some(phone) => phone,
            None => self.payees.guest_phone(booking_id).await?.ok_or(
                OrchestratorError::MissingPayeeContact {
                    booking_id,
                    party: "guest",
                },
            )?,
        };
        self.parse_phone(&phone)
    }

    async fn load_booking(&self, booking_id: i64) -> OrchestratorResult<Booking> {
        self.bookings
            .get_booking(booking_id)
            .await?
            .ok_or(OrchestratorError::BookingNotFound(booking_id))
    }

    fn parse_phone(&self, raw: &str) -> OrchestratorResult<Msisdn> {
        Msisdn::parse(raw, &self.country_code).map_err(|err| OrchestratorError::InvalidPhone {
            phone: mask_phone(raw.trim()),
            reason: err.failure_reason(),
        })
    }

    fn deadline(&self, kind: IntentKind) -> Duration {
        match kind {
            IntentKind::Collection => self.config.collection_deadline,
            _ => self.config.disbursement_deadline,
        }
    }

    fn is_stale(&self, intent: &Intent, now: DateTime<Utc>) -> bool {
        !intent.is_terminal() && intent.updated_at <= now - to_chrono(self.deadline(intent.kind))
    }
}

fn not_eligible(booking_id: i64, reason: impl Into<String>) -> OrchestratorError {
    OrchestratorError::NotEligible {
        booking_id,
        reason: reason.into(),
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

/// Less than expected in the whole units the gateway works with
fn is_underpaid(reported: Decimal, expected: Decimal) -> bool {
    match (to_gateway_amount(reported), to_gateway_amount(expected)) {
        (Ok(a), Ok(b)) => a < b,
        _ => reported < expected,
    }
}

/// Compare in the whole units the gateway works with
fn amounts_match(reported: Decimal, expected: Decimal) -> bool {
    match (to_gateway_amount(reported), to_gateway_amount(expected)) {
        (Ok(a), Ok(b)) => a == b,
        _ => reported == expected,
    }
}
