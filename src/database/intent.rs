//! Settlement intent records and their lifecycle
//!
//! One intent is one attempt to move money for a booking: a push collection
//! from the guest, a refund to the guest or a payout to the owner.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Collection,
    Refund,
    OwnerPayout,
}

impl IntentKind {
    pub const DISBURSEMENTS: [IntentKind; 2] = [IntentKind::Refund, IntentKind::OwnerPayout];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Collection => "collection",
            IntentKind::Refund => "refund",
            IntentKind::OwnerPayout => "owner_payout",
        }
    }

    pub fn is_disbursement(&self) -> bool {
        !matches!(self, IntentKind::Collection)
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" => Ok(IntentKind::Collection),
            "refund" => Ok(IntentKind::Refund),
            "owner_payout" => Ok(IntentKind::OwnerPayout),
            other => Err(format!("unknown intent kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentState {
    Created,
    Submitted,
    AwaitingCallback,
    Succeeded,
    Failed,
    TimedOut,
}

impl IntentState {
    pub const NON_TERMINAL: [IntentState; 3] = [
        IntentState::Created,
        IntentState::Submitted,
        IntentState::AwaitingCallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentState::Created => "created",
            IntentState::Submitted => "submitted",
            IntentState::AwaitingCallback => "awaiting_callback",
            IntentState::Succeeded => "succeeded",
            IntentState::Failed => "failed",
            IntentState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentState::Succeeded | IntentState::Failed | IntentState::TimedOut
        )
    }

    /// Allowed edges of the lifecycle. The only edge out of a terminal state
    /// is a late success on a timed-out intent.
    pub fn can_transition_to(&self, next: IntentState) -> bool {
        use IntentState::*;
        match (self, next) {
            (Created, Submitted) => true,
            (Created | Submitted, AwaitingCallback) => true,
            (Created | Submitted | AwaitingCallback, Succeeded | Failed | TimedOut) => true,
            (TimedOut, Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for IntentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(IntentState::Created),
            "submitted" => Ok(IntentState::Submitted),
            "awaiting_callback" => Ok(IntentState::AwaitingCallback),
            "succeeded" => Ok(IntentState::Succeeded),
            "failed" => Ok(IntentState::Failed),
            "timed_out" => Ok(IntentState::TimedOut),
            other => Err(format!("unknown intent state '{}'", other)),
        }
    }
}

/// How an amount was derived. Payouts carry the revenue split, refunds the tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentBreakdown {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commission_percent: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_percentage: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub id: Uuid,
    pub booking_id: i64,
    pub kind: IntentKind,
    pub state: IntentState,
    /// Payer for collections, payee for disbursements
    pub phone: String,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
    pub receipt: Option<String>,
    pub result_code: Option<String>,
    pub failure_reason: Option<String>,
    /// Raw gateway result, for operators only
    #[serde(skip_serializing)]
    pub raw_result: Option<JsonValue>,
    pub breakdown: IntentBreakdown,
    pub retry_of: Option<Uuid>,
    pub attempt: i32,
    /// Succeeded after having been timed out
    pub late: bool,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Intent {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn correlation_keys(&self) -> CorrelationKeys {
        CorrelationKeys {
            merchant_request_id: self.merchant_request_id.clone(),
            checkout_request_id: self.checkout_request_id.clone(),
            conversation_id: self.conversation_id.clone(),
            originator_conversation_id: self.originator_conversation_id.clone(),
        }
    }
}

/// Values for a new intent row
#[derive(Debug, Clone, PartialEq)]
pub struct NewIntent {
    pub booking_id: i64,
    pub kind: IntentKind,
    pub phone: String,
    pub amount: Decimal,
    pub currency: String,
    pub breakdown: IntentBreakdown,
    pub retry_of: Option<Uuid>,
    pub attempt: i32,
}

impl NewIntent {
    pub fn new(
        booking_id: i64,
        kind: IntentKind,
        phone: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            booking_id,
            kind,
            phone: phone.into(),
            amount,
            currency: currency.into(),
            breakdown: IntentBreakdown::default(),
            retry_of: None,
            attempt: 1,
        }
    }

    pub fn with_breakdown(mut self, breakdown: IntentBreakdown) -> Self {
        self.breakdown = breakdown;
        self
    }

    /// Next attempt in the retry chain of `previous`
    pub fn retry_of(previous: &Intent) -> Self {
        Self {
            booking_id: previous.booking_id,
            kind: previous.kind,
            phone: previous.phone.clone(),
            amount: previous.amount,
            currency: previous.currency.clone(),
            breakdown: previous.breakdown.clone(),
            retry_of: Some(previous.id),
            attempt: previous.attempt + 1,
        }
    }
}

/// Gateway identifiers that tie callbacks back to an intent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationKeys {
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub originator_conversation_id: Option<String>,
}

impl CorrelationKeys {
    pub fn collection(merchant_request_id: &str, checkout_request_id: &str) -> Self {
        Self {
            merchant_request_id: Some(merchant_request_id.to_string())
                .filter(|v| !v.is_empty()),
            checkout_request_id: Some(checkout_request_id.to_string()),
            ..Self::default()
        }
    }

    pub fn originator(originator_conversation_id: &str) -> Self {
        Self {
            originator_conversation_id: Some(originator_conversation_id.to_string()),
            ..Self::default()
        }
    }

    pub fn disbursement(conversation_id: &str, originator_conversation_id: &str) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            originator_conversation_id: Some(originator_conversation_id.to_string()),
            ..Self::default()
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        [
            &self.checkout_request_id,
            &self.merchant_request_id,
            &self.originator_conversation_id,
            &self.conversation_id,
        ]
        .into_iter()
        .flatten()
        .map(|k| k.as_str())
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// Copy the keys set on `self` onto `intent`
    pub fn write_to(&self, intent: &mut Intent) {
        if self.merchant_request_id.is_some() {
            intent.merchant_request_id = self.merchant_request_id.clone();
        }
        if self.checkout_request_id.is_some() {
            intent.checkout_request_id = self.checkout_request_id.clone();
        }
        if self.conversation_id.is_some() {
            intent.conversation_id = self.conversation_id.clone();
        }
        if self.originator_conversation_id.is_some() {
            intent.originator_conversation_id = self.originator_conversation_id.clone();
        }
    }
}

/// Final answer from the gateway (or from us giving up on it)
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded {
        receipt: Option<String>,
        result_code: Option<String>,
        raw: Option<JsonValue>,
    },
    Failed {
        reason: String,
        result_code: Option<String>,
        raw: Option<JsonValue>,
    },
    TimedOut {
        reason: String,
        raw: Option<JsonValue>,
    },
}

impl Outcome {
    pub fn target_state(&self) -> IntentState {
        match self {
            Outcome::Succeeded { .. } => IntentState::Succeeded,
            Outcome::Failed { .. } => IntentState::Failed,
            Outcome::TimedOut { .. } => IntentState::TimedOut,
        }
    }

    /// Whether an intent in `current` accepts this outcome
    pub fn applies_to(&self, current: IntentState) -> bool {
        !current.is_terminal()
            || (current == IntentState::TimedOut && self.target_state() == IntentState::Succeeded)
    }

    /// Write the outcome onto `intent`
    pub fn apply(&self, intent: &mut Intent, now: DateTime<Utc>) {
        intent.late = intent.state == IntentState::TimedOut;
        intent.state = self.target_state();
        intent.completed_at = Some(now);
        intent.updated_at = now;
        match self {
            Outcome::Succeeded {
                receipt,
                result_code,
                raw,
            } => {
                intent.receipt = receipt.clone();
                intent.result_code = result_code.clone();
                intent.failure_reason = None;
                if raw.is_some() {
                    intent.raw_result = raw.clone();
                }
            }
            Outcome::Failed {
                reason,
                result_code,
                raw,
            } => {
                intent.failure_reason = Some(reason.clone());
                intent.result_code = result_code.clone();
                if raw.is_some() {
                    intent.raw_result = raw.clone();
                }
            }
            Outcome::TimedOut { reason, raw } => {
                intent.failure_reason = Some(reason.clone());
                if raw.is_some() {
                    intent.raw_result = raw.clone();
                }
            }
        }
    }
}

/// Result of applying an outcome by correlation key
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOutcome {
    pub intent: Intent,
    pub previous_state: IntentState,
    /// False when the intent was already terminal and nothing changed
    pub applied: bool,
    /// A success that landed on a timed-out intent
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutTransition {
    TimedOut(Intent),
    AlreadyTerminal(Intent),
}

impl TimeoutTransition {
    pub fn intent(&self) -> &Intent {
        match self {
            TimeoutTransition::TimedOut(intent) | TimeoutTransition::AlreadyTerminal(intent) => {
                intent
            }
        }
    }

    pub fn transitioned(&self) -> bool {
        matches!(self, TimeoutTransition::TimedOut(_))
    }
}
