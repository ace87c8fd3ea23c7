use crate::payments::error::GatewayError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A normalised mobile number in international form without `+` (e.g. `254712345678`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct Msisdn(String);

impl Msisdn {
    /// Normalise local (`0712…`), bare (`712…`) and international (`+254712…`) forms.
    pub fn parse(raw: &str, country_code: &str) -> Result<Self, GatewayError> {
        let cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
            .collect();
        let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(GatewayError::validation(
                "phone number must contain only digits",
                "phone",
            ));
        }

        let international = if digits.starts_with(country_code) {
            digits.to_string()
        } else if let Some(local) = digits.strip_prefix('0') {
            format!("{}{}", country_code, local)
        } else if digits.len() == 9 {
            format!("{}{}", country_code, digits)
        } else {
            digits.to_string()
        };

        if !(10..=15).contains(&international.len()) || international.starts_with('0') {
            return Err(GatewayError::validation(
                format!("'{}' is not a valid mobile number", raw.trim()),
                "phone",
            ));
        }

        Ok(Self(international))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Msisdn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Msisdn {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Msisdn::parse(value, "254")
    }
}

/// Amount in whole currency units as the gateway accepts it.
pub fn to_gateway_amount(amount: Decimal) -> Result<i64, GatewayError> {
    if amount <= Decimal::ZERO {
        return Err(GatewayError::validation(
            "amount must be greater than zero",
            "amount",
        ));
    }
    let whole = amount.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let units = i64::try_from(whole)
        .map_err(|_| GatewayError::validation("amount is out of range", "amount"))?;
    if units < 1 {
        return Err(GatewayError::validation(
            "amount must be at least 1 after rounding to whole units",
            "amount",
        ));
    }
    Ok(units)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionRequest {
    pub payer_phone: Msisdn,
    pub amount: Decimal,
    /// Shown to the payer on the prompt, usually the booking reference
    pub account_reference: String,
    pub description: String,
}

/// Synchronous acceptance of a push collection. Not a confirmation of payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionAck {
    pub merchant_request_id: String,
    pub checkout_request_id: String,
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CollectionStatus {
    Succeeded,
    Failed { code: String, reason: String },
    /// No final answer yet
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisbursementRequest {
    pub payee_phone: Msisdn,
    pub amount: Decimal,
    pub remarks: String,
    /// Locally generated id, echoed back on the result callback
    pub originator_conversation_id: String,
    pub occasion: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisbursementAck {
    pub conversation_id: String,
    pub originator_conversation_id: String,
    pub response_description: Option<String>,
}
