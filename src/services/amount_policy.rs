//! Revenue split and cancellation refund rules
//!
//! Pure calculations, no I/O. All money is `Decimal` rounded to two places
//! with round-half-up.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppErrorKind, ValidationError};

/// Commission applied when nothing else is configured, in percent
pub const DEFAULT_COMMISSION_PERCENT: Decimal = Decimal::TEN;

const FULL_REFUND_LEAD_HOURS: i64 = 48;
const PARTIAL_REFUND_LEAD_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AmountPolicyError {
    #[error("booking amount cannot be negative: {0}")]
    NegativeAmount(Decimal),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

impl From<AmountPolicyError> for AppError {
    fn from(err: AmountPolicyError) -> Self {
        let kind = match err {
            AmountPolicyError::NegativeAmount(amount) => {
                AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: amount.to_string(),
                    reason: "Amount cannot be negative".to_string(),
                })
            }
            AmountPolicyError::InvalidTimestamp(value) => {
                AppErrorKind::Validation(ValidationError::InvalidTimestamp { value })
            }
        };
        AppError::new(kind)
    }
}

/// Platform / owner breakdown of a booking total
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevenueSplit {
    pub total: Decimal,
    pub commission_percent: Decimal,
    pub platform_amount: Decimal,
    pub owner_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundTier {
    /// Some money goes back to the guest
    Confirmed,
    /// Cancelled too late, nothing is refunded
    None,
}

impl RefundTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundTier::Confirmed => "confirmed",
            RefundTier::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundQuote {
    pub tier: RefundTier,
    pub percentage: Decimal,
    pub amount: Decimal,
    pub reason: String,
    /// Whole hours between cancellation and check-in, negative once check-in has passed
    pub hours_before_check_in: i64,
}

impl RefundQuote {
    pub fn is_refundable(&self) -> bool {
        self.tier == RefundTier::Confirmed && self.amount > Decimal::ZERO
    }
}

/// Converts the timestamp shapes we receive into one UTC instant.
///
/// Timezone-less values are taken to be UTC.
pub trait ToUtcInstant {
    fn to_utc_instant(&self) -> DateTime<Utc>;
}

impl ToUtcInstant for DateTime<Utc> {
    fn to_utc_instant(&self) -> DateTime<Utc> {
        *self
    }
}

impl ToUtcInstant for DateTime<FixedOffset> {
    fn to_utc_instant(&self) -> DateTime<Utc> {
        self.with_timezone(&Utc)
    }
}

impl ToUtcInstant for NaiveDateTime {
    fn to_utc_instant(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(self)
    }
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DD HH:MM:SS` / `YYYY-MM-DDTHH:MM:SS`
/// value which is taken to be UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AmountPolicyError> {
    let trimmed = value.trim();
    if let Ok(aware) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(aware.to_utc_instant());
    }
    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(naive.to_utc_instant());
        }
    }
    Err(AmountPolicyError::InvalidTimestamp(value.to_string()))
}

/// Round to cents, half-up.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy)]
pub struct AmountPolicy {
    commission_percent: Decimal,
}

impl Default for AmountPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_COMMISSION_PERCENT)
    }
}

impl AmountPolicy {
    pub fn new(commission_percent: Decimal) -> Self {
        Self { commission_percent }
    }

    pub fn commission_percent(&self) -> Decimal {
        self.commission_percent
    }

    /// Split a booking total between platform and owner.
    ///
    /// Returns `None` for a missing, zero or negative total. The owner amount is
    /// derived by subtraction so both parts always sum to `total`.
    pub fn split_revenue(&self, total: Option<Decimal>) -> Option<RevenueSplit> {
        let total = total.filter(|t| *t > Decimal::ZERO)?;
        let platform_amount =
            round_money(total * self.commission_percent / Decimal::ONE_HUNDRED);
        let owner_amount = total - platform_amount;

        Some(RevenueSplit {
            total,
            commission_percent: self.commission_percent,
            platform_amount,
            owner_amount,
        })
    }

    /// Refund owed to a guest cancelling at `cancelled_at` for a stay starting at `check_in`.
    ///
    /// | lead time     | refund | tier        |
    /// |---------------|--------|-------------|
    /// | >= 48h        | 100%   | `confirmed` |
    /// | [24h, 48h)    | 50%    | `confirmed` |
    /// | < 24h         | 0      | `none`      |
    pub fn calculate_refund<C, X>(
        &self,
        check_in: &C,
        booking_amount: Decimal,
        cancelled_at: &X,
    ) -> Result<RefundQuote, AmountPolicyError>
    where
        C: ToUtcInstant + ?Sized,
        X: ToUtcInstant + ?Sized,
    {
        if booking_amount < Decimal::ZERO {
            return Err(AmountPolicyError::NegativeAmount(booking_amount));
        }

        let lead_time = check_in.to_utc_instant() - cancelled_at.to_utc_instant();
        let hours_before_check_in = lead_time.num_hours();

        let (tier, percentage, reason) = if lead_time >= Duration::hours(FULL_REFUND_LEAD_HOURS) {
            (
                RefundTier::Confirmed,
                Decimal::ONE_HUNDRED,
                "Cancelled at least 48 hours before check-in: full refund",
            )
        } else if lead_time >= Duration::hours(PARTIAL_REFUND_LEAD_HOURS) {
            (
                RefundTier::Confirmed,
                Decimal::from(50),
                "Cancelled between 24 and 48 hours before check-in: 50% refund",
            )
        } else {
            (
                RefundTier::None,
                Decimal::ZERO,
                "Cancelled less than 24 hours before check-in: no refund",
            )
        };

        Ok(RefundQuote {
            tier,
            percentage,
            amount: round_money(booking_amount * percentage / Decimal::ONE_HUNDRED),
            reason: reason.to_string(),
            hours_before_check_in,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn check_in() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 20, 14, 0, 0).unwrap()
    }

    #[test]
    fn split_of_ten_thousand() {
        let split = AmountPolicy::default()
            .split_revenue(Some(dec!(10000)))
            .unwrap();
        assert_eq!(split.platform_amount, dec!(1000.00));
        assert_eq!(split.owner_amount, dec!(9000.00));
    }

    #[test]
    fn split_rounds_half_up_and_sums_exactly() {
        // 10% of 0.05 is 0.005 which rounds up to 0.01
        let split = AmountPolicy::default().split_revenue(Some(dec!(0.05))).unwrap();
        assert_eq!(split.platform_amount, dec!(0.01));
        assert_eq!(split.owner_amount, dec!(0.04));

        let split = AmountPolicy::default()
            .split_revenue(Some(dec!(1234.55)))
            .unwrap();
        assert_eq!(split.platform_amount, dec!(123.46));
        assert_eq!(split.platform_amount + split.owner_amount, dec!(1234.55));
    }

    #[test]
    fn split_always_sums_to_total() {
        let policy = AmountPolicy::new(dec!(12.5));
        let mut total = dec!(0.01);
        while total < dec!(500) {
            let split = policy.split_revenue(Some(total)).unwrap();
            assert_eq!(split.platform_amount + split.owner_amount, total);
            total += dec!(1.37);
        }
    }

    #[test]
    fn split_rejects_missing_zero_and_negative_totals() {
        let policy = AmountPolicy::default();
        assert!(policy.split_revenue(None).is_none());
        assert!(policy.split_revenue(Some(Decimal::ZERO)).is_none());
        assert!(policy.split_revenue(Some(dec!(-5))).is_none());
    }

    #[test]
    fn refund_fifty_hours_out_is_full() {
        let cancelled = check_in() - Duration::hours(50);
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.tier, RefundTier::Confirmed);
        assert_eq!(quote.percentage, dec!(100));
        assert_eq!(quote.amount, dec!(5000));
        assert!(quote.is_refundable());
    }

    #[test]
    fn refund_thirty_hours_out_is_half() {
        let cancelled = check_in() - Duration::hours(30);
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.tier, RefundTier::Confirmed);
        assert_eq!(quote.amount, dec!(2500.00));
    }

    #[test]
    fn refund_ten_hours_out_is_nothing() {
        let cancelled = check_in() - Duration::hours(10);
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.tier, RefundTier::None);
        assert_eq!(quote.amount, Decimal::ZERO);
        assert!(!quote.is_refundable());
    }

    #[test]
    fn refund_tier_boundaries_are_inclusive_at_lower_edge() {
        let policy = AmountPolicy::default();
        let exactly_48 = check_in() - Duration::hours(48);
        let just_under_48 = exactly_48 + Duration::seconds(1);
        let exactly_24 = check_in() - Duration::hours(24);
        let just_under_24 = exactly_24 + Duration::seconds(1);

        let pct = |at: DateTime<Utc>| {
            policy
                .calculate_refund(&check_in(), dec!(100), &at)
                .unwrap()
                .percentage
        };
        assert_eq!(pct(exactly_48), dec!(100));
        assert_eq!(pct(just_under_48), dec!(50));
        assert_eq!(pct(exactly_24), dec!(50));
        assert_eq!(pct(just_under_24), dec!(0));
    }

    #[test]
    fn refund_after_check_in_is_nothing() {
        let cancelled = check_in() + Duration::hours(2);
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.tier, RefundTier::None);
        assert_eq!(quote.hours_before_check_in, -2);
    }

    #[test]
    fn refund_half_of_odd_amount_rounds_half_up() {
        let cancelled = check_in() - Duration::hours(30);
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(0.05), &cancelled)
            .unwrap();
        assert_eq!(quote.amount, dec!(0.03));
    }

    #[test]
    fn refund_rejects_negative_amount() {
        let err = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(-1), &check_in())
            .unwrap_err();
        assert_eq!(err, AmountPolicyError::NegativeAmount(dec!(-1)));
    }

    #[test]
    fn naive_and_offset_timestamps_compare_as_utc() {
        // 2026-03-18T17:00:00+03:00 is 14:00 UTC, exactly 48h before check-in
        let cancelled = DateTime::parse_from_rfc3339("2026-03-18T17:00:00+03:00").unwrap();
        let quote = AmountPolicy::default()
            .calculate_refund(&check_in(), dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.percentage, dec!(100));

        let naive_check_in = check_in().naive_utc();
        let quote = AmountPolicy::default()
            .calculate_refund(&naive_check_in, dec!(5000), &cancelled)
            .unwrap();
        assert_eq!(quote.percentage, dec!(100));
    }

    #[test]
    fn parse_timestamp_accepts_naive_and_rfc3339() {
        let expected = check_in();
        assert_eq!(parse_timestamp("2026-03-20T14:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-20T17:00:00+03:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-20 14:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2026-03-20T14:00").unwrap(), expected);
        assert!(parse_timestamp("next tuesday").is_err());
    }
}
