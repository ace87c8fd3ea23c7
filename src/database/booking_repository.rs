//! Read/write access to bookings owned by the booking service.
//!
//! The settlement engine reads bookings and only ever writes the three status
//! columns it is responsible for. Every write is conditional so replays are
//! harmless.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::RwLock;

use crate::database::error::DatabaseError;
use crate::database::repository::TransactionalRepository;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(DatabaseError::unknown(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(BookingStatus {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
    Completed => "completed",
});

string_enum!(PayoutStatus {
    Pending => "pending",
    Processing => "processing",
    Paid => "paid",
    Failed => "failed",
});

string_enum!(RefundStatus {
    None => "none",
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    NotApplicable => "not_applicable",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub guest_id: i64,
    pub guest_phone: Option<String>,
    pub property_id: i64,
    pub owner_id: i64,
    pub total_amount: Option<Decimal>,
    pub check_in: DateTime<Utc>,
    pub status: BookingStatus,
    pub payout_status: PayoutStatus,
    pub refund_status: RefundStatus,
    pub is_deleted: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn get_booking(&self, booking_id: i64) -> Result<Option<Booking>, DatabaseError>;

    /// `pending -> confirmed`. Returns whether the row changed.
    async fn confirm_booking(&self, booking_id: i64) -> Result<bool, DatabaseError>;

    /// Returns whether the row changed. `paid` is never overwritten.
    async fn update_payout_status(
        &self,
        booking_id: i64,
        status: PayoutStatus,
    ) -> Result<bool, DatabaseError>;

    /// Returns whether the row changed. `completed` is never overwritten.
    async fn update_refund_status(
        &self,
        booking_id: i64,
        status: RefundStatus,
    ) -> Result<bool, DatabaseError>;
}

/// Where money is sent for a booking
#[async_trait]
pub trait PayeeDirectory: Send + Sync {
    async fn guest_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError>;
    async fn owner_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError>;
}

#[derive(Debug, FromRow)]
struct BookingRow {
    id: i64,
    guest_id: i64,
    guest_phone: Option<String>,
    property_id: i64,
    owner_id: i64,
    total_amount: Option<Decimal>,
    check_in: DateTime<Utc>,
    status: String,
    payout_status: String,
    refund_status: String,
    is_deleted: bool,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<BookingRow> for Booking {
    type Error = DatabaseError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            guest_id: row.guest_id,
            guest_phone: row.guest_phone,
            property_id: row.property_id,
            owner_id: row.owner_id,
            total_amount: row.total_amount,
            check_in: row.check_in,
            status: row.status.parse()?,
            payout_status: row.payout_status.parse()?,
            refund_status: row.refund_status.parse()?,
            is_deleted: row.is_deleted,
            cancelled_at: row.cancelled_at,
        })
    }
}

pub struct PgBookingRepository {
    pool: PgPool,
}

impl PgBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn phone_column(
        &self,
        booking_id: i64,
        column: &'static str,
    ) -> Result<Option<String>, DatabaseError> {
        let sql = format!("SELECT {} FROM bookings WHERE id = $1", column);
        let phone = sqlx::query_scalar::<_, Option<String>>(&sql)
            .bind(booking_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(phone.flatten().filter(|p| !p.trim().is_empty()))
    }
}

impl TransactionalRepository for PgBookingRepository {
    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BookingRepository for PgBookingRepository {
    async fn get_booking(&self, booking_id: i64) -> Result<Option<Booking>, DatabaseError> {
        let row = sqlx::query_as::<_, BookingRow>(
            "SELECT id, guest_id, guest_phone, property_id, owner_id, total_amount, check_in, \
                    status, payout_status, refund_status, is_deleted, cancelled_at \
             FROM bookings WHERE id = $1",
        )
        .bind(booking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        row.map(Booking::try_from).transpose()
    }

    async fn confirm_booking(&self, booking_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE bookings SET status = 'confirmed', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_payout_status(
        &self,
        booking_id: i64,
        status: PayoutStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE bookings SET payout_status = $2, updated_at = NOW() \
             WHERE id = $1 AND payout_status <> $2 AND payout_status <> 'paid'",
        )
        .bind(booking_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_refund_status(
        &self,
        booking_id: i64,
        status: RefundStatus,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "UPDATE bookings SET refund_status = $2, updated_at = NOW() \
             WHERE id = $1 AND refund_status <> $2 AND refund_status <> 'completed'",
        )
        .bind(booking_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PayeeDirectory for PgBookingRepository {
    async fn guest_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError> {
        self.phone_column(booking_id, "guest_phone").await
    }

    async fn owner_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError> {
        self.phone_column(booking_id, "owner_phone").await
    }
}

/// Booking store kept in process memory
#[derive(Default)]
pub struct InMemoryBookingRepository {
    bookings: RwLock<HashMap<i64, Booking>>,
    owner_phones: RwLock<HashMap<i64, String>>,
}

impl InMemoryBookingRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, booking: Booking) {
        self.bookings.write().await.insert(booking.id, booking);
    }

    pub async fn set_owner_phone(&self, booking_id: i64, phone: impl Into<String>) {
        self.owner_phones
            .write()
            .await
            .insert(booking_id, phone.into());
    }
}

#[async_trait]
impl BookingRepository for InMemoryBookingRepository {
    async fn get_booking(&self, booking_id: i64) -> Result<Option<Booking>, DatabaseError> {
        Ok(self.bookings.read().await.get(&booking_id).cloned())
    }

    async fn confirm_booking(&self, booking_id: i64) -> Result<bool, DatabaseError> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking_id) {
            Some(b) if b.status == BookingStatus::Pending => {
                b.status = BookingStatus::Confirmed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_payout_status(
        &self,
        booking_id: i64,
        status: PayoutStatus,
    ) -> Result<bool, DatabaseError> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking_id) {
            Some(b) if b.payout_status != status && b.payout_status != PayoutStatus::Paid => {
                b.payout_status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_refund_status(
        &self,
        booking_id: i64,
        status: RefundStatus,
    ) -> Result<bool, DatabaseError> {
        let mut bookings = self.bookings.write().await;
        match bookings.get_mut(&booking_id) {
            Some(b) if b.refund_status != status && b.refund_status != RefundStatus::Completed => {
                b.refund_status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl PayeeDirectory for InMemoryBookingRepository {
    async fn guest_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError> {
        Ok(self
            .bookings
            .read()
            .await
            .get(&booking_id)
            .and_then(|b| b.guest_phone.clone()))
    }

    async fn owner_phone(&self, booking_id: i64) -> Result<Option<String>, DatabaseError> {
        Ok(self.owner_phones.read().await.get(&booking_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn booking(id: i64) -> Booking {
        Booking {
            id,
            guest_id: 10,
            guest_phone: Some("254712345678".to_string()),
            property_id: 20,
            owner_id: 30,
            total_amount: Some(dec!(10000)),
            check_in: Utc::now(),
            status: BookingStatus::Pending,
            payout_status: PayoutStatus::Pending,
            refund_status: RefundStatus::None,
            is_deleted: false,
            cancelled_at: None,
        }
    }

    #[test]
    fn status_names_round_trip() {
        assert_eq!("not_applicable".parse::<RefundStatus>().unwrap(), RefundStatus::NotApplicable);
        assert_eq!(PayoutStatus::Processing.as_str(), "processing");
        assert!("archived".parse::<BookingStatus>().is_err());
    }

    #[tokio::test]
    async fn confirm_is_idempotent() {
        let repo = InMemoryBookingRepository::new();
        repo.insert(booking(1)).await;
        assert!(repo.confirm_booking(1).await.unwrap());
        assert!(!repo.confirm_booking(1).await.unwrap());
        assert!(!repo.confirm_booking(99).await.unwrap());
    }

    #[tokio::test]
    async fn paid_payout_is_sticky() {
        let repo = InMemoryBookingRepository::new();
        repo.insert(booking(1)).await;
        assert!(repo.update_payout_status(1, PayoutStatus::Paid).await.unwrap());
        assert!(!repo.update_payout_status(1, PayoutStatus::Failed).await.unwrap());
        let stored = repo.get_booking(1).await.unwrap().unwrap();
        assert_eq!(stored.payout_status, PayoutStatus::Paid);
    }

    #[tokio::test]
    async fn payee_directory_reads_contacts() {
        let repo = InMemoryBookingRepository::new();
        repo.insert(booking(1)).await;
        repo.set_owner_phone(1, "254700000001").await;
        assert_eq!(repo.guest_phone(1).await.unwrap().as_deref(), Some("254712345678"));
        assert_eq!(repo.owner_phone(1).await.unwrap().as_deref(), Some("254700000001"));
        assert_eq!(repo.owner_phone(2).await.unwrap(), None);
    }
}
