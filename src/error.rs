//! Unified error handling for the settlement service
//!
//! Every failure that can reach an HTTP caller is expressed as an [`AppError`]
//! with a status code, a machine-readable [`ErrorCode`], a user-facing message
//! and a retryable flag. Module-local errors convert into it via `From`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for programmatic handling by API clients
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "NOT_ELIGIBLE")]
    NotEligible,
    #[serde(rename = "DUPLICATE_ACTIVE_INTENT")]
    DuplicateActiveIntent,
    #[serde(rename = "BOOKING_NOT_FOUND")]
    BookingNotFound,
    #[serde(rename = "INTENT_NOT_FOUND")]
    IntentNotFound,
    #[serde(rename = "RETRIES_EXHAUSTED")]
    RetriesExhausted,
    #[serde(rename = "INVALID_TRANSITION")]
    InvalidTransition,

    // Infrastructure errors (5xx)
    #[serde(rename = "DATABASE_ERROR")]
    DatabaseError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // External errors (502, 503, 504)
    #[serde(rename = "GATEWAY_AUTH_ERROR")]
    GatewayAuthError,
    #[serde(rename = "GATEWAY_UNAVAILABLE")]
    GatewayUnavailable,
    #[serde(rename = "GATEWAY_REJECTED")]
    GatewayRejected,
    #[serde(rename = "GATEWAY_TIMEOUT")]
    GatewayTimeout,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotEligible => "NOT_ELIGIBLE",
            ErrorCode::DuplicateActiveIntent => "DUPLICATE_ACTIVE_INTENT",
            ErrorCode::BookingNotFound => "BOOKING_NOT_FOUND",
            ErrorCode::IntentNotFound => "INTENT_NOT_FOUND",
            ErrorCode::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorCode::InvalidTransition => "INVALID_TRANSITION",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::GatewayAuthError => "GATEWAY_AUTH_ERROR",
            ErrorCode::GatewayUnavailable => "GATEWAY_UNAVAILABLE",
            ErrorCode::GatewayRejected => "GATEWAY_REJECTED",
            ErrorCode::GatewayTimeout => "GATEWAY_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
        }
    }
}

/// Business rule violations
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Booking is not in a state that allows the requested money movement
    NotEligible { booking_id: i64, reason: String },
    /// A non-terminal intent of the same kind already exists for the booking
    DuplicateActiveIntent {
        booking_id: i64,
        kind: String,
        existing_intent_id: Option<String>,
    },
    BookingNotFound { booking_id: i64 },
    IntentNotFound { reference: String },
    /// The retry chain of a disbursement reached its cap
    RetriesExhausted { intent_id: String, attempts: u32 },
    InvalidTransition {
        intent_id: String,
        from: String,
        to: String,
    },
}

/// Infrastructure-level errors (database, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    Database { message: String, is_retryable: bool },
    Configuration { message: String },
    Internal { message: String },
}

/// Payment gateway failures
#[derive(Debug, Clone)]
pub enum ExternalError {
    /// Token rejected even after a forced refresh
    GatewayAuth { message: String },
    GatewayUnavailable { message: String },
    /// Gateway refused the request; terminal for the attempt
    GatewayRejected {
        code: Option<String>,
        message: String,
    },
    /// Network failure or timeout; the attempt's outcome is unknown
    GatewayTimeout { message: String },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    InvalidAmount { amount: String, reason: String },
    InvalidPhone { phone: String, reason: String },
    InvalidTimestamp { value: String },
    MissingField { field: String },
    MissingPayeeContact { booking_id: i64, party: String },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    External(ExternalError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Infrastructure(InfrastructureError::Internal {
            message: message.into(),
        }))
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotEligible { .. } => 422,
                DomainError::DuplicateActiveIntent { .. } => 409,
                DomainError::BookingNotFound { .. } => 404,
                DomainError::IntentNotFound { .. } => 404,
                DomainError::RetriesExhausted { .. } => 422,
                DomainError::InvalidTransition { .. } => 409,
            },
            AppErrorKind::Infrastructure(_) => 500,
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => 503,
                ExternalError::GatewayUnavailable { .. } => 503,
                ExternalError::GatewayRejected { .. } => 502,
                ExternalError::GatewayTimeout { .. } => 504,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotEligible { .. } => ErrorCode::NotEligible,
                DomainError::DuplicateActiveIntent { .. } => ErrorCode::DuplicateActiveIntent,
                DomainError::BookingNotFound { .. } => ErrorCode::BookingNotFound,
                DomainError::IntentNotFound { .. } => ErrorCode::IntentNotFound,
                DomainError::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
                DomainError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            },
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { .. } => ErrorCode::DatabaseError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
                InfrastructureError::Internal { .. } => ErrorCode::InternalError,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => ErrorCode::GatewayAuthError,
                ExternalError::GatewayUnavailable { .. } => ErrorCode::GatewayUnavailable,
                ExternalError::GatewayRejected { .. } => ErrorCode::GatewayRejected,
                ExternalError::GatewayTimeout { .. } => ErrorCode::GatewayTimeout,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(err) => match err {
                DomainError::NotEligible { booking_id, reason } => {
                    format!("Booking {} is not eligible: {}", booking_id, reason)
                }
                DomainError::DuplicateActiveIntent {
                    booking_id, kind, ..
                } => {
                    format!(
                        "A {} is already in progress for booking {}",
                        kind.replace('_', " "),
                        booking_id
                    )
                }
                DomainError::BookingNotFound { booking_id } => {
                    format!("Booking {} not found", booking_id)
                }
                DomainError::IntentNotFound { reference } => {
                    format!("Payment record '{}' not found", reference)
                }
                DomainError::RetriesExhausted { attempts, .. } => {
                    format!(
                        "Payment was attempted {} times without success. Support has been notified",
                        attempts
                    )
                }
                DomainError::InvalidTransition { from, to, .. } => {
                    format!("Payment cannot move from '{}' to '{}'", from, to)
                }
            },
            AppErrorKind::Infrastructure(_) => {
                "Service temporarily unavailable. Please try again later".to_string()
            }
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } | ExternalError::GatewayUnavailable { .. } => {
                    "Payment gateway is temporarily unavailable. Please try again".to_string()
                }
                ExternalError::GatewayRejected { message, .. } => {
                    format!("Payment request was rejected: {}", message)
                }
                ExternalError::GatewayTimeout { .. } => {
                    "Payment gateway did not respond in time. Please try again".to_string()
                }
            },
            AppErrorKind::Validation(err) => match err {
                ValidationError::InvalidAmount { amount, reason } => {
                    format!("Invalid amount '{}': {}", amount, reason)
                }
                ValidationError::InvalidPhone { reason, .. } => {
                    format!("Invalid phone number: {}", reason)
                }
                ValidationError::InvalidTimestamp { value } => {
                    format!("Invalid timestamp '{}'", value)
                }
                ValidationError::MissingField { field } => {
                    format!("Required field '{}' is missing", field)
                }
                ValidationError::MissingPayeeContact { booking_id, party } => {
                    format!(
                        "No payment phone number on record for the {} of booking {}",
                        party, booking_id
                    )
                }
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Database { is_retryable, .. } => *is_retryable,
                InfrastructureError::Configuration { .. } => false,
                InfrastructureError::Internal { .. } => false,
            },
            AppErrorKind::External(err) => match err {
                ExternalError::GatewayAuth { .. } => true,
                ExternalError::GatewayUnavailable { .. } => true,
                ExternalError::GatewayRejected { .. } => false,
                ExternalError::GatewayTimeout { .. } => true,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

// From<DatabaseError>, From<GatewayError> and From<LedgerError> live next to
// their error types.

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
