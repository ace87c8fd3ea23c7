use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Failures talking to the mobile-money gateway
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The gateway refused our access token (HTTP 401)
    #[error("Gateway authentication failed: {message}")]
    Auth { message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Gateway request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The gateway understood and declined the request
    #[error("Gateway rejected request: code={code:?}, message={message}")]
    Rejected {
        code: Option<String>,
        message: String,
    },

    #[error("Gateway unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid gateway response: {message}")]
    InvalidResponse { message: String },
}

impl GatewayError {
    pub fn validation(message: impl Into<String>, field: &str) -> Self {
        GatewayError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Validation { .. } => false,
            GatewayError::Auth { .. } => true,
            GatewayError::Network { .. } => true,
            GatewayError::Timeout { .. } => true,
            GatewayError::Rejected { .. } => false,
            GatewayError::Unavailable { .. } => true,
            GatewayError::InvalidResponse { .. } => false,
        }
    }

    /// True when a submission may have reached the gateway even though we got no
    /// usable answer, so a result callback can still arrive.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            GatewayError::Network { .. }
                | GatewayError::Timeout { .. }
                | GatewayError::InvalidResponse { .. }
        )
    }

    pub fn http_status_code(&self) -> u16 {
        match self {
            GatewayError::Validation { .. } => 400,
            GatewayError::Auth { .. } => 503,
            GatewayError::Network { .. } => 504,
            GatewayError::Timeout { .. } => 504,
            GatewayError::Rejected { .. } => 502,
            GatewayError::Unavailable { .. } => 503,
            GatewayError::InvalidResponse { .. } => 502,
        }
    }

    /// Short description suitable for storing as an intent failure reason
    pub fn failure_reason(&self) -> String {
        match self {
            GatewayError::Rejected { message, .. } => message.clone(),
            GatewayError::Validation { message, .. } => message.clone(),
            GatewayError::Timeout { .. } => "gateway request timed out".to_string(),
            GatewayError::Network { .. } => "gateway unreachable".to_string(),
            GatewayError::Auth { .. } | GatewayError::Unavailable { .. } => {
                "gateway unavailable".to_string()
            }
            GatewayError::InvalidResponse { .. } => "unreadable gateway response".to_string(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            GatewayError::Rejected { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

impl From<GatewayError> for crate::error::AppError {
    fn from(err: GatewayError) -> Self {
        use crate::error::{AppError, AppErrorKind, ExternalError, ValidationError};

        let kind = match err {
            GatewayError::Validation { message, field } => match field.as_deref() {
                Some("phone") => AppErrorKind::Validation(ValidationError::InvalidPhone {
                    phone: String::new(),
                    reason: message,
                }),
                _ => AppErrorKind::Validation(ValidationError::InvalidAmount {
                    amount: field.unwrap_or_default(),
                    reason: message,
                }),
            },
            GatewayError::Auth { message } => {
                AppErrorKind::External(ExternalError::GatewayAuth { message })
            }
            GatewayError::Unavailable { message } => {
                AppErrorKind::External(ExternalError::GatewayUnavailable { message })
            }
            GatewayError::Rejected { code, message } => {
                AppErrorKind::External(ExternalError::GatewayRejected { code, message })
            }
            GatewayError::Network { message } => {
                AppErrorKind::External(ExternalError::GatewayTimeout { message })
            }
            GatewayError::Timeout { timeout_secs } => {
                AppErrorKind::External(ExternalError::GatewayTimeout {
                    message: format!("no response after {}s", timeout_secs),
                })
            }
            GatewayError::InvalidResponse { message } => {
                AppErrorKind::External(ExternalError::GatewayUnavailable { message })
            }
        };

        AppError::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_http_status_mapping_is_correct() {
        assert_eq!(
            GatewayError::validation("bad phone", "phone").http_status_code(),
            400
        );
        assert_eq!(
            GatewayError::Rejected {
                code: Some("400.002.02".to_string()),
                message: "Invalid Amount".to_string()
            }
            .http_status_code(),
            502
        );
    }

    #[test]
    fn retryable_and_unknown_flags_are_set() {
        let timeout = GatewayError::Timeout { timeout_secs: 30 };
        assert!(timeout.is_retryable());
        assert!(timeout.is_outcome_unknown());

        let rejected = GatewayError::Rejected {
            code: None,
            message: "declined".to_string(),
        };
        assert!(!rejected.is_retryable());
        assert!(!rejected.is_outcome_unknown());
        assert_eq!(rejected.failure_reason(), "declined");
    }

    #[test]
    fn converts_into_app_error() {
        let app: crate::error::AppError = GatewayError::Network {
            message: "connection reset".to_string(),
        }
        .into();
        assert_eq!(app.status_code(), 504);
        assert!(app.is_retryable());
    }
}
