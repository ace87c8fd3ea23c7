use crate::error::{AppError, AppErrorKind, InfrastructureError};
use std::fmt;

/// Database error with classification for retry decisions
#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    ConnectionError { message: String },
    PoolExhausted,
    Timeout,
    NotFound,
    UniqueViolation { constraint: Option<String> },
    ForeignKeyViolation { constraint: Option<String> },
    SerializationFailure,
    Unknown { message: String },
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind) -> Self {
        Self { kind }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Unknown {
            message: message.into(),
        })
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        let kind = match err {
            sqlx::Error::RowNotFound => DatabaseErrorKind::NotFound,
            sqlx::Error::PoolTimedOut => DatabaseErrorKind::PoolExhausted,
            sqlx::Error::PoolClosed => DatabaseErrorKind::ConnectionError {
                message: "connection pool closed".to_string(),
            },
            sqlx::Error::Io(e) => DatabaseErrorKind::ConnectionError {
                message: e.to_string(),
            },
            sqlx::Error::Database(db) => {
                let constraint = db.constraint().map(|c| c.to_string());
                match db.code().as_deref() {
                    Some("23505") => DatabaseErrorKind::UniqueViolation { constraint },
                    Some("23503") => DatabaseErrorKind::ForeignKeyViolation { constraint },
                    Some("40001") | Some("40P01") => DatabaseErrorKind::SerializationFailure,
                    Some("57014") => DatabaseErrorKind::Timeout,
                    _ => DatabaseErrorKind::Unknown {
                        message: db.message().to_string(),
                    },
                }
            }
            other => DatabaseErrorKind::Unknown {
                message: other.to_string(),
            },
        };
        Self { kind }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn constraint(&self) -> Option<&str> {
        match &self.kind {
            DatabaseErrorKind::UniqueViolation { constraint }
            | DatabaseErrorKind::ForeignKeyViolation { constraint } => constraint.as_deref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            DatabaseErrorKind::ConnectionError { .. }
                | DatabaseErrorKind::PoolExhausted
                | DatabaseErrorKind::Timeout
                | DatabaseErrorKind::SerializationFailure
        )
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DatabaseErrorKind::ConnectionError { message } => {
                write!(f, "database connection error: {}", message)
            }
            DatabaseErrorKind::PoolExhausted => write!(f, "database pool exhausted"),
            DatabaseErrorKind::Timeout => write!(f, "database statement timed out"),
            DatabaseErrorKind::NotFound => write!(f, "row not found"),
            DatabaseErrorKind::UniqueViolation { constraint } => {
                write!(f, "unique violation on {}", constraint.as_deref().unwrap_or("?"))
            }
            DatabaseErrorKind::ForeignKeyViolation { constraint } => write!(
                f,
                "foreign key violation on {}",
                constraint.as_deref().unwrap_or("?")
            ),
            DatabaseErrorKind::SerializationFailure => write!(f, "serialization failure"),
            DatabaseErrorKind::Unknown { message } => write!(f, "database error: {}", message),
        }
    }
}

impl std::error::Error for DatabaseError {}

impl From<DatabaseError> for AppError {
    fn from(err: DatabaseError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Database {
            is_retryable: err.is_retryable(),
            message: err.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_is_not_retryable() {
        let err = DatabaseError::from_sqlx(sqlx::Error::RowNotFound);
        assert_eq!(err.kind, DatabaseErrorKind::NotFound);
        assert!(!err.is_retryable());
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let err = DatabaseError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        let app: AppError = err.into();
        assert_eq!(app.status_code(), 500);
        assert!(app.is_retryable());
    }

    #[test]
    fn unique_violation_reports_constraint() {
        let err = DatabaseError::new(DatabaseErrorKind::UniqueViolation {
            constraint: Some("settlement_intents_one_active".to_string()),
        });
        assert!(err.is_unique_violation());
        assert_eq!(err.constraint(), Some("settlement_intents_one_active"));
    }
}
