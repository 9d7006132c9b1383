//! Error types and result handling for tenant and message operations.
//!
//! Defines the error taxonomy shared by every crate in the workspace:
//! storage failures, broker failures, missing entities, create conflicts,
//! and request validation. HTTP status mapping lives in the API crate.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for tenant and message operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Broker publish, declare, or consume failed.
    #[error("broker error: {0}")]
    Broker(String),

    /// Tenant, message, or config row missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Create conflicted with an existing entity.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Request shape or parameter invalid.
    #[error("invalid input: {0}")]
    Validation(String),
}

impl CoreError {
    /// Creates a storage error from a message.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Creates a broker error from a message.
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }

    /// Creates a not-found error from a message.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::AlreadyExists(format!("unique constraint violation: {db_err}"))
            },
            _ => Self::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[test]
    fn error_display_format() {
        assert_eq!(
            CoreError::not_found("tenant 42").to_string(),
            "not found: tenant 42"
        );
        assert_eq!(
            CoreError::broker("channel closed").to_string(),
            "broker error: channel closed"
        );
    }
}
