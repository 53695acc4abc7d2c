//! Error types shared across Keyforge.
//!
//! Business-rule rejections during verification (unknown code, expired,
//! usage cap, device cap) are *not* errors; they are carried as
//! [`VerificationResponse`](crate::protocol::VerificationResponse)
//! values. `ActivationError` covers infrastructure faults only.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActivationError {
    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The relational store failed (connectivity, query, transaction).
    #[error("storage error: {0}")]
    Storage(String),

    /// A uniqueness constraint was violated (e.g. a duplicate activation code).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Caller supplied malformed input.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Response signing or signature verification failed.
    #[error("signing error: {0}")]
    Signing(String),

    /// Transport-level failure talking to a Keyforge server.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Unexpected internal failure.
    #[error("server error: {0}")]
    Server(String),
}

pub type ActivationResult<T> = Result<T, ActivationError>;

#[cfg(feature = "server")]
impl From<sqlx::Error> for ActivationError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return ActivationError::Conflict(db_err.message().to_string());
            }
        }
        ActivationError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = ActivationError::Storage("disk full".to_string());
        assert_eq!(err.to_string(), "storage error: disk full");

        let err = ActivationError::Conflict("code".to_string());
        assert!(err.to_string().starts_with("conflict"));
    }
}
