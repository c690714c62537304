//! Unified error types for Cadence.

use thiserror::Error;

/// Result type alias using CadenceError.
pub type Result<T> = std::result::Result<T, CadenceError>;

#[derive(Error, Debug)]
pub enum CadenceError {
    // Delivery errors. The split drives the scheduler's retry policy.
    /// Network/provider timeout or similar. Retried with backoff.
    #[error("Transient delivery error: {0}")]
    TransientDelivery(String),

    /// Invalid recipient, provider rejection. Never retried.
    #[error("Permanent delivery error: {0}")]
    PermanentDelivery(String),

    // Scheduler errors
    /// Broken precondition during processing (claim race, missing step).
    /// Fatal for the attempt only; the lease is released without mutation.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Enrollment not found: {0}")]
    EnrollmentNotFound(String),

    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    // General errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CadenceError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientDelivery(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::PermanentDelivery(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error should be retried by the send loop.
    pub fn is_transient_delivery(&self) -> bool {
        matches!(self, Self::TransientDelivery(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CadenceError::TransientDelivery("timeout".into());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_error_constructors() {
        let e1 = CadenceError::transient("test");
        assert!(matches!(e1, CadenceError::TransientDelivery(_)));
        assert!(e1.is_transient_delivery());

        let e2 = CadenceError::permanent("test");
        assert!(matches!(e2, CadenceError::PermanentDelivery(_)));
        assert!(!e2.is_transient_delivery());

        let e3 = CadenceError::invariant("test");
        assert!(matches!(e3, CadenceError::Invariant(_)));

        let e4 = CadenceError::store("test");
        assert!(matches!(e4, CadenceError::Store(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: CadenceError = io_err.into();
        assert!(matches!(err, CadenceError::Io(_)));
    }
}
