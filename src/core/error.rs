//! Error types for IBP operations.
//!
//! This module defines the canonical error type used throughout the crate.
//! Every subsystem returns `Result<T, IbpError>`. Variants map onto the
//! error taxonomy of the heading-recovery specification: most are fatal
//! (abort the run before commit, artifacts preserved), a few are retried
//! internally and never surface past the oracle layer.

use std::io;
use thiserror::Error;

/// Canonical error type for all IBP operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Infrastructure variants auto-convert via `#[from]`.
#[derive(Error, Debug)]
pub enum IbpError {
    /// Missing file, bad/conflicting encoding declaration, hash mismatch on rerun.
    #[error("input error: {0}")]
    InputError(String),

    /// DOM parse failure for a book file; the book fails closed.
    #[error("parse error in {file}: {reason}")]
    ParseError { file: String, reason: String },

    /// Oracle network/throttle/timeout failure exhausted its retry budget.
    #[error("oracle transient error: {0}")]
    OracleTransientError(String),

    /// Oracle replied with malformed or incomplete JSON after retries.
    #[error("oracle protocol error: {0}")]
    OracleProtocolError(String),

    /// A proposed injection matched the must-not-heading fixture without an override.
    #[error("must-not-heading violation: {0}")]
    MustNotHeadingViolation(String),

    /// Approval artifact referenced a candidate absent from the proposal, or raised its level.
    #[error("approval mismatch: {0}")]
    ApprovalMismatch(String),

    /// A decision-affecting invariant was violated; the run aborts before commit.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// A run/gate transition was attempted out of order (e.g. apply before approval).
    #[error("state error: {0}")]
    StateError(String),

    /// Resource not found (book, run, candidate, topic, etc).
    #[error("not found: {0}")]
    NotFound(String),

    /// SQLite database error (auto-converts from `rusqlite::Error`).
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML (de)serialization error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Oracle HTTP transport error (network-level; distinct from protocol/JSON shape errors).
    #[error("oracle transport error: {0}")]
    OracleTransport(#[from] reqwest::Error),
}

impl IbpError {
    /// Maps this error to the CLI exit code contract:
    /// 0 success, 1 other error, 2 awaiting approval (handled by callers
    /// directly, not via an error variant), 3 blocked by must-not-heading
    /// without override, 4 invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            IbpError::MustNotHeadingViolation(_) => 3,
            IbpError::InvariantViolation(_) => 4,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(
            IbpError::MustNotHeadingViolation("x".into()).exit_code(),
            3
        );
        assert_eq!(IbpError::InvariantViolation("x".into()).exit_code(), 4);
        assert_eq!(IbpError::NotFound("x".into()).exit_code(), 1);
    }

    #[test]
    fn display_messages_are_informative() {
        let err = IbpError::ApprovalMismatch("candidate xyz not proposed".to_string());
        assert!(format!("{}", err).contains("xyz"));
    }
}
