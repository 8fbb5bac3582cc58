//! Error taxonomy for the harness.
//!
//! Two classes of failure are fatal and abort the run (setup and
//! supervision); assertion divergence is never an error here — it is
//! recorded per test case in the scenario report and the run continues.

use std::time::Duration;

/// Error type for harness operations.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Provisioning or connectivity failure before any test case ran.
    #[error("setup failed: {0}")]
    Setup(String),

    /// The operation under test died unexpectedly, or a poll predicate
    /// was exhausted while it was still needed.
    #[error("supervision failure: {0}")]
    Supervision(String),

    /// Bounded wait elapsed without the condition being observed.
    #[error("timed out after {attempts} attempts ({waited:?}): {what}")]
    Timeout {
        what: String,
        attempts: u32,
        waited: Duration,
    },

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;
