//! Error types shared across the harness.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Failure kinds the harness distinguishes.
///
/// Everything here is fatal for the run it occurs in, with one exception:
/// the hole detector tolerates individual probe-read failures and only
/// surfaces an error when every probe failed.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// Store unreachable while opening the session, or an operation was
    /// attempted on a session that is not open.
    #[error("store connection failed: {0}")]
    Connection(String),

    /// A cluster lifecycle command failed or was refused.
    #[error("orchestration failed for `{op}`: {detail}")]
    Orchestration { op: String, detail: String },

    /// A write was not acknowledged, even after downgrading retries.
    #[error("write of {what} failed: {detail}")]
    Write { what: String, detail: String },

    /// A read was not satisfied, even after downgrading retries.
    #[error("read of {what} failed: {detail}")]
    Read { what: String, detail: String },

    /// A bounded wait expired before the awaited condition held.
    #[error("timed out waiting for {what} after {waited:?}")]
    Timeout { what: String, waited: Duration },
}

impl HarnessError {
    pub fn connection(detail: impl Into<String>) -> Self {
        HarnessError::Connection(detail.into())
    }

    pub fn orchestration(op: impl Into<String>, detail: impl Into<String>) -> Self {
        HarnessError::Orchestration {
            op: op.into(),
            detail: detail.into(),
        }
    }

    pub fn write(what: impl Into<String>, detail: impl Into<String>) -> Self {
        HarnessError::Write {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn read(what: impl Into<String>, detail: impl Into<String>) -> Self {
        HarnessError::Read {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn timeout(what: impl Into<String>, waited: Duration) -> Self {
        HarnessError::Timeout {
            what: what.into(),
            waited,
        }
    }
}
