//! Error types for the oracle boundary, configuration and study runs.
//!
//! The numeric core never returns these: bad inputs degrade to empty designs
//! or "cannot fit" results, and bad answers are tallied as failed tasks.

use std::time::Duration;

use thiserror::Error;

use crate::trace::TraceError;

/// Errors an oracle call can produce.
#[derive(Debug, Error)]
pub enum OracleError {
    /// Transport failure (connection reset, 5xx, ...).
    #[error("transport error: {message}")]
    Transport { message: String, retryable: bool },

    /// Call exceeded its deadline - retryable.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Oracle asked the caller to slow down - retryable.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Answer could not be parsed into any accepted shape - permanent.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// Oracle declined to answer - permanent.
    #[error("refused: {0}")]
    Refused(String),

    /// Stopped by the caller's cancel flag.
    #[error("cancelled")]
    Cancelled,
}

impl OracleError {
    pub fn transport(message: impl Into<String>, retryable: bool) -> Self {
        Self::Transport {
            message: message.into(),
            retryable,
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed(message.into())
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout(_) => true,
            Self::RateLimited { .. } => true,
            Self::Malformed(_) => false,
            Self::Refused(_) => false,
            Self::Cancelled => false,
        }
    }

    /// Short error code for logging and traces.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport_error",
            Self::Timeout(_) => "timeout",
            Self::RateLimited { .. } => "rate_limited",
            Self::Malformed(_) => "malformed_payload",
            Self::Refused(_) => "refused",
            Self::Cancelled => "cancelled",
        }
    }

    /// Minimum wait the oracle requested, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Errors loading or validating a [`StudyConfig`](crate::config::StudyConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}

/// Errors from the async study orchestrator.
#[derive(Debug, Error)]
pub enum StudyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Oracle(#[from] OracleError),
    #[error(transparent)]
    Trace(#[from] TraceError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_and_codes() {
        assert!(OracleError::transport("reset", true).is_retryable());
        assert!(!OracleError::transport("bad gateway", false).is_retryable());
        assert!(OracleError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!OracleError::malformed("no json").is_retryable());
        assert_eq!(OracleError::Cancelled.code(), "cancelled");
        assert_eq!(
            OracleError::RateLimited {
                retry_after: Duration::from_millis(20)
            }
            .retry_after(),
            Some(Duration::from_millis(20))
        );
    }
}
