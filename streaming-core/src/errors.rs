//! Error taxonomy for the streaming core (spec.md §7, SPEC_FULL.md §10.3).
//!
//! One flat enum in the teacher's style (`derive_more::{Display, Error,
//! From}`) rather than a tree of nested error types per module.

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

use crate::packets::RateLimitMetadata;

pub type CoreResult<T> = Result<T, CoreError>;

/// The taxonomy from spec.md §7. `retriable()` encodes the retry policy
/// from §7/§4.6 so callers don't have to re-derive it at every call site.
#[derive(Debug, Display, Error, From)]
pub enum CoreError {
    #[display(fmt = "validation error: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    Validation(String),

    #[display(fmt = "not found: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    NotFound(String),

    #[display(fmt = "not synchronized")]
    NotSynchronized,

    #[display(fmt = "timeout")]
    #[error(ignore)]
    #[from(ignore)]
    Timeout,

    #[display(fmt = "not authenticated")]
    NotAuthenticated,

    #[display(fmt = "unauthorized: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    Unauthorized(String),

    #[display(fmt = "too many requests: {:?}", metadata)]
    #[error(ignore)]
    #[from(ignore)]
    TooManyRequests { metadata: RateLimitMetadata },

    #[display(fmt = "trade error: {} (numeric={:?} string={:?})", message, numeric_code, string_code)]
    #[error(ignore)]
    #[from(ignore)]
    Trade {
        message: String,
        numeric_code: Option<i64>,
        string_code: Option<String>,
    },

    #[display(fmt = "internal error: {}", _0)]
    #[error(ignore)]
    #[from(ignore)]
    Internal(String),

    #[display(fmt = "client is closed")]
    Closed,

    #[display(fmt = "request cancelled")]
    Cancelled,

    Io(std::io::Error),
    Json(serde_json::Error),
    Ws(tokio_tungstenite::tungstenite::Error),
    UrlParse(url::ParseError),
    Http(reqwest::Error),
    Elapsed(tokio::time::error::Elapsed),

    #[display(fmt = "{}", _0)]
    #[error(ignore)]
    Anyhow(anyhow::Error),
}

impl CoreError {
    /// §7: NotSynchronized/Timeout/NotAuthenticated/Internal retry with
    /// backoff. Validation/NotFound/Trade are never retried. TooManyRequests
    /// retries only when its `recommendedRetryTime` fits the remaining
    /// retry budget (checked separately by the caller, §4.6). Unauthorized
    /// is fatal and never retried.
    pub fn retriable(&self) -> bool {
        matches!(
            self,
            CoreError::NotSynchronized
                | CoreError::Timeout
                | CoreError::Elapsed(_)
                | CoreError::NotAuthenticated
                | CoreError::Internal(_)
        )
    }

    pub fn is_fatal_unauthorized(&self) -> bool {
        matches!(self, CoreError::Unauthorized(_))
    }

    pub fn recommended_retry_time(&self) -> Option<DateTime<Utc>> {
        match self {
            CoreError::TooManyRequests { metadata } => metadata.recommended_retry_time,
            _ => None,
        }
    }

    pub fn timeout() -> Self {
        CoreError::Timeout
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_matches_spec_taxonomy() {
        assert!(CoreError::NotSynchronized.retriable());
        assert!(CoreError::Timeout.retriable());
        assert!(CoreError::NotAuthenticated.retriable());
        assert!(CoreError::internal("boom").retriable());

        assert!(!CoreError::Validation("bad".into()).retriable());
        assert!(!CoreError::NotFound("x".into()).retriable());
        assert!(!CoreError::Trade {
            message: "rejected".into(),
            numeric_code: Some(1),
            string_code: None,
        }
        .retriable());
        assert!(!CoreError::Unauthorized("bad token".into()).retriable());
    }

    #[test]
    fn unauthorized_is_fatal() {
        assert!(CoreError::Unauthorized("x".into()).is_fatal_unauthorized());
        assert!(!CoreError::Timeout.is_fatal_unauthorized());
    }
}
