//! Error taxonomy
//!
//! Only three kinds of failure ever leave the core:
//!
//! - **Store errors**: the relational datastore failed and retries were exhausted
//! - **Rate limiting**: a limiter scope was exceeded for the request's subject
//! - **Validation**: the caller handed in an input the core refuses to persist
//!
//! Cache and limiter-infrastructure faults are absorbed where they happen and
//! only show up in logs and [`ServiceStats`](crate::ServiceStats).

use thiserror::Error;

use crate::rate_limiter::RateLimitScope;

/// Convenience alias used throughout the crate
pub type Result<T, E = StakeError> = std::result::Result<T, E>;

/// Errors surfaced to the caller-side boundary
#[derive(Debug, Error)]
pub enum StakeError {
    /// Backing store unavailable or rejected the operation
    #[error("store operation '{operation}' failed after {attempts} attempt(s): {source}")]
    Store {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Too many requests for the given scope
    #[error("rate limit exceeded for scope '{scope}', retry after {retry_after_secs}s")]
    RateLimited {
        scope: RateLimitScope,
        retry_after_secs: u64,
    },

    /// Input rejected before reaching the store
    #[error("invalid input: {0}")]
    Validation(String),
}

impl StakeError {
    /// Whether the caller should answer with a "too many requests" signal
    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// The scope that triggered a rate-limit rejection, if any
    #[must_use]
    pub fn rate_limited_scope(&self) -> Option<RateLimitScope> {
        match self {
            Self::RateLimited { scope, .. } => Some(*scope),
            _ => None,
        }
    }
}

/// Marker for backend failures that retrying cannot fix
///
/// Backends wrap constraint violations, malformed data and similar permanent
/// failures in this type; the retry combinator gives up on them immediately.
#[derive(Debug, Error)]
#[error("operation rejected by backend: {reason}")]
pub struct RejectedOperation {
    pub reason: String,
}

impl RejectedOperation {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Returns `true` unless the error chain carries a [`RejectedOperation`]
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    !err.chain()
        .any(|cause| cause.downcast_ref::<RejectedOperation>().is_some())
}
