//! Engine error types.

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad input; rejected before hashing or persistence.
    #[error("Invalid request: {0}")]
    Validation(#[from] renderq_models::RequestError),

    /// Upstream entitlement denial; no queue interaction happened.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Local pending queue full — distinct from a duplicate submission.
    #[error("Queue at capacity ({pending}/{capacity} pending)")]
    CapacityExceeded { pending: usize, capacity: usize },

    /// Poll token is not a well-formed work key.
    #[error("Invalid poll token: {0}")]
    InvalidToken(#[from] renderq_models::WorkKeyError),

    /// Poll token does not match any known work.
    #[error("Unknown poll token")]
    UnknownToken,

    /// Instance is shutting down and refusing new admissions.
    #[error("Shutting down, not accepting work")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] renderq_store::StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
