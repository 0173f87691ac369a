//! Error taxonomy for the trading core.

use crate::domain::BudgetResult;
use thiserror::Error;

/// Failure reported by an exchange adapter. The operation had no partial
/// effect; idempotent work items may safely be re-enqueued.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("{endpoint} returned status {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },

    #[error("transport error for {endpoint}: {message}")]
    Transport { endpoint: String, message: String },

    #[error("exchange response is unusable: {0}")]
    Response(String),
}

impl AdapterError {
    /// Whether retrying the same request could plausibly succeed. Only
    /// idempotent reads are ever retried, and at most once.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Timeout { .. } | AdapterError::Transport { .. } => true,
            AdapterError::Status { status, .. } => *status >= 500,
            AdapterError::Decode { .. } | AdapterError::Response(_) => false,
        }
    }

    pub fn from_reqwest(endpoint: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AdapterError::Timeout {
                endpoint: endpoint.to_string(),
            }
        } else if err.is_decode() {
            AdapterError::Decode {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        } else {
            AdapterError::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

/// Unified error for core engine operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed input, rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced entity does not exist; aborted with no partial effect.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A ledger primitive refused the operation.
    #[error("ledger refused operation: {0}")]
    Ledger(BudgetResult),

    /// The exchange adapter failed; no local state was changed.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// One leg of a paired ledger mutation failed after the other succeeded.
    /// Structurally prevented by transactional settlement; observing this
    /// halts automatic processing of the affected order.
    #[error("ledger consistency violation: {0}")]
    Consistency(String),

    /// Underlying storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl CoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
