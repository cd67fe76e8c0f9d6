//! Errors raised by the trust engine
//!
//! A denied action is never an error. These cover the cases where the engine
//! cannot answer at all, or where a write would break the ledger.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("No policy entry for action: {0}")]
    NotFound(String),

    #[error("Trust store unavailable: {0}")]
    Transient(#[from] rusqlite::Error),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Concurrent update lost the race for {website_id}/{category}")]
    ConcurrentUpdateConflict { website_id: String, category: String },

    #[error("Stored payload could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TrustError {
    /// Whether retrying the same single operation can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TrustError::Transient(_) | TrustError::ConcurrentUpdateConflict { .. }
        )
    }

    pub(crate) fn conflict(website_id: &str, category: &str) -> Self {
        TrustError::ConcurrentUpdateConflict {
            website_id: website_id.to_string(),
            category: category.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrustError>;
