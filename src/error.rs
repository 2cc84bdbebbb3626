//! Error taxonomy for the retrieval engine.
//!
//! Store operations distinguish transient faults (retried by callers with
//! exponential backoff) from permanent ones (surfaced). External model
//! calls and PDF extraction have their own error kinds so the ingestion
//! pipeline and the query engine can degrade per the recovery policy:
//! embedding failure at query time aborts the vector strategy only, rerank
//! failure falls back to base scores, extraction failure is per-document
//! fatal while the batch continues.

use thiserror::Error;

/// Failure of a graph-store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Network, timeout, or lock conflict. Retryable.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Constraint violation, schema mismatch, unreachable store.
    #[error("permanent store error: {0}")]
    Permanent(String),

    /// Query vector length disagrees with the corpus embedding dimension.
    #[error("embedding dimension mismatch: query has {got}, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient(e.to_string()),
            sqlx::Error::Database(db) if db.message().contains("locked") => {
                StoreError::Transient(e.to_string())
            }
            _ => StoreError::Permanent(e.to_string()),
        }
    }
}

/// Failure of PDF text extraction.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("file not found: {0}")]
    NotFound(String),

    /// Every backend produced empty text for this document.
    #[error("no extraction backend produced text for {0}")]
    Empty(String),

    #[error("PDF parse failed: {0}")]
    Parse(String),
}

/// Failure of an external model call (embedding or cross-encoder).
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model endpoint unavailable: {0}")]
    Unavailable(String),

    #[error("model call timed out after {0}s")]
    Timeout(u64),

    #[error("model response malformed: {0}")]
    Malformed(String),

    #[error("provider is disabled")]
    Disabled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retryable() {
        assert!(StoreError::Transient("timeout".into()).is_transient());
        assert!(!StoreError::Permanent("constraint".into()).is_transient());
        assert!(!StoreError::DimensionMismatch {
            expected: 384,
            got: 768
        }
        .is_transient());
    }

    #[test]
    fn dimension_mismatch_message_names_both_sizes() {
        let e = StoreError::DimensionMismatch {
            expected: 384,
            got: 12,
        };
        let msg = e.to_string();
        assert!(msg.contains("384"));
        assert!(msg.contains("12"));
    }
}
