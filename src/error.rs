//! Error taxonomy for the audio ingestion core.
//!
//! Top-level [`IngestError`] wraps per-subsystem error enums via `#[from]`.
//! Each variant carries a stable `error_code()` for log correlation.

use thiserror::Error;

/// Top-level error type returned from public crate APIs.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A connection string or registration request failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// Lookup by ID or connection string found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted against an invalid supervisor state.
    #[error("state error: {0}")]
    State(String),

    /// An analysis-ring write could not be completed after retrying.
    #[error("ring full: {0}")]
    RingFull(String),

    /// Underlying IO failure (process spawn, pipe read, ...).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A blocking operation exceeded its deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled by a stop signal.
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    /// Stable code for log correlation, independent of the Display message.
    pub fn error_code(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "ING_VALIDATION",
            IngestError::NotFound(_) => "ING_NOT_FOUND",
            IngestError::State(_) => "ING_STATE",
            IngestError::RingFull(_) => "ING_RING_FULL",
            IngestError::Io(_) => "ING_IO",
            IngestError::Timeout(_) => "ING_TIMEOUT",
            IngestError::Cancelled => "ING_CANCELLED",
        }
    }

    /// Whether this error should be surfaced to a caller as fatal, versus
    /// absorbed internally (cancellation propagates silently).
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, IngestError::Cancelled)
    }
}

/// Sentinel message used for "source not found" errors raised by the
/// registry, so callers can match on it without caring which lookup path
/// produced it.
pub const SOURCE_NOT_FOUND: &str = "source not found";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn error_codes_unique() {
        let errors: Vec<IngestError> = vec![
            IngestError::Validation("x".into()),
            IngestError::NotFound("x".into()),
            IngestError::State("x".into()),
            IngestError::RingFull("x".into()),
            IngestError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            IngestError::Timeout("x".into()),
            IngestError::Cancelled,
        ];
        let codes: HashSet<_> = errors.iter().map(|e| e.error_code()).collect();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn cancelled_is_not_user_visible() {
        assert!(!IngestError::Cancelled.is_user_visible());
        assert!(IngestError::Timeout("x".into()).is_user_visible());
    }
}
