//! Error types for the durable topic publish pipeline.

use thiserror::Error;

use crate::types::Status;

/// Failures reported by the append-log collaborator.
#[derive(Debug, Clone, Error)]
pub enum LogError {
    #[error("append failed: {0}")]
    Append(String),

    #[error("cursor not found: {0}")]
    CursorNotFound(String),

    #[error("cursor operation failed on {cursor}: {message}")]
    Cursor { cursor: String, message: String },

    #[error("replay failed: {0}")]
    Replay(String),

    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Whether a retry of the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LogError::Append(_) => true,
            LogError::Cursor { .. } => true,
            LogError::Replay(_) => true,
            LogError::CursorNotFound(_) => false,
            LogError::Closed => false,
        }
    }
}

/// Fatal, producer-visible publish rejections.
///
/// Non-fatal outcomes (duplicate, indeterminate) are not errors; they are
/// reported as [`PublishOutcome`](crate::types::PublishOutcome) variants.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// The append-log write failed. The engine does not roll back its
    /// acceptance state; a retry of the same sequence id is reported
    /// indeterminate until the topic is reloaded or a later attempt lands.
    #[error("append failed: {0}")]
    Append(#[from] LogError),

    /// Deduplication state is mid-transition or failed; the topic is not
    /// accepting publishes. Retry after the status check settles.
    #[error("topic is not accepting publishes (dedup status {0:?})")]
    NotReady(Status),

    /// Chunk metadata is inconsistent (missing chunk id, or chunk id out of
    /// range for the declared chunk count).
    #[error("invalid chunk metadata: {0}")]
    InvalidChunk(String),

    /// The entry header could not be framed.
    #[error("invalid metadata: {0}")]
    Metadata(#[from] MetadataError),
}

/// Failures decoding an entry's metadata header or one of its recognized
/// properties.
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    #[error("entry too short: {0} bytes")]
    Truncated(usize),

    #[error("header length {header_len} exceeds entry length {entry_len}")]
    BadFraming { header_len: usize, entry_len: usize },

    #[error("malformed header: {0}")]
    Header(String),

    #[error("malformed replicated source position {value:?}: {message}")]
    SourcePosition { value: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_taxonomy() {
        assert!(LogError::Append("io".into()).is_retryable());
        assert!(!LogError::CursorNotFound("dedup".into()).is_retryable());
        assert!(!LogError::Closed.is_retryable());
    }
}
