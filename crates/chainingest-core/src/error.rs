//! Error types for the ingestion pipeline.

use thiserror::Error;

/// Errors that can end a run.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Invalid configuration; never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The historical and live legs never agreed on a common block.
    #[error("Join inconsistency: {reason}")]
    JoinInconsistency { reason: String },

    /// A block whose parent is neither known nor explained by the LIB seed.
    #[error("Block #{block_num} ({block_id}) does not link: parent {parent_id} is unknown")]
    UnlinkableBlock {
        block_num: u64,
        block_id: String,
        parent_id: String,
    },

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Live feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// In-flight uploads could not be confirmed during cleanup.
    #[error("Upload drain failed: {reason}")]
    UploadDrain {
        reason: String,
        /// The error that ended the run, if any.
        run_error: Option<String>,
    },

    /// The requested range was fully processed. Reported as success.
    #[error("stream completed")]
    Completed,

    #[error("Ingestion aborted: {reason}")]
    Aborted { reason: String },
}

impl IngestError {
    /// Returns `true` for the successful end-of-range marker.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns `true` if the error is a configuration fault.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// Faults reported by a block archive store.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// Fetch hiccup; the historical source retries it.
    #[error("transient archive read failure at bundle {base}: {reason}")]
    Transient { base: u64, reason: String },

    /// Unreadable or corrupt data.
    #[error("archive read failure at bundle {base}: {reason}")]
    Fatal { base: u64, reason: String },
}

impl ArchiveError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Faults reported by a live block feed.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("connection to {address} failed: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("feed connection closed")]
    Closed,

    #[error("malformed block message: {0}")]
    Decode(String),

    #[error("gave up after {attempts} reconnect attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl FeedError {
    /// Returns `true` if the live source should reconnect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. } | Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_is_distinguished() {
        assert!(IngestError::Completed.is_completed());
        assert!(!IngestError::Pipeline("boom".into()).is_completed());
    }

    #[test]
    fn archive_errors_classify() {
        let t = ArchiveError::Transient { base: 100, reason: "timeout".into() };
        let f = ArchiveError::Fatal { base: 100, reason: "corrupt".into() };
        assert!(t.is_retryable());
        assert!(!f.is_retryable());
        let wrapped: IngestError = f.into();
        assert!(wrapped.to_string().contains("corrupt"));
    }

    #[test]
    fn feed_decode_is_not_retryable() {
        assert!(FeedError::Closed.is_retryable());
        assert!(!FeedError::Decode("bad json".into()).is_retryable());
    }
}
