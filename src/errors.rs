//! Error classification shared across the dispatch core.
//!
//! Kinds are informational, not a replacement for `anyhow::Context` at call
//! sites: most functions still return `anyhow::Result` and attach a
//! `DispatchError` only where a caller needs to branch on the failure mode
//! (§7: a round never aborts because of a single tier's failure, a single
//! event's error never poisons its session).

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Underlying store round-trip failed; retry at the next round.
    TransientStore,
    /// Malformed ingest payload; drop with a log line.
    BadInput,
    /// Deep inference collaborator failed for one event; session continues.
    InferenceFailure,
    /// Image download failed for one event; session continues.
    DownloadFailure,
    /// Session hit its soft deadline before finishing all events.
    DeadlineExceeded,
    /// A queue operation failed; scheduler pauses the current tier only.
    QueueUnavailable,
    /// Unrecoverable; only used to carry a shutdown signal.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientStore => "transient_store",
            ErrorKind::BadInput => "bad_input",
            ErrorKind::InferenceFailure => "inference_failure",
            ErrorKind::DownloadFailure => "download_failure",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("store operation failed: {0}")]
    TransientStore(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("inference failed for event {event_id}: {reason}")]
    InferenceFailure { event_id: String, reason: String },

    #[error("download failed for event {event_id}: {reason}")]
    DownloadFailure { event_id: String, reason: String },

    #[error("session {session_id} exceeded its deadline with {processed} of {total} events processed")]
    DeadlineExceeded {
        session_id: String,
        processed: usize,
        total: usize,
    },

    #[error("queue {queue} unavailable: {reason}")]
    QueueUnavailable { queue: String, reason: String },

    #[error("fatal: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::TransientStore(_) => ErrorKind::TransientStore,
            DispatchError::BadInput(_) => ErrorKind::BadInput,
            DispatchError::InferenceFailure { .. } => ErrorKind::InferenceFailure,
            DispatchError::DownloadFailure { .. } => ErrorKind::DownloadFailure,
            DispatchError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            DispatchError::QueueUnavailable { .. } => ErrorKind::QueueUnavailable,
            DispatchError::Fatal(_) => ErrorKind::Fatal,
        }
    }
}
