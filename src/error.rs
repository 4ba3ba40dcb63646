//! Error types for multipart uploads

use std::fmt;
use std::io;
use thiserror::Error;

use crate::token::ResumeToken;
use crate::types::UploadStatus;

/// Result type alias for upload operations
pub type UploadResult<T> = Result<T, UploadError>;

/// Result type alias for calls made through a [`Transport`](crate::transport::Transport)
pub type TransportResult<T> = Result<T, TransportError>;

/// Failure reported by the transport collaborator for a single remote call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network blip, throttling, timeout or a 5xx-class remote error
    #[error("transient transport error: {0}")]
    Transient(String),

    /// The remote store rejected the request outright
    #[error("remote store rejected request ({code}): {message}")]
    Fatal { code: String, message: String },
}

impl TransportError {
    /// Create a transient (retryable) error
    pub fn transient(message: impl Into<String>) -> Self {
        TransportError::Transient(message.into())
    }

    /// Create a fatal (non-retryable) error with a remote error code
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        TransportError::Fatal {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }

    /// Remote error code, if the store supplied one
    pub fn code(&self) -> Option<&str> {
        match self {
            TransportError::Fatal { code, .. } => Some(code),
            TransportError::Transient(_) => None,
        }
    }
}

/// Secondary failure while aborting a remote upload after a fatal error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("abort of upload {upload_id} failed: {source}")]
pub struct AbortError {
    pub upload_id: String,
    pub source: TransportError,
}

/// What happened to the remote upload after a terminal failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortOutcome {
    /// The remote upload was aborted and its storage released
    Succeeded,

    /// Abort failed; uploaded parts may be orphaned on the remote store
    Failed(AbortError),
}

impl AbortOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, AbortOutcome::Succeeded)
    }
}

/// Errors that can occur while planning, uploading, pausing or resuming
#[derive(Error, Debug)]
pub enum UploadError {
    /// Bad payload size or part-size configuration
    #[error("planning error: {0}")]
    Planning(String),

    /// A configuration field failed validation
    #[error("invalid configuration for `{field}`: {reason}")]
    Config { field: &'static str, reason: String },

    /// The remote store rejected a part outright
    #[error("part {index} rejected by remote store: {source}")]
    FatalPart { index: u32, source: TransportError },

    /// A part kept failing transiently until its retry budget ran out
    #[error("part {index} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        source: TransportError,
    },

    /// A non-seekable source was asked for bytes it already discarded
    #[error("part {index} requires re-reading bytes that the non-seekable source already discarded")]
    NonResumableSource { index: u32 },

    /// Reading the payload for a part failed
    #[error("failed to read part {index}: {source}")]
    PartRead { index: u32, source: io::Error },

    /// The completion call failed after its own retry budget
    ///
    /// When every part was stored, `token` holds them so completion can be
    /// retried without uploading anything again.
    #[error("completion of upload {upload_id} failed after {attempts} attempts: {reason}")]
    Completion {
        upload_id: String,
        attempts: u32,
        reason: String,
        token: Option<Box<ResumeToken>>,
    },

    /// Resume token was produced for a different payload or part-size policy
    #[error("resume token does not match payload: expected plan checksum {expected}, got {actual}")]
    TokenMismatch { expected: String, actual: String },

    /// Remote state no longer matches the resume token
    #[error("resume token for upload {upload_id} is stale: {reason}")]
    StaleToken { upload_id: String, reason: String },

    /// Session invariant violated (conflicting part content, bad transition)
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Remote call outside of part upload failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Token or config (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Terminal failure of an upload, with abort outcome attached
    #[error(transparent)]
    Failed(Box<UploadFailure>),
}

impl UploadError {
    /// Part index this error is about, if any
    pub fn part_index(&self) -> Option<u32> {
        match self {
            UploadError::FatalPart { index, .. }
            | UploadError::RetriesExhausted { index, .. }
            | UploadError::NonResumableSource { index }
            | UploadError::PartRead { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Whether retrying the whole operation could help
    pub fn is_retryable(&self) -> bool {
        match self {
            UploadError::Transport(e) => e.is_retryable(),
            UploadError::RetriesExhausted { .. } => true,
            UploadError::Completion { .. } => true,
            UploadError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }

    /// Snapshot to retry from, if the error carries one
    pub fn resume_token(&self) -> Option<&ResumeToken> {
        match self {
            UploadError::Completion { token, .. } => token.as_deref(),
            _ => None,
        }
    }

    /// Terminal failure details, if this is a failed upload
    pub fn as_failure(&self) -> Option<&UploadFailure> {
        match self {
            UploadError::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::Serialization(err.to_string())
    }
}

/// Terminal failure of a multipart upload
///
/// Always carries the original cause; a failed abort is attached next to it
/// rather than replacing it.
#[derive(Debug)]
pub struct UploadFailure {
    pub upload_id: String,
    pub key: String,

    /// Every part index that failed terminally, ascending
    pub failed_parts: Vec<u32>,

    /// First terminal failure
    pub cause: UploadError,

    /// Failures that settled after the first one
    pub additional: Vec<UploadError>,

    /// Parts that succeeded after the failure and were not recorded
    pub discarded_parts: Vec<u32>,

    pub abort: AbortOutcome,

    /// Session status once cleanup finished
    pub final_status: UploadStatus,
}

impl UploadFailure {
    pub fn abort_succeeded(&self) -> bool {
        self.abort.succeeded()
    }
}

impl fmt::Display for UploadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload {} of {} failed", self.upload_id, self.key)?;
        if !self.failed_parts.is_empty() {
            write!(f, " at part(s) {:?}", self.failed_parts)?;
        }
        write!(f, ": {}", self.cause)?;
        match &self.abort {
            AbortOutcome::Succeeded => write!(f, "; remote upload aborted"),
            AbortOutcome::Failed(e) => write!(f, "; {} (parts may be orphaned)", e),
        }
    }
}

impl std::error::Error for UploadFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_classification() {
        assert!(TransportError::transient("connection reset").is_retryable());
        assert!(!TransportError::fatal("BadDigest", "checksum mismatch").is_retryable());
        assert_eq!(
            TransportError::fatal("InvalidPart", "nope").code(),
            Some("InvalidPart")
        );
        assert_eq!(TransportError::transient("slow down").code(), None);
    }

    #[test]
    fn test_part_index() {
        let err = UploadError::FatalPart {
            index: 4,
            source: TransportError::fatal("InvalidRequest", "bad"),
        };
        assert_eq!(err.part_index(), Some(4));
        assert_eq!(UploadError::NonResumableSource { index: 2 }.part_index(), Some(2));
        assert_eq!(UploadError::Planning("x".to_string()).part_index(), None);
    }

    #[test]
    fn test_is_retryable() {
        assert!(UploadError::Transport(TransportError::transient("503")).is_retryable());
        assert!(!UploadError::TokenMismatch {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .is_retryable());
        assert!(UploadError::Io(io::Error::new(io::ErrorKind::TimedOut, "t")).is_retryable());
        assert!(!UploadError::Io(io::Error::new(io::ErrorKind::NotFound, "n")).is_retryable());
    }

    #[test]
    fn test_failure_display_keeps_cause_and_abort_error() {
        let failure = UploadFailure {
            upload_id: "u-1".to_string(),
            key: "big.bin".to_string(),
            failed_parts: vec![2],
            cause: UploadError::FatalPart {
                index: 2,
                source: TransportError::fatal("InvalidRequest", "bad part"),
            },
            additional: Vec::new(),
            discarded_parts: Vec::new(),
            abort: AbortOutcome::Failed(AbortError {
                upload_id: "u-1".to_string(),
                source: TransportError::transient("connection refused"),
            }),
            final_status: UploadStatus::Failed,
        };

        let msg = UploadError::Failed(Box::new(failure)).to_string();
        assert!(msg.contains("part(s) [2]"));
        assert!(msg.contains("bad part"));
        assert!(msg.contains("abort of upload u-1 failed"));
    }
}
