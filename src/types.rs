//! Type definitions shared across the upload engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One contiguous byte range of the payload, uploaded as an independent part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartDescriptor {
    /// Part number (1-indexed, contiguous)
    pub index: u32,

    /// Byte offset of the part within the payload
    #[serde(rename = "byteOffset")]
    pub offset: u64,

    /// Length of the part in bytes
    #[serde(rename = "byteLength")]
    pub length: u64,
}

impl PartDescriptor {
    pub fn new(index: u32, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
        }
    }

    /// Exclusive end offset
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Acknowledgement of a stored part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    /// Part number (1-indexed)
    pub index: u32,

    /// Entity tag assigned by the remote store
    #[serde(rename = "eTag")]
    pub etag: String,

    /// Base64 SHA-256 of the part body
    pub checksum: String,

    /// Bytes actually sent
    pub length: u64,
}

impl PartResult {
    pub fn new(index: u32, etag: impl Into<String>, checksum: impl Into<String>, length: u64) -> Self {
        Self {
            index,
            etag: etag.into(),
            checksum: checksum.into(),
            length,
        }
    }
}

/// Entry of the completion call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub index: u32,
    pub etag: String,
    pub checksum: String,
}

impl From<&PartResult> for CompletedPart {
    fn from(result: &PartResult) -> Self {
        Self {
            index: result.index,
            etag: result.etag.clone(),
            checksum: result.checksum.clone(),
        }
    }
}

/// A part as reported by the remote store's list-parts call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePart {
    pub index: u32,
    pub etag: String,
    pub length: u64,
}

/// Object metadata sent when a multipart upload is initiated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// Content type for the assembled object
    pub content_type: Option<String>,

    /// User-defined metadata key=value pairs
    pub user_metadata: HashMap<String, String>,
}

impl UploadMetadata {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }
}

/// Response of a successful completion call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteOutput {
    /// Entity tag of the assembled object, if the store returns one
    pub etag: Option<String>,
}

/// Lifecycle of one upload session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UploadStatus {
    Planning,
    InProgress,
    Paused,
    Completing,
    Completed,
    Aborted,
    Failed,
}

impl UploadStatus {
    /// Whether `next` is a legal successor of this status
    ///
    /// `Paused` is terminal for a session instance; resuming creates a new
    /// session. A session whose completion call failed stays `Completing`.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Planning, InProgress)
                | (Planning, Failed)
                | (InProgress, Paused)
                | (InProgress, Completing)
                | (InProgress, Failed)
                | (Completing, Completed)
                | (Failed, Aborted)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UploadStatus::Planning => "PLANNING",
            UploadStatus::InProgress => "IN_PROGRESS",
            UploadStatus::Paused => "PAUSED",
            UploadStatus::Completing => "COMPLETING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Aborted => "ABORTED",
            UploadStatus::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}
