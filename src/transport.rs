//! Remote object-store seam
//!
//! The engine talks to the store only through [`Transport`]. Implementations
//! classify every failure as [`TransportError::Transient`] (worth retrying)
//! or [`TransportError::Fatal`]; timeouts are the implementation's concern and
//! surface as transient errors.
//!
//! [`TransportError::Transient`]: crate::error::TransportError::Transient
//! [`TransportError::Fatal`]: crate::error::TransportError::Fatal

use crate::error::TransportResult;
use crate::types::{CompleteOutput, CompletedPart, RemotePart, UploadMetadata};
use async_trait::async_trait;
use bytes::Bytes;

/// Multipart operations of a remote object store
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a multipart upload and return its upload id
    async fn initiate_upload(&self, key: &str, metadata: &UploadMetadata) -> TransportResult<String>;

    /// Store one part and return its entity tag
    ///
    /// `checksum` is the base64 SHA-256 of `body`.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        index: u32,
        body: Bytes,
        checksum: &str,
    ) -> TransportResult<String>;

    /// Assemble the object from `parts`, given in ascending index order
    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransportResult<CompleteOutput>;

    /// Discard the upload and every part stored under it
    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransportResult<()>;

    /// Parts the store currently holds for the upload
    async fn list_parts(&self, key: &str, upload_id: &str) -> TransportResult<Vec<RemotePart>>;
}
