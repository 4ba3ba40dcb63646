//! [`Transport`] over the AWS SDK for S3
//!
//! Every part carries a SHA-256 checksum that S3 verifies on receipt.
//! SDK failures are classified as transient (timeouts, dispatch and response
//! failures, throttling and 5xx service errors) or fatal (everything else).

use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;
use crate::types::{CompleteOutput, CompletedPart, RemotePart, UploadMetadata};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, CompletedMultipartUpload};
use aws_sdk_s3::Client;
use bytes::Bytes;

/// Service error codes worth retrying
const TRANSIENT_CODES: &[&str] = &[
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "SlowDown",
    "InternalError",
    "ServiceUnavailable",
    "Throttling",
    "ThrottlingException",
];

/// Multipart uploads into one S3 bucket
#[derive(Debug, Clone)]
pub struct S3Transport {
    client: Client,
    bucket: String,
}

impl S3Transport {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Client configured from the environment (credentials chain, region)
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

fn part_number(index: u32) -> TransportResult<i32> {
    i32::try_from(index).map_err(|_| {
        TransportError::fatal("InvalidArgument", format!("part number {} out of range", index))
    })
}

/// Whether a service error with this code and HTTP status may succeed on retry
fn is_transient(code: &str, status: u16) -> bool {
    status >= 500 || status == 429 || TRANSIENT_CODES.contains(&code)
}

fn classify<E>(operation: &str, error: SdkError<E>) -> TransportError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match error {
        SdkError::TimeoutError(_) => TransportError::transient(format!("{}: timed out", operation)),
        SdkError::DispatchFailure(e) => {
            TransportError::transient(format!("{}: dispatch failure: {:?}", operation, e))
        }
        SdkError::ResponseError(e) => {
            TransportError::transient(format!("{}: response error: {:?}", operation, e))
        }
        SdkError::ServiceError(context) => {
            let status = context.raw().status().as_u16();
            let service = context.err();
            let code = service.code().unwrap_or("Unknown").to_string();
            let message = service
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} failed with HTTP {}", operation, status));

            if is_transient(&code, status) {
                TransportError::transient(format!("{}: {} ({})", operation, message, code))
            } else {
                TransportError::fatal(code, message)
            }
        }
        other => TransportError::fatal("SdkError", format!("{}: {:?}", operation, other)),
    }
}

#[async_trait]
impl Transport for S3Transport {
    async fn initiate_upload(&self, key: &str, metadata: &UploadMetadata) -> TransportResult<String> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .checksum_algorithm(ChecksumAlgorithm::Sha256);

        if let Some(content_type) = &metadata.content_type {
            request = request.content_type(content_type);
        }
        if !metadata.user_metadata.is_empty() {
            request = request.set_metadata(Some(metadata.user_metadata.clone()));
        }

        let response = request
            .send()
            .await
            .map_err(|e| classify("create_multipart_upload", e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| TransportError::fatal("MissingUploadId", "no upload id returned"))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        index: u32,
        body: Bytes,
        checksum: &str,
    ) -> TransportResult<String> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number(index)?)
            .checksum_sha256(checksum)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("upload_part", e))?;

        response
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| TransportError::fatal("MissingETag", format!("no ETag returned for part {}", index)))
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransportResult<CompleteOutput> {
        let mut completed = Vec::with_capacity(parts.len());
        for part in parts {
            completed.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number(part.index)?)
                    .e_tag(&part.etag)
                    .checksum_sha256(&part.checksum)
                    .build(),
            );
        }

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("complete_multipart_upload", e))?;

        Ok(CompleteOutput {
            etag: response.e_tag().map(str::to_string),
        })
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> TransportResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| classify("abort_multipart_upload", e))?;
        Ok(())
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> TransportResult<Vec<RemotePart>> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let response = self
                .client
                .list_parts()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .set_part_number_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("list_parts", e))?;

            parts.extend(response.parts().iter().filter_map(|p| {
                Some(RemotePart {
                    index: u32::try_from(p.part_number()?).ok()?,
                    etag: p.e_tag()?.to_string(),
                    length: u64::try_from(p.size()?).ok()?,
                })
            }));

            match (response.is_truncated(), response.next_part_number_marker()) {
                (Some(true), Some(next)) => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient("SlowDown", 503));
        assert!(is_transient("InternalError", 500));
        assert!(is_transient("Unknown", 429));
        assert!(is_transient("RequestTimeout", 400));
        assert!(!is_transient("NoSuchUpload", 404));
        assert!(!is_transient("AccessDenied", 403));
        assert!(!is_transient("InvalidPart", 400));
    }

    #[test]
    fn test_part_number_range() {
        assert_eq!(part_number(10_000).unwrap(), 10_000);
        assert!(part_number(u32::MAX).is_err());
    }
}
