//! Upload of a single part, with retries
//!
//! Each attempt reads the part again, hashes it and hands it to the
//! transport. Transient transport errors are retried within the part's
//! budget; fatal errors and read errors end the part immediately.

use crate::checksum::part_checksum;
use crate::error::{UploadError, UploadResult};
use crate::progress::ProgressReporter;
use crate::reader::PartReader;
use crate::recovery::BackoffStrategy;
use crate::transport::Transport;
use crate::types::{PartDescriptor, PartResult};
use std::sync::Arc;
use tokio::time::sleep;

/// Everything a part upload needs, cheap to clone into a task
#[derive(Clone)]
pub struct PartUploadWorker {
    transport: Arc<dyn Transport>,
    reader: Arc<PartReader>,
    backoff: Arc<dyn BackoffStrategy>,
    max_attempts: u32,
    key: Arc<str>,
    upload_id: Arc<str>,
    progress: Option<ProgressReporter>,
}

impl PartUploadWorker {
    pub fn new(
        transport: Arc<dyn Transport>,
        reader: Arc<PartReader>,
        backoff: Arc<dyn BackoffStrategy>,
        max_attempts: u32,
        key: &str,
        upload_id: &str,
    ) -> Self {
        Self {
            transport,
            reader,
            backoff,
            max_attempts: max_attempts.max(1),
            key: Arc::from(key),
            upload_id: Arc::from(upload_id),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn reader(&self) -> &Arc<PartReader> {
        &self.reader
    }

    /// Upload one part, retrying transient failures
    pub async fn upload(&self, part: PartDescriptor) -> UploadResult<PartResult> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let body = self.reader.read(&part).await?;
            let checksum = part_checksum(&body);
            let length = body.len() as u64;

            tracing::debug!(upload_id = %self.upload_id, part = part.index, attempt, length, "uploading part");

            match self
                .transport
                .upload_part(&self.key, &self.upload_id, part.index, body, &checksum)
                .await
            {
                Ok(etag) => return Ok(PartResult::new(part.index, etag, checksum, length)),
                Err(error) if !error.is_retryable() => {
                    return Err(UploadError::FatalPart {
                        index: part.index,
                        source: error,
                    })
                }
                Err(error) if attempt >= self.max_attempts => {
                    return Err(UploadError::RetriesExhausted {
                        index: part.index,
                        attempts: attempt,
                        source: error,
                    })
                }
                Err(error) => {
                    let delay = self.backoff.next_delay(attempt);
                    tracing::warn!(
                        upload_id = %self.upload_id,
                        part = part.index,
                        attempt,
                        ?delay,
                        %error,
                        "part upload failed, retrying"
                    );
                    if let Some(progress) = &self.progress {
                        progress.part_retried(&self.upload_id, part.index, attempt, error.to_string());
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}
