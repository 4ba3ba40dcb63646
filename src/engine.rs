//! The multipart uploader
//!
//! [`MultipartUploader`] ties the pieces together: it plans the parts,
//! initiates the remote upload, drives the scheduler, and then completes,
//! pauses or aborts depending on how the drive ended. Uploads resume from a
//! [`ResumeToken`] after the token has been checked against the payload and,
//! optionally, against the parts the store still holds.

use crate::checksum::composite_checksum;
use crate::completion::CompletionAssembler;
use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::pause::{PauseController, PauseRegistration};
use crate::planner::PartPlanner;
use crate::progress::ProgressReporter;
use crate::reader::{PartReader, PayloadSource};
use crate::recovery::{with_retry, BackoffStrategy};
use crate::scheduler::{DriveOutcome, Scheduler};
use crate::session::UploadSession;
use crate::token::ResumeToken;
use crate::transport::Transport;
use crate::types::{CompleteOutput, PartResult, RemotePart, UploadMetadata, UploadStatus};
use crate::worker::PartUploadWorker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Summary of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub upload_id: String,
    /// Entity tag of the assembled object, if the store returned one
    pub etag: Option<String>,
    pub parts: u32,
    pub total_bytes: u64,
    /// Checksum over the part checksums, suffixed with the part count
    pub checksum: String,
}

/// How an upload call ended, short of an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed(UploadReceipt),
    Paused(ResumeToken),
}

impl UploadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, UploadOutcome::Completed(_))
    }

    pub fn receipt(&self) -> Option<&UploadReceipt> {
        match self {
            UploadOutcome::Completed(receipt) => Some(receipt),
            UploadOutcome::Paused(_) => None,
        }
    }

    pub fn into_token(self) -> Option<ResumeToken> {
        match self {
            UploadOutcome::Paused(token) => Some(token),
            UploadOutcome::Completed(_) => None,
        }
    }
}

/// Resumable multipart uploader over a [`Transport`]
pub struct MultipartUploader {
    transport: Arc<dyn Transport>,
    config: UploadConfig,
    backoff: Arc<dyn BackoffStrategy>,
    pause: Option<PauseController>,
    progress: Option<ProgressReporter>,
}

impl MultipartUploader {
    /// Create an uploader; fails if `config` does not validate
    pub fn new(transport: Arc<dyn Transport>, config: UploadConfig) -> UploadResult<Self> {
        config.validate()?;
        let backoff: Arc<dyn BackoffStrategy> = Arc::new(config.part_retry.backoff);
        Ok(Self {
            transport,
            config,
            backoff,
            pause: None,
            progress: None,
        })
    }

    /// Make uploads pausable through `controller`
    pub fn with_pause_controller(mut self, controller: PauseController) -> Self {
        self.pause = Some(controller);
        self
    }

    pub fn with_progress(mut self, reporter: ProgressReporter) -> Self {
        self.progress = Some(reporter);
        self
    }

    /// Replace the part retry backoff from the configuration
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffStrategy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn planner(&self) -> PartPlanner {
        PartPlanner::from_config(&self.config)
    }

    /// Upload `source` to `key`
    ///
    /// Returns a token instead of a receipt when the upload is paused
    /// through the attached [`PauseController`].
    pub async fn upload(
        &self,
        key: &str,
        source: PayloadSource,
        metadata: UploadMetadata,
    ) -> UploadResult<UploadOutcome> {
        let planner = self.planner();
        let total = source.size();
        let plan = planner.plan(total)?;
        let part_size = planner.effective_part_size(total)?;

        let registration = self.pause.as_ref().map(PauseController::register);

        let upload_id = with_retry(
            self.config.part_retry.max_attempts,
            self.backoff.as_ref(),
            "initiate_upload",
            || self.transport.initiate_upload(key, &metadata),
        )
        .await
        .map_err(|e| UploadError::Transport(e.error))?;

        tracing::info!(
            upload_id = %upload_id,
            key,
            total_bytes = total,
            parts = plan.len(),
            part_size,
            "initiated multipart upload"
        );

        let session = UploadSession::new(upload_id, key, part_size, plan);
        self.drive(session, source, registration).await
    }

    /// Continue a paused upload
    ///
    /// `source` must be the same payload the token was produced from. A
    /// mismatching payload is rejected before any remote call is made.
    pub async fn resume(
        &self,
        token: &ResumeToken,
        source: PayloadSource,
    ) -> UploadResult<UploadOutcome> {
        token.validate()?;
        let plan = self.planner().plan(source.size())?;
        token.verify_plan(&plan)?;

        let registration = self.pause.as_ref().map(PauseController::register);

        let mut completed = token.completed_parts.clone();
        if self.config.validate_remote_on_resume {
            let remote = self.remote_parts(token).await?;
            completed.retain(|result| still_stored(token, result, &remote));
        }

        tracing::info!(
            upload_id = %token.upload_id,
            key = %token.key,
            completed = completed.len(),
            remaining = token.parts.len() - completed.len(),
            "resuming multipart upload"
        );

        let session = UploadSession::resumed(token, completed)?;
        self.drive(session, source, registration).await
    }

    /// Retry the completion call of an upload whose parts are all stored
    pub async fn complete(&self, token: &ResumeToken) -> UploadResult<UploadReceipt> {
        token.validate()?;
        let session = UploadSession::resumed(token, token.completed_parts.clone())?;
        session.transition(UploadStatus::InProgress).await?;

        let output = CompletionAssembler::new(self.transport.as_ref(), self.config.completion_retry)
            .complete(&session)
            .await?;
        Ok(receipt(&session, output).await)
    }

    /// Abandon a paused upload and release its stored parts
    pub async fn abort(&self, token: &ResumeToken) -> UploadResult<()> {
        with_retry(
            self.config.part_retry.max_attempts,
            self.backoff.as_ref(),
            "abort_upload",
            || self.transport.abort_upload(&token.key, &token.upload_id),
        )
        .await
        .map_err(|e| UploadError::Transport(e.error))?;

        tracing::info!(upload_id = %token.upload_id, "aborted paused upload");
        Ok(())
    }

    async fn remote_parts(&self, token: &ResumeToken) -> UploadResult<HashMap<u32, RemotePart>> {
        let listed = with_retry(
            self.config.part_retry.max_attempts,
            self.backoff.as_ref(),
            "list_parts",
            || self.transport.list_parts(&token.key, &token.upload_id),
        )
        .await
        .map_err(|e| match e.error.code() {
            Some("NoSuchUpload") => UploadError::StaleToken {
                upload_id: token.upload_id.clone(),
                reason: e.error.to_string(),
            },
            _ => UploadError::Transport(e.error),
        })?;

        Ok(listed.into_iter().map(|part| (part.index, part)).collect())
    }

    async fn drive(
        &self,
        session: UploadSession,
        source: PayloadSource,
        registration: Option<PauseRegistration>,
    ) -> UploadResult<UploadOutcome> {
        let started = Instant::now();
        let reader = Arc::new(PartReader::new(source, session.plan()));

        let already_stored = session.completed_results().await;
        for result in &already_stored {
            reader.skip(result.index).await;
        }

        if let Some(progress) = &self.progress {
            progress.upload_started(
                session.upload_id(),
                session.key(),
                session.total_size(),
                session.plan().len() as u32,
                already_stored.len() as u32,
            );
        }

        let worker = PartUploadWorker::new(
            self.transport.clone(),
            reader,
            self.backoff.clone(),
            self.config.part_retry.max_attempts,
            session.key(),
            session.upload_id(),
        )
        .with_progress(self.progress.clone());

        let outcome = Scheduler::new(self.config.concurrency)
            .run(&session, &worker, registration.as_ref(), self.progress.as_ref())
            .await;

        match outcome {
            Ok(DriveOutcome::Paused) => {
                session.transition(UploadStatus::Paused).await?;
                let token = session.resume_token().await;

                tracing::info!(
                    upload_id = %token.upload_id,
                    completed = token.completed_parts.len(),
                    remaining = token.parts.len() - token.completed_parts.len(),
                    "upload paused"
                );
                if let Some(progress) = &self.progress {
                    progress.upload_paused(
                        &token.upload_id,
                        token.completed_parts.len() as u32,
                        token.bytes_completed(),
                    );
                }
                if let Some(registration) = &registration {
                    registration.settle_paused(token.clone());
                }
                Ok(UploadOutcome::Paused(token))
            }
            Ok(DriveOutcome::Failed(failures)) => {
                let failed_parts = failures.failed_parts();
                let error = failures.abort(&session, self.transport.as_ref()).await;
                if let Some(progress) = &self.progress {
                    progress.upload_failed(session.upload_id(), error.to_string(), failed_parts);
                }
                settle_finished(registration.as_ref());
                Err(error)
            }
            Ok(DriveOutcome::Drained) => {
                let completed =
                    CompletionAssembler::new(self.transport.as_ref(), self.config.completion_retry)
                        .complete(&session)
                        .await;
                settle_finished(registration.as_ref());

                let receipt = receipt(&session, completed?).await;
                if let Some(progress) = &self.progress {
                    progress.upload_completed(&receipt.upload_id, receipt.total_bytes, started.elapsed());
                }
                Ok(UploadOutcome::Completed(receipt))
            }
            Err(error) => {
                settle_finished(registration.as_ref());
                Err(error)
            }
        }
    }
}

fn settle_finished(registration: Option<&PauseRegistration>) {
    if let Some(registration) = registration {
        registration.settle_finished();
    }
}

/// Whether a part recorded in `token` is still stored with the same content
fn still_stored(token: &ResumeToken, result: &PartResult, remote: &HashMap<u32, RemotePart>) -> bool {
    match remote.get(&result.index) {
        Some(part) if part.etag == result.etag && part.length == result.length => true,
        Some(_) => {
            tracing::warn!(upload_id = %token.upload_id, part = result.index, "stored part changed remotely, re-uploading");
            false
        }
        None => {
            tracing::warn!(upload_id = %token.upload_id, part = result.index, "stored part missing remotely, re-uploading");
            false
        }
    }
}

async fn receipt(session: &UploadSession, output: CompleteOutput) -> UploadReceipt {
    let results = session.completed_results().await;
    UploadReceipt {
        key: session.key().to_string(),
        upload_id: session.upload_id().to_string(),
        etag: output.etag,
        parts: results.len() as u32,
        total_bytes: session.total_size(),
        checksum: composite_checksum(&results),
    }
}

impl std::fmt::Debug for MultipartUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipartUploader")
            .field("config", &self.config)
            .field("pausable", &self.pause.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}
