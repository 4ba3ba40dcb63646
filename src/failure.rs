//! Terminal failure handling
//!
//! The first terminal part failure fails the session. The scheduler stops
//! dispatching, lets in-flight parts settle, and then the coordinator issues
//! exactly one abort. A failed abort is attached to the original cause.

use crate::error::{AbortError, AbortOutcome, UploadError, UploadFailure};
use crate::session::UploadSession;
use crate::transport::Transport;
use crate::types::UploadStatus;

/// Collects part failures of one session and drives the abort
#[derive(Debug, Default)]
pub struct FailureCoordinator {
    failures: Vec<(Option<u32>, UploadError)>,
    discarded: Vec<u32>,
}

impl FailureCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a terminal failure; `index` is `None` when no part can be named
    pub fn record(&mut self, index: Option<u32>, error: UploadError) {
        if self.failures.is_empty() {
            tracing::error!(part = ?index, %error, "first terminal failure, stopping dispatch");
        } else {
            tracing::warn!(part = ?index, %error, "additional failure while draining");
        }
        self.failures.push((index, error));
    }

    /// A part that succeeded after the failure and was not recorded
    pub fn note_discarded(&mut self, index: u32) {
        self.discarded.push(index);
    }

    pub fn has_failed(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Every failed part index, ascending
    pub fn failed_parts(&self) -> Vec<u32> {
        let mut parts: Vec<u32> = self.failures.iter().filter_map(|(i, _)| *i).collect();
        parts.sort_unstable();
        parts.dedup();
        parts
    }

    /// Abort the remote upload once and build the terminal error
    ///
    /// Call after every in-flight part has settled.
    pub async fn abort(self, session: &UploadSession, transport: &dyn Transport) -> UploadError {
        session.mark_failed().await;

        let failed_parts = self.failed_parts();
        let mut failures = self.failures.into_iter().map(|(_, e)| e);
        let cause = match failures.next() {
            Some(cause) => cause,
            None => UploadError::Consistency("upload aborted without a recorded failure".to_string()),
        };
        let additional: Vec<UploadError> = failures.collect();

        let upload_id = session.upload_id().to_string();
        let abort = match transport.abort_upload(session.key(), &upload_id).await {
            Ok(()) => {
                tracing::info!(upload_id = %upload_id, "aborted remote upload");
                AbortOutcome::Succeeded
            }
            Err(source) => {
                tracing::warn!(upload_id = %upload_id, error = %source, "abort failed, parts may be orphaned");
                AbortOutcome::Failed(AbortError {
                    upload_id: upload_id.clone(),
                    source,
                })
            }
        };

        if abort.succeeded() {
            if let Err(e) = session.transition(UploadStatus::Aborted).await {
                tracing::warn!(upload_id = %upload_id, error = %e, "could not mark session aborted");
            }
        }

        UploadError::Failed(Box::new(UploadFailure {
            upload_id,
            key: session.key().to_string(),
            failed_parts,
            cause,
            additional,
            discarded_parts: self.discarded,
            abort,
            final_status: session.status().await,
        }))
    }
}
