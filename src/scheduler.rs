//! Bounded-concurrency dispatch of part uploads
//!
//! Parts are dispatched in ascending index order, at most `concurrency` at a
//! time, as tasks in a [`JoinSet`]. Results are recorded in whatever order
//! they arrive. Before every dispatch the loop checks for a failure and for a
//! pause request; either one stops dispatch, and the loop then waits for the
//! parts already in flight to settle.

use crate::error::{UploadError, UploadResult};
use crate::failure::FailureCoordinator;
use crate::pause::PauseRegistration;
use crate::progress::ProgressReporter;
use crate::session::{RecordOutcome, UploadSession};
use crate::types::{PartDescriptor, PartResult, UploadStatus};
use crate::worker::PartUploadWorker;
use std::collections::VecDeque;
use tokio::task::JoinSet;

/// How a drive of the session ended
#[derive(Debug)]
pub(crate) enum DriveOutcome {
    /// Every part is recorded
    Drained,

    /// Dispatch stopped on a pause request and in-flight parts settled
    Paused,

    /// A part failed terminally; in-flight parts have settled
    Failed(FailureCoordinator),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Scheduler {
    concurrency: usize,
}

impl Scheduler {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub(crate) async fn run(
        &self,
        session: &UploadSession,
        worker: &PartUploadWorker,
        pause: Option<&PauseRegistration>,
        progress: Option<&ProgressReporter>,
    ) -> UploadResult<DriveOutcome> {
        if session.status().await == UploadStatus::Planning {
            session.transition(UploadStatus::InProgress).await?;
        }

        let mut pending: VecDeque<PartDescriptor> = session.pending().await.into();
        let mut in_flight: JoinSet<(u32, UploadResult<PartResult>)> = JoinSet::new();
        let mut failures = FailureCoordinator::new();
        let mut paused = false;
        let total = session.total_size();

        tracing::debug!(
            upload_id = %session.upload_id(),
            pending = pending.len(),
            concurrency = self.concurrency,
            "dispatching parts"
        );

        loop {
            while !failures.has_failed() && !paused && in_flight.len() < self.concurrency {
                if pause.is_some_and(|p| p.is_requested()) {
                    paused = true;
                    tracing::info!(
                        upload_id = %session.upload_id(),
                        in_flight = in_flight.len(),
                        "pause requested, draining in-flight parts"
                    );
                    break;
                }

                let Some(part) = pending.pop_front() else {
                    break;
                };
                if session.is_recorded(part.index).await {
                    continue;
                }

                tracing::debug!(upload_id = %session.upload_id(), part = part.index, "dispatch");
                let worker = worker.clone();
                in_flight.spawn(async move { (part.index, worker.upload(part).await) });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((index, Ok(result))) => {
                    let bytes = result.length;
                    match session.record(result).await {
                        Ok(RecordOutcome::Recorded { complete }) => {
                            worker.reader().release(index).await;
                            tracing::debug!(upload_id = %session.upload_id(), part = index, complete, "recorded part");
                            if let Some(progress) = progress {
                                let done = session.completed_bytes().await;
                                progress.part_completed(session.upload_id(), index, bytes, done, total);
                            }
                        }
                        Ok(RecordOutcome::Duplicate) => {
                            worker.reader().release(index).await;
                        }
                        Ok(RecordOutcome::Discarded) => {
                            tracing::debug!(upload_id = %session.upload_id(), part = index, "discarding result of failed upload");
                            failures.note_discarded(index);
                        }
                        Err(error) => {
                            session.mark_failed().await;
                            failures.record(Some(index), error);
                        }
                    }
                }
                Ok((index, Err(error))) => {
                    session.mark_failed().await;
                    failures.record(Some(index), error);
                }
                Err(join_error) => {
                    session.mark_failed().await;
                    failures.record(
                        None,
                        UploadError::Consistency(format!("part task did not finish: {}", join_error)),
                    );
                }
            }
        }

        if failures.has_failed() {
            return Ok(DriveOutcome::Failed(failures));
        }
        if paused || pause.is_some_and(|p| p.is_requested()) {
            return Ok(DriveOutcome::Paused);
        }
        Ok(DriveOutcome::Drained)
    }
}
