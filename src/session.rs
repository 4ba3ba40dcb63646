//! Shared state of one upload session
//!
//! Status and the completion records live behind a single lock, so recording
//! a part and checking whether the session is now complete happen in one
//! critical section.

use crate::checksum::plan_checksum;
use crate::error::{UploadError, UploadResult};
use crate::token::ResumeToken;
use crate::types::{CompletedPart, PartDescriptor, PartResult, UploadStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of recording a part result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First record for this part; `complete` is true once every part is recorded
    Recorded { complete: bool },

    /// Same content was already recorded for this part
    Duplicate,

    /// The session failed; the result is not recorded
    Discarded,
}

#[derive(Debug)]
struct SessionState {
    status: UploadStatus,
    completed: BTreeMap<u32, PartResult>,
}

/// One remote multipart upload and its progress
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    key: String,
    part_size: u64,
    plan: Arc<[PartDescriptor]>,
    plan_checksum: String,
    state: Mutex<SessionState>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        key: impl Into<String>,
        part_size: u64,
        plan: Vec<PartDescriptor>,
    ) -> Self {
        let plan_checksum = plan_checksum(&plan);
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            part_size,
            plan: plan.into(),
            plan_checksum,
            state: Mutex::new(SessionState {
                status: UploadStatus::Planning,
                completed: BTreeMap::new(),
            }),
        }
    }

    /// Session continuing from a resume token, seeded with its stored parts
    pub fn resumed(token: &ResumeToken, completed: Vec<PartResult>) -> UploadResult<Self> {
        let mut session = Self::new(
            token.upload_id.clone(),
            token.key.clone(),
            token.part_size,
            token.parts.clone(),
        );

        let mut seeded = BTreeMap::new();
        for result in completed {
            session.check_against_plan(&result)?;
            let index = result.index;
            if seeded.insert(index, result).is_some() {
                return Err(UploadError::Consistency(format!("part {} seeded twice", index)));
            }
        }
        session.state.get_mut().completed = seeded;

        Ok(session)
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn plan(&self) -> &[PartDescriptor] {
        &self.plan
    }

    pub fn plan_checksum(&self) -> &str {
        &self.plan_checksum
    }

    pub fn total_size(&self) -> u64 {
        self.plan.iter().map(|p| p.length).sum()
    }

    pub async fn status(&self) -> UploadStatus {
        self.state.lock().await.status
    }

    /// Move to `next`, rejecting transitions outside the state machine
    pub async fn transition(&self, next: UploadStatus) -> UploadResult<()> {
        let mut state = self.state.lock().await;
        if !state.status.can_transition_to(next) {
            return Err(UploadError::Consistency(format!(
                "illegal status transition {} -> {} for upload {}",
                state.status, next, self.upload_id
            )));
        }
        tracing::debug!(upload_id = %self.upload_id, from = %state.status, to = %next, "status change");
        state.status = next;
        Ok(())
    }

    /// Move to `Failed` unless already there; returns whether this call did it
    pub async fn mark_failed(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.status.can_transition_to(UploadStatus::Failed) {
            state.status = UploadStatus::Failed;
            true
        } else {
            false
        }
    }

    /// Record a stored part and report whether every part is now recorded
    pub async fn record(&self, result: PartResult) -> UploadResult<RecordOutcome> {
        let part = self.check_against_plan(&result)?;
        let mut state = self.state.lock().await;

        match state.status {
            UploadStatus::InProgress => {}
            UploadStatus::Failed | UploadStatus::Aborted => return Ok(RecordOutcome::Discarded),
            other => {
                return Err(UploadError::Consistency(format!(
                    "cannot record part {} while upload is {}",
                    part.index, other
                )))
            }
        }

        if let Some(existing) = state.completed.get(&result.index) {
            if existing.etag == result.etag && existing.checksum == result.checksum {
                return Ok(RecordOutcome::Duplicate);
            }
            return Err(UploadError::Consistency(format!(
                "part {} already recorded with different content",
                result.index
            )));
        }

        state.completed.insert(result.index, result);
        Ok(RecordOutcome::Recorded {
            complete: state.completed.len() == self.plan.len(),
        })
    }

    fn check_against_plan(&self, result: &PartResult) -> UploadResult<PartDescriptor> {
        let part = self
            .plan
            .iter()
            .find(|p| p.index == result.index)
            .copied()
            .ok_or_else(|| {
                UploadError::Consistency(format!("part {} is not in the plan", result.index))
            })?;
        if part.length != result.length {
            return Err(UploadError::Consistency(format!(
                "part {} sent {} bytes but the plan has {}",
                part.index, result.length, part.length
            )));
        }
        Ok(part)
    }

    pub async fn is_recorded(&self, index: u32) -> bool {
        self.state.lock().await.completed.contains_key(&index)
    }

    /// Parts without a completion record, ascending
    pub async fn pending(&self) -> Vec<PartDescriptor> {
        let state = self.state.lock().await;
        self.plan
            .iter()
            .filter(|p| !state.completed.contains_key(&p.index))
            .copied()
            .collect()
    }

    pub async fn completed_results(&self) -> Vec<PartResult> {
        self.state.lock().await.completed.values().cloned().collect()
    }

    pub async fn completed_bytes(&self) -> u64 {
        self.state.lock().await.completed.values().map(|r| r.length).sum()
    }

    /// Freeze the completion records and move to `Completing`
    ///
    /// Fails without changing status if any part is missing.
    pub async fn begin_completion(&self) -> UploadResult<Vec<CompletedPart>> {
        let mut state = self.state.lock().await;

        if state.status != UploadStatus::InProgress {
            return Err(UploadError::Consistency(format!(
                "cannot complete upload {} while it is {}",
                self.upload_id, state.status
            )));
        }

        let missing: Vec<u32> = self
            .plan
            .iter()
            .map(|p| p.index)
            .filter(|i| !state.completed.contains_key(i))
            .collect();
        if !missing.is_empty() {
            return Err(UploadError::Completion {
                upload_id: self.upload_id.clone(),
                attempts: 0,
                reason: format!("parts {:?} have no completion record", missing),
                token: None,
            });
        }

        state.status = UploadStatus::Completing;
        Ok(state.completed.values().map(CompletedPart::from).collect())
    }

    /// Snapshot of the session as a resume token
    pub async fn resume_token(&self) -> ResumeToken {
        let completed = self.completed_results().await;
        ResumeToken::new(
            self.upload_id.clone(),
            self.key.clone(),
            self.part_size,
            self.plan.to_vec(),
            completed,
        )
    }
}
