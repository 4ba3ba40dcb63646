//! Resume tokens
//!
//! A [`ResumeToken`] is the durable snapshot emitted when an upload pauses:
//! the remote upload id, the full part plan, the parts already stored and a
//! checksum over the plan. It is only valid against a payload that produces
//! the same plan, which is checked before any remote call is made.

use crate::checksum::plan_checksum;
use crate::error::{UploadError, UploadResult};
use crate::types::{PartDescriptor, PartResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Serializable snapshot of a paused upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeToken {
    pub upload_id: String,
    pub key: String,
    pub part_plan_checksum: String,
    pub total_size: u64,
    /// Part size the plan was built with, after any adjustment for the part limit
    pub part_size: u64,
    pub parts: Vec<PartDescriptor>,
    /// Stored parts, ascending by index
    pub completed_parts: Vec<PartResult>,
}

impl ResumeToken {
    pub fn new(
        upload_id: impl Into<String>,
        key: impl Into<String>,
        part_size: u64,
        parts: Vec<PartDescriptor>,
        mut completed_parts: Vec<PartResult>,
    ) -> Self {
        completed_parts.sort_by_key(|r| r.index);
        Self {
            upload_id: upload_id.into(),
            key: key.into(),
            part_plan_checksum: plan_checksum(&parts),
            total_size: parts.iter().map(|p| p.length).sum(),
            part_size,
            parts,
            completed_parts,
        }
    }

    /// Check that `plan` is the plan this token was produced for
    pub fn verify_plan(&self, plan: &[PartDescriptor]) -> UploadResult<()> {
        let actual = plan_checksum(plan);
        if actual != self.part_plan_checksum {
            return Err(UploadError::TokenMismatch {
                expected: self.part_plan_checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Check the token's internal consistency
    pub fn validate(&self) -> UploadResult<()> {
        if self.upload_id.is_empty() {
            return Err(UploadError::Consistency("resume token has no upload id".to_string()));
        }

        let actual = plan_checksum(&self.parts);
        if actual != self.part_plan_checksum {
            return Err(UploadError::TokenMismatch {
                expected: self.part_plan_checksum.clone(),
                actual,
            });
        }

        let planned: u64 = self.parts.iter().map(|p| p.length).sum();
        if planned != self.total_size {
            return Err(UploadError::Consistency(format!(
                "resume token parts cover {} bytes but total size is {}",
                planned, self.total_size
            )));
        }

        let mut seen = BTreeSet::new();
        for result in &self.completed_parts {
            let part = self.part(result.index).ok_or_else(|| {
                UploadError::Consistency(format!(
                    "resume token records unknown part {}",
                    result.index
                ))
            })?;
            if part.length != result.length {
                return Err(UploadError::Consistency(format!(
                    "resume token records {} bytes for part {} of {} bytes",
                    result.length, result.index, part.length
                )));
            }
            if !seen.insert(result.index) {
                return Err(UploadError::Consistency(format!(
                    "resume token records part {} twice",
                    result.index
                )));
            }
        }

        Ok(())
    }

    fn part(&self, index: u32) -> Option<&PartDescriptor> {
        self.parts.iter().find(|p| p.index == index)
    }

    /// Bytes already stored remotely
    pub fn bytes_completed(&self) -> u64 {
        self.completed_parts.iter().map(|r| r.length).sum()
    }

    /// Parts that still need uploading, ascending
    pub fn remaining_parts(&self) -> Vec<PartDescriptor> {
        let done: BTreeSet<u32> = self.completed_parts.iter().map(|r| r.index).collect();
        self.parts
            .iter()
            .filter(|p| !done.contains(&p.index))
            .copied()
            .collect()
    }

    pub fn has_progress(&self) -> bool {
        !self.completed_parts.is_empty()
    }

    pub fn to_json(&self) -> UploadResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse and validate a token
    pub fn from_json(json: &str) -> UploadResult<Self> {
        let token: ResumeToken = serde_json::from_str(json)?;
        token.validate()?;
        Ok(token)
    }

    /// Write the token to `path`, replacing any previous token atomically
    pub async fn save(&self, path: &Path) -> UploadResult<()> {
        let json = self.to_json()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(upload_id = %self.upload_id, path = %path.display(), "saved resume token");
        Ok(())
    }

    pub async fn load(path: &Path) -> UploadResult<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}
