//! Part planning
//!
//! Splits a payload length into an ordered list of [`PartDescriptor`]s
//! without touching the payload itself. Every part uses the configured part
//! size except the last, which absorbs the remainder. When that would need
//! more than `max_parts` parts, the part size is raised to
//! `ceil(total / max_parts)` and applied uniformly.

use crate::config::UploadConfig;
use crate::error::{UploadError, UploadResult};
use crate::types::PartDescriptor;

/// Computes part plans for one part-size policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlanner {
    part_size: u64,
    min_part_size: u64,
    max_part_size: u64,
    max_parts: u32,
    require_multipart: bool,
}

impl PartPlanner {
    /// Planner with the store limits from the default configuration
    pub fn new(part_size: u64, max_parts: u32) -> Self {
        let defaults = UploadConfig::default();
        Self {
            part_size,
            min_part_size: defaults.min_part_size,
            max_part_size: defaults.max_part_size,
            max_parts,
            require_multipart: defaults.require_multipart,
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            part_size: config.part_size,
            min_part_size: config.min_part_size,
            max_part_size: config.max_part_size,
            max_parts: config.max_parts,
            require_multipart: config.require_multipart,
        }
    }

    /// Override the store's part-size limits
    pub fn with_limits(mut self, min_part_size: u64, max_part_size: u64) -> Self {
        self.min_part_size = min_part_size;
        self.max_part_size = max_part_size;
        self
    }

    /// Fail on empty payloads instead of planning one empty part
    pub fn require_multipart(mut self, require: bool) -> Self {
        self.require_multipart = require;
        self
    }

    pub fn part_size(&self) -> u64 {
        self.part_size
    }

    /// Part size actually used for a payload of `total_len` bytes
    pub fn effective_part_size(&self, total_len: u64) -> UploadResult<u64> {
        self.check_policy()?;

        let capacity = (self.max_parts as u64).saturating_mul(self.max_part_size);
        if total_len > capacity {
            return Err(UploadError::Planning(format!(
                "payload of {} bytes exceeds capacity of {} parts of {} bytes",
                total_len, self.max_parts, self.max_part_size
            )));
        }

        if total_len.div_ceil(self.part_size) > self.max_parts as u64 {
            // capacity check above keeps this within max_part_size
            Ok(total_len.div_ceil(self.max_parts as u64))
        } else {
            Ok(self.part_size)
        }
    }

    /// Compute the ordered part plan for a payload of `total_len` bytes
    pub fn plan(&self, total_len: u64) -> UploadResult<Vec<PartDescriptor>> {
        if total_len == 0 {
            self.check_policy()?;
            if self.require_multipart {
                return Err(UploadError::Planning(
                    "payload is empty but multipart mode is required".to_string(),
                ));
            }
            return Ok(vec![PartDescriptor::new(1, 0, 0)]);
        }

        let part_size = self.effective_part_size(total_len)?;
        let count = total_len.div_ceil(part_size);

        let mut parts = Vec::with_capacity(count as usize);
        let mut offset = 0u64;
        let mut index = 1u32;
        while offset < total_len {
            let length = part_size.min(total_len - offset);
            parts.push(PartDescriptor::new(index, offset, length));
            offset += length;
            index += 1;
        }

        if part_size != self.part_size {
            tracing::debug!(
                requested = self.part_size,
                effective = part_size,
                parts = parts.len(),
                "raised part size to fit part limit"
            );
        }

        Ok(parts)
    }

    fn check_policy(&self) -> UploadResult<()> {
        if self.part_size == 0 {
            return Err(UploadError::Planning("part size must be positive".to_string()));
        }
        if self.part_size < self.min_part_size {
            return Err(UploadError::Planning(format!(
                "part size {} is below the store minimum {}",
                self.part_size, self.min_part_size
            )));
        }
        if self.part_size > self.max_part_size {
            return Err(UploadError::Planning(format!(
                "part size {} exceeds the store maximum {}",
                self.part_size, self.max_part_size
            )));
        }
        if self.max_parts == 0 {
            return Err(UploadError::Planning("maximum part count must be positive".to_string()));
        }
        Ok(())
    }
}
