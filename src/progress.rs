//! Progress events for multipart uploads
//!
//! An optional [`ProgressReporter`] can be handed to the uploader; events are
//! delivered over an unbounded tokio channel so reporting never blocks a
//! worker.
//!
//! # Examples
//!
//! ```no_run
//! use orbit_multipart::progress::{ProgressEvent, ProgressReporter};
//!
//! # async fn demo() {
//! let (reporter, mut receiver) = ProgressReporter::new();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = receiver.recv().await {
//!         if let ProgressEvent::Progress { percentage, .. } = event {
//!             println!("{:.1}%", percentage);
//!         }
//!     }
//! });
//! # drop(reporter);
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Progress event for one upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// Upload initiated or resumed
    UploadStarted {
        upload_id: String,
        key: String,
        total_bytes: u64,
        total_parts: u32,
        /// Parts already stored when a resumed upload starts
        completed_parts: u32,
    },

    /// A part was stored and recorded
    PartCompleted {
        upload_id: String,
        part: u32,
        bytes: u64,
    },

    /// A part attempt failed transiently and will be retried
    PartRetried {
        upload_id: String,
        part: u32,
        attempt: u32,
        error: String,
    },

    /// Byte-level progress
    Progress {
        upload_id: String,
        bytes_transferred: u64,
        total_bytes: u64,
        /// Percentage complete (0-100)
        percentage: f64,
    },

    /// Upload paused after in-flight parts settled
    UploadPaused {
        upload_id: String,
        completed_parts: u32,
        bytes_transferred: u64,
    },

    /// Remote object assembled
    UploadCompleted {
        upload_id: String,
        total_bytes: u64,
        duration: Duration,
    },

    /// Upload failed terminally
    UploadFailed {
        upload_id: String,
        error: String,
        failed_parts: Vec<u32>,
    },
}

/// Progress reporter for sending progress events
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Arc<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> (Self, UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = unbounded_channel();
        (
            Self {
                sender: Arc::new(sender),
            },
            receiver,
        )
    }

    /// Report a progress event
    pub fn report(&self, event: ProgressEvent) {
        // Ignore send errors (receiver might be dropped)
        let _ = self.sender.send(event);
    }

    pub fn upload_started(
        &self,
        upload_id: &str,
        key: &str,
        total_bytes: u64,
        total_parts: u32,
        completed_parts: u32,
    ) {
        self.report(ProgressEvent::UploadStarted {
            upload_id: upload_id.to_string(),
            key: key.to_string(),
            total_bytes,
            total_parts,
            completed_parts,
        });
    }

    /// Report a stored part followed by the new byte total
    pub fn part_completed(&self, upload_id: &str, part: u32, bytes: u64, transferred: u64, total: u64) {
        self.report(ProgressEvent::PartCompleted {
            upload_id: upload_id.to_string(),
            part,
            bytes,
        });
        self.progress(upload_id, transferred, total);
    }

    pub fn part_retried(&self, upload_id: &str, part: u32, attempt: u32, error: String) {
        self.report(ProgressEvent::PartRetried {
            upload_id: upload_id.to_string(),
            part,
            attempt,
            error,
        });
    }

    /// Report progress update
    pub fn progress(&self, upload_id: &str, bytes_transferred: u64, total_bytes: u64) {
        let percentage = if total_bytes > 0 {
            (bytes_transferred as f64 / total_bytes as f64) * 100.0
        } else {
            100.0
        };

        self.report(ProgressEvent::Progress {
            upload_id: upload_id.to_string(),
            bytes_transferred,
            total_bytes,
            percentage,
        });
    }

    pub fn upload_paused(&self, upload_id: &str, completed_parts: u32, bytes_transferred: u64) {
        self.report(ProgressEvent::UploadPaused {
            upload_id: upload_id.to_string(),
            completed_parts,
            bytes_transferred,
        });
    }

    pub fn upload_completed(&self, upload_id: &str, total_bytes: u64, duration: Duration) {
        self.report(ProgressEvent::UploadCompleted {
            upload_id: upload_id.to_string(),
            total_bytes,
            duration,
        });
    }

    pub fn upload_failed(&self, upload_id: &str, error: String, failed_parts: Vec<u32>) {
        self.report(ProgressEvent::UploadFailed {
            upload_id: upload_id.to_string(),
            error,
            failed_parts,
        });
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        let (sender, _) = unbounded_channel();
        Self {
            sender: Arc::new(sender),
        }
    }
}
