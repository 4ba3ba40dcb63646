/*!
 * Orbit Multipart - resumable multipart object uploads
 *
 * Splits a payload into parts and uploads them concurrently to an
 * S3-compatible object store:
 * - Deterministic part planning within the store's part limits
 * - Bounded-concurrency dispatch with per-part retry and backoff
 * - SHA-256 checksum on every part
 * - Cooperative pause with a durable, verifiable resume token
 * - Exactly one abort after a terminal failure
 */

pub mod checksum;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod failure;
pub mod logging;
pub mod memory;
pub mod pause;
pub mod planner;
pub mod progress;
pub mod reader;
pub mod recovery;
pub mod session;
pub mod token;
pub mod transport;
pub mod types;
pub mod worker;

mod scheduler;

#[cfg(feature = "s3-native")]
pub mod s3;

// Re-export commonly used types
pub use config::{LogLevel, UploadConfig, UploadConfigBuilder};
pub use engine::{MultipartUploader, UploadOutcome, UploadReceipt};
pub use error::{
    AbortError, AbortOutcome, TransportError, TransportResult, UploadError, UploadFailure,
    UploadResult,
};
pub use memory::MemoryTransport;
pub use pause::{ObserverHandle, PauseController, PauseObserver};
pub use planner::PartPlanner;
pub use progress::{ProgressEvent, ProgressReporter};
pub use reader::{BytesSource, FileSource, PartReader, PartSource, PayloadSource};
pub use recovery::{Backoff, BackoffStrategy, RetryPolicy};
pub use token::ResumeToken;
pub use transport::Transport;
pub use types::{PartDescriptor, PartResult, UploadMetadata, UploadStatus};

#[cfg(feature = "s3-native")]
pub use s3::S3Transport;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
