//! Assembly of the final object from stored parts

use crate::error::{UploadError, UploadResult};
use crate::recovery::{with_retry, RetryPolicy};
use crate::session::UploadSession;
use crate::transport::Transport;
use crate::types::{CompleteOutput, UploadStatus};

/// Issues the completion call for a fully stored session
///
/// The completion call has its own retry budget. A failed completion never
/// aborts the remote upload: every part is stored, so the caller can retry
/// from the token carried by the error.
pub struct CompletionAssembler<'a> {
    transport: &'a dyn Transport,
    policy: RetryPolicy,
}

impl<'a> CompletionAssembler<'a> {
    pub fn new(transport: &'a dyn Transport, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn complete(&self, session: &UploadSession) -> UploadResult<CompleteOutput> {
        let parts = session.begin_completion().await?;

        if parts.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(UploadError::Consistency(format!(
                "completion list for upload {} is not strictly ascending",
                session.upload_id()
            )));
        }

        tracing::info!(upload_id = %session.upload_id(), parts = parts.len(), "completing upload");

        let outcome = with_retry(
            self.policy.max_attempts,
            &self.policy.backoff,
            "complete_upload",
            || {
                self.transport
                    .complete_upload(session.key(), session.upload_id(), &parts)
            },
        )
        .await;

        match outcome {
            Ok(output) => {
                session.transition(UploadStatus::Completed).await?;
                tracing::info!(upload_id = %session.upload_id(), etag = ?output.etag, "upload completed");
                Ok(output)
            }
            Err(exhausted) => {
                tracing::warn!(
                    upload_id = %session.upload_id(),
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "completion failed, upload left open"
                );
                Err(UploadError::Completion {
                    upload_id: session.upload_id().to_string(),
                    attempts: exhausted.attempts,
                    reason: exhausted.error.to_string(),
                    token: Some(Box::new(session.resume_token().await)),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::part_checksum;
    use crate::error::TransportError;
    use crate::memory::MemoryTransport;
    use crate::recovery::Backoff;
    use crate::types::{PartDescriptor, PartResult, UploadMetadata};
    use bytes::Bytes;

    async fn stored_session(store: &MemoryTransport) -> UploadSession {
        let id = store
            .initiate_upload("k", &UploadMetadata::default())
            .await
            .unwrap();
        let session = UploadSession::new(
            id.clone(),
            "k",
            3,
            vec![PartDescriptor::new(1, 0, 3), PartDescriptor::new(2, 3, 3)],
        );
        session.transition(UploadStatus::InProgress).await.unwrap();

        for (index, body) in [(2u32, b"def"), (1u32, b"abc")] {
            let checksum = part_checksum(body);
            let etag = store
                .upload_part("k", &id, index, Bytes::from_static(body), &checksum)
                .await
                .unwrap();
            session
                .record(PartResult::new(index, etag, checksum, 3))
                .await
                .unwrap();
        }
        session
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Backoff::immediate())
    }

    #[tokio::test]
    async fn test_completes_in_ascending_order() {
        let store = MemoryTransport::new();
        let session = stored_session(&store).await;

        CompletionAssembler::new(&store, policy(3))
            .complete(&session)
            .await
            .unwrap();

        assert_eq!(store.completion_orders(), vec![vec![1, 2]]);
        assert_eq!(&store.object("k").unwrap().body[..], b"abcdef");
        assert_eq!(session.status().await, UploadStatus::Completed);
    }

    #[tokio::test]
    async fn test_transient_completion_failure_retried() {
        let store = MemoryTransport::new();
        let session = stored_session(&store).await;
        store.fail_complete(TransportError::transient("503"));

        CompletionAssembler::new(&store, policy(3))
            .complete(&session)
            .await
            .unwrap();
        assert_eq!(store.complete_count(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_completion_does_not_abort() {
        let store = MemoryTransport::new();
        let session = stored_session(&store).await;
        for _ in 0..2 {
            store.fail_complete(TransportError::transient("503"));
        }

        let err = CompletionAssembler::new(&store, policy(2))
            .complete(&session)
            .await
            .unwrap_err();
        match &err {
            UploadError::Completion { attempts, .. } => assert_eq!(*attempts, 2),
            other => panic!("expected completion error, got {other:?}"),
        }
        let token = err.resume_token().unwrap();
        assert_eq!(token.completed_parts.len(), 2);

        assert_eq!(store.abort_count(), 0);
        assert!(store.is_open(session.upload_id()));
        assert_eq!(session.status().await, UploadStatus::Completing);
    }

    #[tokio::test]
    async fn test_missing_parts_make_no_remote_call() {
        let store = MemoryTransport::new();
        let id = store
            .initiate_upload("k", &UploadMetadata::default())
            .await
            .unwrap();
        let session = UploadSession::new(id, "k", 3, vec![PartDescriptor::new(1, 0, 3)]);
        session.transition(UploadStatus::InProgress).await.unwrap();

        let err = CompletionAssembler::new(&store, policy(3))
            .complete(&session)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Completion { token: None, .. }));
        assert_eq!(store.complete_count(), 0);
    }
}
