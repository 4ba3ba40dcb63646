use orbit_multipart::checksum::plan_checksum;
use orbit_multipart::{
    Backoff, MemoryTransport, MultipartUploader, PauseController, PauseObserver, PayloadSource,
    ResumeToken, RetryPolicy, UploadConfig, UploadError, UploadMetadata, UploadOutcome,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::tempdir;
use tokio::task::JoinHandle;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 256) as u8).collect()
}

fn config(part_size: u64, concurrency: usize) -> UploadConfig {
    UploadConfig::builder()
        .min_part_size(1)
        .part_size(part_size)
        .concurrency(concurrency)
        .part_retry(RetryPolicy::new(3, Backoff::immediate()))
        .completion_retry(RetryPolicy::new(3, Backoff::immediate()))
        .build()
        .unwrap()
}

/// Uploader whose store requests a pause right after `pause_at` is stored
fn pausing_uploader(
    part_size: u64,
    pause_at: u32,
) -> (Arc<MemoryTransport>, PauseController, MultipartUploader) {
    let store = Arc::new(MemoryTransport::new());
    let controller = PauseController::new();

    let pauser = controller.clone();
    store.on_part_uploaded(move |index| {
        if index == pause_at {
            pauser.request_pause();
        }
    });

    let uploader = MultipartUploader::new(store.clone(), config(part_size, 1))
        .unwrap()
        .with_pause_controller(controller.clone());
    (store, controller, uploader)
}

fn expect_token(outcome: UploadOutcome) -> ResumeToken {
    match outcome {
        UploadOutcome::Paused(token) => token,
        other => panic!("expected a paused upload, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pause_after_k_parts_then_resume_remaining() {
    let (store, _controller, uploader) = pausing_uploader(4, 2);
    let data = payload(24);

    let outcome = uploader
        .upload("paused", PayloadSource::bytes(data.clone()), UploadMetadata::default())
        .await
        .unwrap();
    let token = expect_token(outcome);

    assert_eq!(token.completed_parts.len(), 2);
    assert_eq!(token.parts.len(), 6);
    let fresh = uploader.planner().plan(data.len() as u64).unwrap();
    assert_eq!(token.part_plan_checksum, plan_checksum(&fresh));
    assert_eq!(store.part_uploads(), vec![1, 2]);
    assert_eq!(store.complete_count(), 0);
    assert!(store.is_open(&token.upload_id));

    let uploads_before = store.part_uploads().len();
    let outcome = uploader
        .resume(&token, PayloadSource::bytes(data.clone()))
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let resumed: Vec<u32> = store.part_uploads()[uploads_before..].to_vec();
    assert_eq!(resumed, vec![3, 4, 5, 6]);
    assert_eq!(store.completion_orders(), vec![vec![1, 2, 3, 4, 5, 6]]);
    assert_eq!(&store.object("paused").unwrap().body[..], &data[..]);
}

#[tokio::test]
async fn test_mismatched_token_makes_no_calls() {
    let (store, _controller, uploader) = pausing_uploader(4, 1);
    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(payload(16)), UploadMetadata::default())
            .await
            .unwrap(),
    );

    let calls_before = store.call_count();
    let err = uploader
        .resume(&token, PayloadSource::bytes(payload(17)))
        .await
        .unwrap_err();

    assert!(matches!(err, UploadError::TokenMismatch { .. }));
    assert_eq!(store.call_count(), calls_before);
}

#[tokio::test]
async fn test_token_from_other_part_size_rejected() {
    let (store, _controller, uploader) = pausing_uploader(4, 1);
    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(payload(16)), UploadMetadata::default())
            .await
            .unwrap(),
    );

    let other = MultipartUploader::new(store.clone(), config(8, 1)).unwrap();
    let calls_before = store.call_count();
    let err = other
        .resume(&token, PayloadSource::bytes(payload(16)))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::TokenMismatch { .. }));
    assert_eq!(store.call_count(), calls_before);
}

#[tokio::test]
async fn test_pause_waits_for_in_flight_and_returns_token() {
    let store = Arc::new(MemoryTransport::new());
    for index in 3..=8 {
        store.set_part_latency(index, Duration::from_millis(20));
    }
    let controller = PauseController::new();
    let pending: Arc<Mutex<Option<JoinHandle<Option<ResumeToken>>>>> = Arc::new(Mutex::new(None));

    let pauser = controller.clone();
    let slot = pending.clone();
    store.on_part_uploaded(move |index| {
        if index == 2 {
            let pauser = pauser.clone();
            let handle = tokio::spawn(async move { pauser.pause().await });
            *slot.lock().unwrap() = Some(handle);
        }
    });

    let uploader = MultipartUploader::new(store.clone(), config(4, 2))
        .unwrap()
        .with_pause_controller(controller.clone());
    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(payload(32)), UploadMetadata::default())
            .await
            .unwrap(),
    );

    let handle = pending.lock().unwrap().take().expect("pause was requested");
    let from_controller = handle.await.unwrap();
    assert_eq!(from_controller.as_ref(), Some(&token));

    // every dispatched part settled and was recorded before the token was emitted
    let mut stored = store.stored_parts(&token.upload_id);
    stored.sort_unstable();
    let mut recorded: Vec<u32> = token.completed_parts.iter().map(|r| r.index).collect();
    recorded.sort_unstable();
    assert_eq!(stored, recorded);
    assert!(token.completed_parts.len() >= 2);
    assert!(token.completed_parts.len() < 8);
    assert!(!controller.is_attached());
}

#[tokio::test]
async fn test_pause_without_running_upload_returns_none() {
    let store = Arc::new(MemoryTransport::new());
    let controller = PauseController::new();
    let uploader = MultipartUploader::new(store.clone(), config(4, 2))
        .unwrap()
        .with_pause_controller(controller.clone());

    assert_eq!(controller.pause().await, None);

    // a finished upload leaves nothing to pause, and the earlier call did not stick
    let outcome = uploader
        .upload("k", PayloadSource::bytes(payload(8)), UploadMetadata::default())
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(controller.pause().await, None);
}

#[derive(Default)]
struct TokenSink {
    tokens: Mutex<Vec<ResumeToken>>,
}

impl PauseObserver for TokenSink {
    fn on_pause(&self, token: &ResumeToken) {
        self.tokens.lock().unwrap().push(token.clone());
    }
}

#[tokio::test]
async fn test_observer_receives_emitted_token() {
    let (_store, controller, uploader) = pausing_uploader(4, 1);
    let sink = Arc::new(TokenSink::default());
    let _handle = controller.attach(&sink);

    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(payload(12)), UploadMetadata::default())
            .await
            .unwrap(),
    );
    assert_eq!(*sink.tokens.lock().unwrap(), vec![token]);
}

#[tokio::test]
async fn test_resume_reuploads_parts_missing_remotely() {
    let (store, _controller, uploader) = pausing_uploader(4, 3);
    let data = payload(20);
    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(data.clone()), UploadMetadata::default())
            .await
            .unwrap(),
    );
    assert_eq!(token.completed_parts.len(), 3);

    store.drop_part(&token.upload_id, 2);
    let uploads_before = store.part_uploads().len();

    uploader
        .resume(&token, PayloadSource::bytes(data.clone()))
        .await
        .unwrap();

    let mut resumed: Vec<u32> = store.part_uploads()[uploads_before..].to_vec();
    resumed.sort_unstable();
    assert_eq!(resumed, vec![2, 4, 5]);
    assert_eq!(&store.object("k").unwrap().body[..], &data[..]);
}

#[tokio::test]
async fn test_resume_of_aborted_upload_is_stale() {
    let (_store, _controller, uploader) = pausing_uploader(4, 1);
    let data = payload(12);
    let token = expect_token(
        uploader
            .upload("k", PayloadSource::bytes(data.clone()), UploadMetadata::default())
            .await
            .unwrap(),
    );

    uploader.abort(&token).await.unwrap();

    let err = uploader
        .resume(&token, PayloadSource::bytes(data))
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::StaleToken { .. }));
}

#[tokio::test]
async fn test_token_persisted_to_disk_then_resumed_from_file() {
    use std::io::Write;

    let data = payload(40);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();

    let (store, _controller, uploader) = pausing_uploader(8, 2);
    let token = expect_token(
        uploader
            .upload("disk", PayloadSource::file(file.path()).await.unwrap(), UploadMetadata::default())
            .await
            .unwrap(),
    );

    let dir = tempdir().unwrap();
    let token_path = dir.path().join("disk.resume.json");
    token.save(&token_path).await.unwrap();
    let loaded = ResumeToken::load(&token_path).await.unwrap();
    assert_eq!(loaded, token);
    assert_eq!(loaded.bytes_completed(), 16);
    assert_eq!(loaded.remaining_parts().len(), 3);

    uploader
        .resume(&loaded, PayloadSource::file(file.path()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(&store.object("disk").unwrap().body[..], &data[..]);
}

#[tokio::test]
async fn test_resume_stream_skips_stored_parts() {
    use bytes::Bytes;
    use futures::stream::{self, StreamExt};

    let (store, _controller, uploader) = pausing_uploader(5, 2);
    let data = payload(23);
    let token = expect_token(
        uploader
            .upload("s", PayloadSource::bytes(data.clone()), UploadMetadata::default())
            .await
            .unwrap(),
    );

    let chunks: Vec<std::io::Result<Bytes>> = data
        .chunks(3)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    let source = PayloadSource::stream(stream::iter(chunks).boxed(), 23);

    uploader.resume(&token, source).await.unwrap();
    assert_eq!(&store.object("s").unwrap().body[..], &data[..]);
}

#[tokio::test]
async fn test_pause_only_reaches_latest_upload_on_shared_controller() {
    let store = Arc::new(MemoryTransport::new());
    for index in 1..=4 {
        store.set_part_latency(index, Duration::from_millis(10));
    }
    let controller = PauseController::new();
    let uploader = MultipartUploader::new(store.clone(), config(4, 1))
        .unwrap()
        .with_pause_controller(controller.clone());

    let pauser = controller.clone();
    let (first, second, paused) = tokio::join!(
        uploader.upload("a", PayloadSource::bytes(payload(16)), UploadMetadata::default()),
        uploader.upload("b", PayloadSource::bytes(payload(16)), UploadMetadata::default()),
        async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            pauser.pause().await
        },
    );

    // "b" registered last, so only it is paused
    assert!(first.unwrap().is_completed());
    let token = expect_token(second.unwrap());
    assert_eq!(token.key, "b");
    assert_eq!(paused, Some(token));
    assert!(store.object("a").is_some());
    assert!(store.object("b").is_none());
}

#[tokio::test]
async fn test_pause_request_does_not_leak_into_next_upload() {
    let (store, controller, uploader) = pausing_uploader(4, 1);
    let token = expect_token(
        uploader
            .upload("first", PayloadSource::bytes(payload(12)), UploadMetadata::default())
            .await
            .unwrap(),
    );
    assert!(!controller.is_pause_requested());

    // the hook only fires for part 1 of the next upload; drop it first
    store.on_part_uploaded(|_| {});
    let outcome = uploader
        .upload("second", PayloadSource::bytes(payload(12)), UploadMetadata::default())
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert!(store.is_open(&token.upload_id));
}
