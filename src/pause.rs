//! Cooperative pause
//!
//! A [`PauseController`] is handed to the uploader and kept by the caller.
//! While an upload runs it is registered with the controller; calling
//! [`PauseController::pause`] stops dispatch of new parts, waits for parts
//! already sent to settle and returns the resulting [`ResumeToken`]. With no
//! upload registered, a pause is a no-op that returns `None`.
//!
//! A controller tracks the most recently started upload. Each registration
//! carries its own request flag, so a pause only ever reaches the upload it
//! was issued against.
//!
//! An optional [`PauseObserver`] can be attached to receive every emitted
//! token. The controller only holds a weak reference to it, and dropping the
//! returned [`ObserverHandle`] detaches it.

use crate::token::ResumeToken;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;

/// Receives the resume token of every pause that completes
pub trait PauseObserver: Send + Sync {
    fn on_pause(&self, token: &ResumeToken);
}

#[derive(Debug, Clone)]
enum Settled {
    Paused(ResumeToken),
    /// The upload ended some other way (completed or failed)
    Finished,
}

struct Registered {
    id: u64,
    requested: Arc<AtomicBool>,
    settled: watch::Receiver<Option<Settled>>,
}

#[derive(Default)]
struct ControllerInner {
    next_id: AtomicU64,
    upload: Mutex<Option<Registered>>,
    observer: Mutex<Option<(u64, Weak<dyn PauseObserver>)>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// External pause control surface for a running upload
#[derive(Clone, Default)]
pub struct PauseController {
    inner: Arc<ControllerInner>,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an observer, replacing any previous one
    pub fn attach<O>(&self, observer: &Arc<O>) -> ObserverHandle
    where
        O: PauseObserver + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn PauseObserver> = weak;
        *locked(&self.inner.observer) = Some((id, weak));
        ObserverHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Whether an upload is currently registered
    pub fn is_attached(&self) -> bool {
        locked(&self.inner.upload).is_some()
    }

    /// Whether the registered upload has been asked to pause
    pub fn is_pause_requested(&self) -> bool {
        locked(&self.inner.upload)
            .as_ref()
            .is_some_and(|r| r.requested.load(Ordering::SeqCst))
    }

    /// Ask the running upload to pause without waiting for it
    ///
    /// Returns `false`, and does nothing, when no upload is registered.
    pub fn request_pause(&self) -> bool {
        match locked(&self.inner.upload).as_ref() {
            Some(registered) => {
                registered.requested.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Pause the running upload and wait for its resume token
    ///
    /// Returns `None` when no upload is registered, or when the upload
    /// completed or failed before it could pause.
    pub async fn pause(&self) -> Option<ResumeToken> {
        let mut settled = {
            let upload = locked(&self.inner.upload);
            let registered = upload.as_ref()?;
            registered.requested.store(true, Ordering::SeqCst);
            tracing::debug!(registration = registered.id, "pause requested");
            registered.settled.clone()
        };

        loop {
            let current = settled.borrow_and_update().clone();
            if let Some(outcome) = current {
                return match outcome {
                    Settled::Paused(token) => Some(token),
                    Settled::Finished => None,
                };
            }
            if settled.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Register a starting upload with this controller
    pub(crate) fn register(&self) -> PauseRegistration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        let requested = Arc::new(AtomicBool::new(false));
        *locked(&self.inner.upload) = Some(Registered {
            id,
            requested: requested.clone(),
            settled: receiver,
        });
        PauseRegistration {
            inner: self.inner.clone(),
            id,
            requested,
            sender,
        }
    }

    fn observer(&self) -> Option<Arc<dyn PauseObserver>> {
        locked(&self.inner.observer)
            .as_ref()
            .and_then(|(_, weak)| weak.upgrade())
    }
}

impl fmt::Debug for PauseController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseController")
            .field("attached", &self.is_attached())
            .field("pause_requested", &self.is_pause_requested())
            .finish()
    }
}

/// Keeps an observer attached; dropping it detaches the observer
#[derive(Debug)]
pub struct ObserverHandle {
    inner: Weak<ControllerInner>,
    id: u64,
}

impl ObserverHandle {
    pub fn detach(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut observer = locked(&inner.observer);
            if observer.as_ref().map(|(id, _)| *id) == Some(self.id) {
                *observer = None;
            }
        }
    }
}

/// The running upload's side of a [`PauseController`]
pub(crate) struct PauseRegistration {
    inner: Arc<ControllerInner>,
    id: u64,
    requested: Arc<AtomicBool>,
    sender: watch::Sender<Option<Settled>>,
}

impl PauseRegistration {
    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Publish the token of a settled pause
    pub(crate) fn settle_paused(&self, token: ResumeToken) {
        let controller = PauseController {
            inner: self.inner.clone(),
        };
        if let Some(observer) = controller.observer() {
            observer.on_pause(&token);
        }
        self.sender.send_replace(Some(Settled::Paused(token)));
    }

    /// The upload ended without pausing
    pub(crate) fn settle_finished(&self) {
        self.sender.send_replace(Some(Settled::Finished));
    }
}

impl Drop for PauseRegistration {
    fn drop(&mut self) {
        let mut upload = locked(&self.inner.upload);
        if upload.as_ref().map(|r| r.id) == Some(self.id) {
            *upload = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartDescriptor;

    #[derive(Default)]
    struct Recorder {
        tokens: Mutex<Vec<ResumeToken>>,
    }

    impl PauseObserver for Recorder {
        fn on_pause(&self, token: &ResumeToken) {
            locked(&self.tokens).push(token.clone());
        }
    }

    fn token() -> ResumeToken {
        ResumeToken::new("u-1", "k", 4, vec![PartDescriptor::new(1, 0, 4)], Vec::new())
    }

    #[tokio::test]
    async fn test_pause_without_upload_is_noop() {
        let controller = PauseController::new();
        assert_eq!(controller.pause().await, None);
        assert!(!controller.request_pause());
        assert!(!controller.is_pause_requested());
    }

    #[tokio::test]
    async fn test_pause_waits_for_settled_token() {
        let controller = PauseController::new();
        let registration = controller.register();
        assert!(controller.is_attached());

        let pauser = controller.clone();
        let waiter = tokio::spawn(async move { pauser.pause().await });

        while !registration.is_requested() {
            tokio::task::yield_now().await;
        }
        registration.settle_paused(token());

        assert_eq!(waiter.await.unwrap(), Some(token()));
        drop(registration);
        assert!(!controller.is_attached());
        assert!(!controller.is_pause_requested());
    }

    #[tokio::test]
    async fn test_finished_upload_yields_no_token() {
        let controller = PauseController::new();
        let registration = controller.register();
        registration.settle_finished();
        assert_eq!(controller.pause().await, None);
    }

    #[tokio::test]
    async fn test_observer_receives_token_until_detached() {
        let controller = PauseController::new();
        let recorder = Arc::new(Recorder::default());
        let handle = controller.attach(&recorder);

        controller.register().settle_paused(token());
        assert_eq!(locked(&recorder.tokens).len(), 1);

        handle.detach();
        controller.register().settle_paused(token());
        assert_eq!(locked(&recorder.tokens).len(), 1);
    }

    #[tokio::test]
    async fn test_pause_reaches_only_latest_registration() {
        let controller = PauseController::new();
        let first = controller.register();
        let second = controller.register();

        assert!(controller.request_pause());
        assert!(second.is_requested());
        assert!(!first.is_requested());
    }

    #[tokio::test]
    async fn test_request_does_not_carry_over_to_next_upload() {
        let controller = PauseController::new();
        let first = controller.register();
        assert!(controller.request_pause());
        first.settle_finished();
        drop(first);

        let next = controller.register();
        assert!(!next.is_requested());
        assert!(!controller.is_pause_requested());
    }

    #[tokio::test]
    async fn test_stale_registration_drop_keeps_newer_slot() {
        let controller = PauseController::new();
        let first = controller.register();
        let second = controller.register();
        drop(first);

        assert!(controller.is_attached());
        assert!(controller.request_pause());
        assert!(second.is_requested());
    }

    #[tokio::test]
    async fn test_dropped_observer_is_not_kept_alive() {
        let controller = PauseController::new();
        let recorder = Arc::new(Recorder::default());
        let _handle = controller.attach(&recorder);
        drop(recorder);

        assert!(controller.observer().is_none());
        controller.register().settle_paused(token());
    }
}
