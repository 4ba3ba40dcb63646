//! In-process object store
//!
//! [`MemoryTransport`] implements [`Transport`] against a map of pending
//! uploads and assembled objects. It checks part checksums and part order the
//! way an S3-compatible store does, records every call it receives, and can
//! be scripted to fail or slow down individual calls. Useful for dry runs and
//! for exercising retry, abort and pause paths without a network.

use crate::checksum::part_checksum;
use crate::error::{TransportError, TransportResult};
use crate::transport::Transport;
use crate::types::{CompleteOutput, CompletedPart, RemotePart, UploadMetadata};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// A call received by a [`MemoryTransport`], in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Initiate { key: String },
    UploadPart { upload_id: String, index: u32 },
    Complete { upload_id: String, parts: Vec<u32> },
    Abort { upload_id: String },
    ListParts { upload_id: String },
}

/// An assembled object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub etag: String,
    pub metadata: UploadMetadata,
    /// Part indices in the order they were assembled
    pub parts: Vec<u32>,
}

#[derive(Debug)]
struct PendingUpload {
    key: String,
    metadata: UploadMetadata,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Debug, Clone)]
struct StoredPart {
    etag: String,
    body: Bytes,
}

#[derive(Debug, Default)]
struct StoreState {
    next_upload: u64,
    uploads: HashMap<String, PendingUpload>,
    objects: HashMap<String, StoredObject>,
    calls: Vec<TransportCall>,
    part_faults: HashMap<u32, VecDeque<TransportError>>,
    part_latency: HashMap<u32, Duration>,
    initiate_faults: VecDeque<TransportError>,
    complete_faults: VecDeque<TransportError>,
    abort_faults: VecDeque<TransportError>,
    list_faults: VecDeque<TransportError>,
}

type PartHook = Arc<dyn Fn(u32) + Send + Sync>;

/// In-memory [`Transport`] with fault injection and call recording
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<StoreState>,
    on_part_uploaded: Mutex<Option<PartHook>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next upload attempt of `index` with `error`
    ///
    /// Scripted errors queue up; each attempt consumes one.
    pub fn fail_part(&self, index: u32, error: TransportError) {
        self.state()
            .part_faults
            .entry(index)
            .or_default()
            .push_back(error);
    }

    /// Fail the next `times` upload attempts of `index` with `error`
    pub fn fail_part_times(&self, index: u32, times: u32, error: TransportError) {
        for _ in 0..times {
            self.fail_part(index, error.clone());
        }
    }

    /// Delay every upload attempt of `index`
    pub fn set_part_latency(&self, index: u32, latency: Duration) {
        self.state().part_latency.insert(index, latency);
    }

    pub fn fail_initiate(&self, error: TransportError) {
        self.state().initiate_faults.push_back(error);
    }

    pub fn fail_complete(&self, error: TransportError) {
        self.state().complete_faults.push_back(error);
    }

    pub fn fail_abort(&self, error: TransportError) {
        self.state().abort_faults.push_back(error);
    }

    pub fn fail_list_parts(&self, error: TransportError) {
        self.state().list_faults.push_back(error);
    }

    /// Run `hook` after each part is stored, before the call returns
    pub fn on_part_uploaded(&self, hook: impl Fn(u32) + Send + Sync + 'static) {
        *self
            .on_part_uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(hook));
    }

    /// Every call received so far
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state().calls.len()
    }

    /// Part indices of every upload-part call, including failed attempts
    pub fn part_uploads(&self) -> Vec<u32> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::UploadPart { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    /// Upload attempts made for one part
    pub fn attempts_for(&self, index: u32) -> usize {
        self.part_uploads().into_iter().filter(|i| *i == index).count()
    }

    pub fn abort_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Abort { .. }))
    }

    pub fn complete_count(&self) -> usize {
        self.count(|call| matches!(call, TransportCall::Complete { .. }))
    }

    fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.state().calls.iter().filter(|c| pred(c)).count()
    }

    /// Part lists sent with each completion call
    pub fn completion_orders(&self) -> Vec<Vec<u32>> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Complete { parts, .. } => Some(parts.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    /// Whether an upload is still open (neither completed nor aborted)
    pub fn is_open(&self, upload_id: &str) -> bool {
        self.state().uploads.contains_key(upload_id)
    }

    /// Part indices stored for an open upload
    pub fn stored_parts(&self, upload_id: &str) -> Vec<u32> {
        self.state()
            .uploads
            .get(upload_id)
            .map(|u| u.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Forget a stored part, as if the store had expired it
    pub fn drop_part(&self, upload_id: &str, index: u32) {
        if let Some(upload) = self.state().uploads.get_mut(upload_id) {
            upload.parts.remove(&index);
        }
    }
}

impl fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryTransport")
            .field("open_uploads", &state.uploads.len())
            .field("objects", &state.objects.len())
            .field("calls", &state.calls.len())
            .finish()
    }
}

fn no_such_upload(upload_id: &str) -> TransportError {
    TransportError::fatal(
        "NoSuchUpload",
        format!("upload {} does not exist", upload_id),
    )
}

fn part_etag(body: &[u8]) -> String {
    format!("\"{}\"", hex::encode(&Sha256::digest(body)[..16]))
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn initiate_upload(&self, key: &str, metadata: &UploadMetadata) -> TransportResult<String> {
        let mut state = self.state();
        state.calls.push(TransportCall::Initiate {
            key: key.to_string(),
        });
        if let Some(error) = state.initiate_faults.pop_front() {
            return Err(error);
        }

        state.next_upload += 1;
        let upload_id = format!("mem-upload-{}", state.next_upload);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                metadata: metadata.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _key: &str,
        upload_id: &str,
        index: u32,
        body: Bytes,
        checksum: &str,
    ) -> TransportResult<String> {
        let (fault, latency) = {
            let mut state = self.state();
            state.calls.push(TransportCall::UploadPart {
                upload_id: upload_id.to_string(),
                index,
            });
            let fault = state.part_faults.get_mut(&index).and_then(|q| q.pop_front());
            (fault, state.part_latency.get(&index).copied())
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(error) = fault {
            return Err(error);
        }

        if part_checksum(&body) != checksum {
            return Err(TransportError::fatal(
                "BadDigest",
                format!("checksum of part {} does not match its body", index),
            ));
        }

        let etag = part_etag(&body);
        {
            let mut state = self.state();
            let upload = state
                .uploads
                .get_mut(upload_id)
                .ok_or_else(|| no_such_upload(upload_id))?;
            upload.parts.insert(
                index,
                StoredPart {
                    etag: etag.clone(),
                    body,
                },
            );
        }

        let hook = self
            .on_part_uploaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(index);
        }

        Ok(etag)
    }

    async fn complete_upload(
        &self,
        _key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> TransportResult<CompleteOutput> {
        let mut state = self.state();
        state.calls.push(TransportCall::Complete {
            upload_id: upload_id.to_string(),
            parts: parts.iter().map(|p| p.index).collect(),
        });
        if let Some(error) = state.complete_faults.pop_front() {
            return Err(error);
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;

        if parts.is_empty() {
            return Err(TransportError::fatal(
                "MalformedXML",
                "completion requires at least one part",
            ));
        }
        if parts.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(TransportError::fatal(
                "InvalidPartOrder",
                "parts must be listed in ascending order",
            ));
        }

        let mut body = BytesMut::new();
        let mut etag_hasher = Sha256::new();
        for part in parts {
            let stored = upload.parts.get(&part.index).ok_or_else(|| {
                TransportError::fatal("InvalidPart", format!("part {} was never stored", part.index))
            })?;
            if stored.etag != part.etag {
                return Err(TransportError::fatal(
                    "InvalidPart",
                    format!("entity tag of part {} does not match", part.index),
                ));
            }
            body.extend_from_slice(&stored.body);
            etag_hasher.update(stored.etag.as_bytes());
        }

        let etag = format!(
            "\"{}-{}\"",
            hex::encode(&etag_hasher.finalize()[..16]),
            parts.len()
        );

        if let Some(upload) = state.uploads.remove(upload_id) {
            state.objects.insert(
                upload.key,
                StoredObject {
                    body: body.freeze(),
                    etag: etag.clone(),
                    metadata: upload.metadata,
                    parts: parts.iter().map(|p| p.index).collect(),
                },
            );
        }

        Ok(CompleteOutput { etag: Some(etag) })
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) -> TransportResult<()> {
        let mut state = self.state();
        state.calls.push(TransportCall::Abort {
            upload_id: upload_id.to_string(),
        });
        if let Some(error) = state.abort_faults.pop_front() {
            return Err(error);
        }

        state
            .uploads
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| no_such_upload(upload_id))
    }

    async fn list_parts(&self, _key: &str, upload_id: &str) -> TransportResult<Vec<RemotePart>> {
        let mut state = self.state();
        state.calls.push(TransportCall::ListParts {
            upload_id: upload_id.to_string(),
        });
        if let Some(error) = state.list_faults.pop_front() {
            return Err(error);
        }

        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| no_such_upload(upload_id))?;
        Ok(upload
            .parts
            .iter()
            .map(|(index, part)| RemotePart {
                index: *index,
                etag: part.etag.clone(),
                length: part.body.len() as u64,
            })
            .collect())
    }
}
