//! Part readers over seekable and forward-only payload sources
//!
//! A seekable source (in-memory bytes, a file) serves any range at any time,
//! so a retried part simply reads its range again. A forward-only stream is
//! wrapped in a single-consumer guard: parts are carved off in plan order and
//! held until the worker that uploads them releases them. Asking a stream for
//! a part that was already released or skipped fails with
//! [`UploadError::NonResumableSource`].

use crate::error::{UploadError, UploadResult};
use crate::types::PartDescriptor;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

/// A payload that supports positioned reads without a shared cursor
#[async_trait]
pub trait PartSource: Send + Sync + fmt::Debug {
    /// Total payload length in bytes
    fn size(&self) -> u64;

    /// Read exactly `length` bytes starting at `offset`
    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes>;
}

/// In-memory payload; reads are zero-copy slices
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl PartSource for BytesSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let end = offset.checked_add(length).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "range overflows u64")
        })?;
        if end > self.size() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {}..{} beyond payload of {} bytes", offset, end, self.size()),
            ));
        }
        Ok(self.data.slice(offset as usize..end as usize))
    }
}

/// File payload; every read opens its own handle
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    size: u64,
}

impl FileSource {
    /// Open a file source, taking its size from the file's metadata
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let size = tokio::fs::metadata(&path).await?.len();
        Ok(Self { path, size })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_range(&self, offset: u64, length: u64) -> io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer).await?;
        Ok(Bytes::from(buffer))
    }
}

/// Payload handed to the uploader
pub enum PayloadSource {
    /// Random-access source; parts can be re-read any number of times
    Seekable(Arc<dyn PartSource>),

    /// Forward-only stream of a declared total size
    Stream {
        stream: BoxStream<'static, io::Result<Bytes>>,
        size: u64,
    },
}

impl PayloadSource {
    /// In-memory payload
    pub fn bytes(data: impl Into<Bytes>) -> Self {
        PayloadSource::Seekable(Arc::new(BytesSource::new(data)))
    }

    /// File payload
    pub async fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        Ok(PayloadSource::Seekable(Arc::new(FileSource::open(path).await?)))
    }

    /// Forward-only stream that will yield exactly `size` bytes
    pub fn stream(stream: BoxStream<'static, io::Result<Bytes>>, size: u64) -> Self {
        PayloadSource::Stream { stream, size }
    }

    /// Declared payload length
    pub fn size(&self) -> u64 {
        match self {
            PayloadSource::Seekable(source) => source.size(),
            PayloadSource::Stream { size, .. } => *size,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self, PayloadSource::Seekable(_))
    }
}

impl fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSource::Seekable(source) => f.debug_tuple("Seekable").field(source).finish(),
            PayloadSource::Stream { size, .. } => {
                f.debug_struct("Stream").field("size", size).finish_non_exhaustive()
            }
        }
    }
}

/// Reads the bytes of individual parts for the workers
pub struct PartReader {
    size: u64,
    inner: ReaderInner,
}

enum ReaderInner {
    Seekable(Arc<dyn PartSource>),
    Stream(Mutex<StreamState>),
}

struct StreamState {
    stream: BoxStream<'static, io::Result<Bytes>>,
    plan: Vec<PartDescriptor>,
    /// Position in `plan` of the next part to carve off the stream
    next: usize,
    buffered: BytesMut,
    held: BTreeMap<u32, Bytes>,
    skipped: BTreeSet<u32>,
}

impl PartReader {
    pub fn new(source: PayloadSource, plan: &[PartDescriptor]) -> Self {
        let size = source.size();
        let inner = match source {
            PayloadSource::Seekable(source) => ReaderInner::Seekable(source),
            PayloadSource::Stream { stream, .. } => ReaderInner::Stream(Mutex::new(StreamState {
                stream,
                plan: plan.to_vec(),
                next: 0,
                buffered: BytesMut::new(),
                held: BTreeMap::new(),
                skipped: BTreeSet::new(),
            })),
        };
        Self { size, inner }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.inner, ReaderInner::Seekable(_))
    }

    /// Read the bytes of one part
    ///
    /// Safe to call concurrently. Seekable sources can be read any number of
    /// times; a stream part can be read until it is released.
    pub async fn read(&self, part: &PartDescriptor) -> UploadResult<Bytes> {
        match &self.inner {
            ReaderInner::Seekable(source) => {
                if part.length == 0 {
                    return Ok(Bytes::new());
                }
                source
                    .read_range(part.offset, part.length)
                    .await
                    .map_err(|source| UploadError::PartRead {
                        index: part.index,
                        source,
                    })
            }
            ReaderInner::Stream(state) => state.lock().await.read(part).await,
        }
    }

    /// Mark a part as already uploaded so a stream discards its bytes
    pub async fn skip(&self, index: u32) {
        if let ReaderInner::Stream(state) = &self.inner {
            let mut state = state.lock().await;
            state.held.remove(&index);
            state.skipped.insert(index);
        }
    }

    /// Drop the buffered bytes of a part once it has been stored remotely
    pub async fn release(&self, index: u32) {
        if let ReaderInner::Stream(state) = &self.inner {
            state.lock().await.held.remove(&index);
        }
    }
}

impl fmt::Debug for PartReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartReader")
            .field("size", &self.size)
            .field("seekable", &self.is_seekable())
            .finish()
    }
}

impl StreamState {
    async fn read(&mut self, part: &PartDescriptor) -> UploadResult<Bytes> {
        if let Some(bytes) = self.held.get(&part.index) {
            return Ok(bytes.clone());
        }

        let position = self
            .plan
            .iter()
            .position(|p| p == part)
            .ok_or_else(|| {
                UploadError::Consistency(format!("part {} is not in the stream's plan", part.index))
            })?;

        if position < self.next || self.skipped.contains(&part.index) {
            return Err(UploadError::NonResumableSource { index: part.index });
        }

        while self.next <= position {
            let current = self.plan[self.next];
            let bytes = self.take(&current).await?;
            if self.next + 1 == self.plan.len() {
                self.ensure_exhausted(&current).await?;
            }
            if !self.skipped.contains(&current.index) {
                self.held.insert(current.index, bytes);
            }
            self.next += 1;
        }

        self.held
            .get(&part.index)
            .cloned()
            .ok_or(UploadError::NonResumableSource { index: part.index })
    }

    /// Pull exactly one part's worth of bytes off the stream
    async fn take(&mut self, part: &PartDescriptor) -> UploadResult<Bytes> {
        let wanted = part.length as usize;
        while self.buffered.len() < wanted {
            match self.stream.next().await {
                Some(Ok(chunk)) => self.buffered.extend_from_slice(&chunk),
                Some(Err(source)) => {
                    return Err(UploadError::PartRead {
                        index: part.index,
                        source,
                    })
                }
                None => {
                    return Err(UploadError::PartRead {
                        index: part.index,
                        source: io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!(
                                "stream ended {} bytes short of part {}",
                                wanted - self.buffered.len(),
                                part.index
                            ),
                        ),
                    })
                }
            }
        }
        Ok(self.buffered.split_to(wanted).freeze())
    }

    /// After the last part, the stream must not hold any more bytes
    async fn ensure_exhausted(&mut self, last: &PartDescriptor) -> UploadResult<()> {
        let mut extra = self.buffered.len();
        while extra == 0 {
            match self.stream.next().await {
                Some(Ok(chunk)) => extra = chunk.len(),
                Some(Err(source)) => {
                    return Err(UploadError::PartRead {
                        index: last.index,
                        source,
                    })
                }
                None => return Ok(()),
            }
        }

        Err(UploadError::PartRead {
            index: last.index,
            source: io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "stream longer than declared size: at least {} bytes past part {}",
                    extra, last.index
                ),
            ),
        })
    }
}
