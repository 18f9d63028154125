//! Byte streams flowing between clients and backends
//!
//! A `ByteStream` is a boxed stream of `Bytes` chunks plus what is known
//! about it up front: its size (possibly unknown), and a display name the
//! backend may suggest. Adapters on `ByteStream` add range slicing, size
//! limits, declared-length checks, digests and cancellation without ever
//! buffering more than one chunk.

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::providers::ProviderError;

pub type ChunkStream = BoxStream<'static, Result<Bytes, ProviderError>>;

/// What is known about a stream's length before reading it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSize {
    Known(u64),
    /// Length only known once the stream ends (transforms, chunked bodies)
    Unsized,
}

impl StreamSize {
    pub fn known(&self) -> Option<u64> {
        match self {
            StreamSize::Known(n) => Some(*n),
            StreamSize::Unsized => None,
        }
    }
}

impl From<Option<u64>> for StreamSize {
    fn from(size: Option<u64>) -> Self {
        size.map(StreamSize::Known).unwrap_or(StreamSize::Unsized)
    }
}

pub struct ByteStream {
    inner: ChunkStream,
    size: StreamSize,
    name: Option<String>,
    content_type: Option<String>,
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("size", &self.size)
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .finish()
    }
}

impl ByteStream {
    pub fn new<S>(inner: S, size: StreamSize) -> Self
    where
        S: Stream<Item = Result<Bytes, ProviderError>> + Send + 'static,
    {
        Self {
            inner: inner.boxed(),
            size,
            name: None,
            content_type: None,
        }
    }

    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let size = StreamSize::Known(data.len() as u64);
        Self::new(stream::once(async move { Ok(data) }), size)
    }

    pub fn empty() -> Self {
        Self::new(stream::empty(), StreamSize::Known(0))
    }

    /// Wrap an inbound connection body. I/O failures surface as
    /// `ConnectionAborted` when the peer went away.
    pub fn from_reader<R>(reader: R, size: StreamSize, chunk_size: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let chunks = ReaderStream::with_capacity(reader, chunk_size.max(1))
            .map(|item| item.map_err(ProviderError::from));
        Self::new(chunks, size)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn size(&self) -> StreamSize {
        self.size
    }

    pub fn known_size(&self) -> Option<u64> {
        self.size.known()
    }

    pub fn is_sizable(&self) -> bool {
        matches!(self.size, StreamSize::Known(_))
    }

    /// Name the backend suggests, which may differ from the requested path
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn into_inner(self) -> ChunkStream {
        self.inner
    }

    fn map_inner(self, size: StreamSize, f: impl FnOnce(ChunkStream) -> ChunkStream) -> Self {
        Self {
            inner: f(self.inner),
            size,
            name: self.name,
            content_type: self.content_type,
        }
    }

    /// Collect the whole stream. Only for small bodies (callback payloads,
    /// verification in tests); transfers stay chunked.
    pub async fn read_to_end(mut self) -> Result<Bytes, ProviderError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.inner.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Keep only the bytes inside `range`, discarding the rest as they pass
    pub fn slice(self, range: ResolvedRange) -> Self {
        let start = range.start;
        let end = range.end.map(|e| e.saturating_add(1)).unwrap_or(u64::MAX);
        let size = match range.len() {
            Some(len) => StreamSize::Known(len),
            None => StreamSize::Unsized,
        };
        self.map_inner(size, move |inner| {
            stream::unfold((inner, 0u64), move |(mut inner, mut pos)| async move {
                if pos >= end {
                    return None;
                }
                loop {
                    let chunk = match inner.next().await? {
                        Ok(chunk) => chunk,
                        Err(e) => return Some((Err(e), (inner, end))),
                    };
                    if chunk.is_empty() {
                        continue;
                    }
                    let chunk_start = pos;
                    let chunk_end = pos + chunk.len() as u64;
                    pos = chunk_end;
                    if chunk_end <= start {
                        continue;
                    }
                    let from = start.saturating_sub(chunk_start) as usize;
                    let to = (end.min(chunk_end) - chunk_start) as usize;
                    return Some((Ok(chunk.slice(from..to)), (inner, pos)));
                }
            })
            .boxed()
        })
    }

    /// Fail with `PayloadTooLarge` as soon as more than `max` bytes pass
    pub fn limit(self, max: u64) -> Self {
        let size = self.size;
        self.map_inner(size, move |inner| {
            stream::unfold((inner, 0u64, false), move |(mut inner, seen, done)| async move {
                if done {
                    return None;
                }
                match inner.next().await? {
                    Ok(chunk) => {
                        let seen = seen + chunk.len() as u64;
                        if seen > max {
                            Some((Err(ProviderError::PayloadTooLarge { limit: max }), (inner, seen, true)))
                        } else {
                            Some((Ok(chunk), (inner, seen, false)))
                        }
                    }
                    Err(e) => Some((Err(e), (inner, seen, true))),
                }
            })
            .boxed()
        })
    }

    /// Require exactly `declared` bytes, for backends that need the length up front
    pub fn exact_length(self, declared: u64) -> Self {
        self.map_inner(StreamSize::Known(declared), move |inner| {
            stream::unfold((inner, 0u64, false), move |(mut inner, seen, done)| async move {
                if done {
                    return None;
                }
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        let seen = seen + chunk.len() as u64;
                        if seen > declared {
                            let err = ProviderError::BadRequest(format!(
                                "body is longer than the declared {} bytes",
                                declared
                            ));
                            Some((Err(err), (inner, seen, true)))
                        } else {
                            Some((Ok(chunk), (inner, seen, false)))
                        }
                    }
                    Some(Err(e)) => Some((Err(e), (inner, seen, true))),
                    None if seen < declared => {
                        let err = ProviderError::BadRequest(format!(
                            "body ended after {} of the declared {} bytes",
                            seen, declared
                        ));
                        Some((Err(err), (inner, seen, true)))
                    }
                    None => None,
                }
            })
            .boxed()
        })
    }

    /// End with `ConnectionAborted` once `token` is cancelled
    pub fn cancel_on(self, token: CancellationToken) -> Self {
        let size = self.size;
        self.map_inner(size, move |inner| {
            stream::unfold((inner, token, false), |(mut inner, token, done)| async move {
                if done {
                    return None;
                }
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    item = inner.next() => Some(item),
                };
                match next {
                    None => {
                        let err = ProviderError::ConnectionAborted("transfer cancelled".to_string());
                        Some((Err(err), (inner, token, true)))
                    }
                    Some(None) => None,
                    Some(Some(item)) => Some((item, (inner, token, false))),
                }
            })
            .boxed()
        })
    }

    /// Run `done` exactly once: when the stream ends, at its first error, or
    /// when it is dropped before either (reported as `ConnectionAborted`)
    pub fn on_finish<F>(self, done: F) -> Self
    where
        F: FnOnce(Result<(), &ProviderError>) + Send + 'static,
    {
        let size = self.size;
        let guard = FinishGuard(Some(Box::new(done)));
        self.map_inner(size, move |inner| {
            stream::unfold((inner, guard), |(mut inner, mut guard)| async move {
                match inner.next().await {
                    Some(Ok(chunk)) => Some((Ok(chunk), (inner, guard))),
                    Some(Err(e)) => {
                        guard.fire(Err(&e));
                        Some((Err(e), (inner, guard)))
                    }
                    None => {
                        guard.fire(Ok(()));
                        None
                    }
                }
            })
            .boxed()
        })
    }

    /// Hash and count bytes as they pass through
    pub fn digesting(self) -> (Self, DigestHandle) {
        let handle = DigestHandle::default();
        let state = handle.state.clone();
        let size = self.size;
        let stream = self.map_inner(size, move |inner| {
            inner
                .inspect(move |item| {
                    if let Ok(chunk) = item {
                        if let Ok(mut state) = state.lock() {
                            state.update(chunk);
                        }
                    }
                })
                .boxed()
        });
        (stream, handle)
    }
}

impl Stream for ByteStream {
    type Item = Result<Bytes, ProviderError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

type FinishFn = Box<dyn FnOnce(Result<(), &ProviderError>) + Send>;

struct FinishGuard(Option<FinishFn>);

impl FinishGuard {
    fn fire(&mut self, result: Result<(), &ProviderError>) {
        if let Some(done) = self.0.take() {
            done(result);
        }
    }
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        if self.0.is_some() {
            let err = ProviderError::ConnectionAborted("stream dropped before it ended".to_string());
            self.fire(Err(&err));
        }
    }
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DigestState {
    bytes: u64,
    md5: Md5,
    sha256: Sha256,
}

impl DigestState {
    fn update(&mut self, chunk: &[u8]) {
        self.bytes += chunk.len() as u64;
        self.md5.update(chunk);
        self.sha256.update(chunk);
    }
}

/// Read side of `ByteStream::digesting`
#[derive(Clone, Default)]
pub struct DigestHandle {
    state: Arc<Mutex<DigestState>>,
}

/// Byte count and hashes of everything that passed through a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferDigest {
    pub bytes: u64,
    pub md5: String,
    pub sha256: String,
}

impl DigestHandle {
    pub fn finish(&self) -> TransferDigest {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        TransferDigest {
            bytes: state.bytes,
            md5: hex::encode(state.md5.clone().finalize()),
            sha256: hex::encode(state.sha256.clone().finalize()),
        }
    }
}

// ---------------------------------------------------------------------------
// Byte ranges
// ---------------------------------------------------------------------------

/// A single `Range: bytes=...` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `bytes=a-b`, both inclusive
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`, the last n bytes
    Suffix(u64),
}

/// A range pinned to absolute offsets; `end` is inclusive and unknown only
/// for open ranges over unsized streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: Option<u64>,
    /// `end` was clamped against a known total, so it is the last byte served.
    /// Without a total the object may end before `end`.
    pub exact: bool,
}

impl ResolvedRange {
    /// Bytes the range will yield, only when that is certain
    pub fn len(&self) -> Option<u64> {
        if !self.exact {
            return None;
        }
        self.end.map(|end| end - self.start + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// `Content-Range` header value
    pub fn content_range(&self, total: Option<u64>) -> String {
        let total = total.map(|t| t.to_string()).unwrap_or_else(|| "*".to_string());
        match self.end {
            Some(end) if self.exact => format!("bytes {}-{}/{}", self.start, end, total),
            _ => format!("bytes {}-*/{}", self.start, total),
        }
    }
}

impl ByteRange {
    /// Parse a `Range` header value. Multi-range requests are not supported.
    pub fn parse(header: &str) -> Result<Self, ProviderError> {
        let header = header.trim();
        let ranges = header
            .strip_prefix("bytes=")
            .ok_or_else(|| ProviderError::InvalidRange(format!("unsupported unit in '{}'", header)))?;
        if ranges.contains(',') {
            return Err(ProviderError::InvalidRange("multiple ranges are not supported".to_string()));
        }
        let (first, last) = ranges
            .split_once('-')
            .ok_or_else(|| ProviderError::InvalidRange(format!("malformed range '{}'", header)))?;
        let number = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| ProviderError::InvalidRange(format!("malformed range '{}'", header)))
        };

        match (first.trim().is_empty(), last.trim().is_empty()) {
            (false, false) => {
                let (start, end) = (number(first)?, number(last)?);
                if start > end {
                    return Err(ProviderError::InvalidRange(format!("range '{}' is inverted", header)));
                }
                Ok(ByteRange::FromTo(start, end))
            }
            (false, true) => Ok(ByteRange::From(number(first)?)),
            (true, false) => Ok(ByteRange::Suffix(number(last)?)),
            (true, true) => Err(ProviderError::InvalidRange(format!("malformed range '{}'", header))),
        }
    }

    /// Pin the range against the total size, when known
    pub fn resolve(&self, total: Option<u64>) -> Result<ResolvedRange, ProviderError> {
        let unsatisfiable = || ProviderError::InvalidRange(format!("{} not satisfiable", self));
        match (*self, total) {
            (ByteRange::FromTo(start, end), Some(total)) => {
                if start >= total {
                    return Err(unsatisfiable());
                }
                Ok(ResolvedRange {
                    start,
                    end: Some(end.min(total - 1)),
                    exact: true,
                })
            }
            (ByteRange::FromTo(start, end), None) => Ok(ResolvedRange {
                start,
                end: Some(end),
                exact: false,
            }),
            (ByteRange::From(start), Some(total)) => {
                if start >= total {
                    return Err(unsatisfiable());
                }
                Ok(ResolvedRange {
                    start,
                    end: Some(total - 1),
                    exact: true,
                })
            }
            (ByteRange::From(start), None) => Ok(ResolvedRange {
                start,
                end: None,
                exact: false,
            }),
            (ByteRange::Suffix(n), Some(total)) => {
                if n == 0 || total == 0 {
                    return Err(unsatisfiable());
                }
                Ok(ResolvedRange {
                    start: total.saturating_sub(n),
                    end: Some(total - 1),
                    exact: true,
                })
            }
            (ByteRange::Suffix(_), None) => Err(ProviderError::InvalidRange(
                "suffix ranges need a known size".to_string(),
            )),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteRange::FromTo(a, b) => write!(f, "bytes={}-{}", a, b),
            ByteRange::From(a) => write!(f, "bytes={}-", a),
            ByteRange::Suffix(n) => write!(f, "bytes=-{}", n),
        }
    }
}
