//! Streaming I/O pipeline
//!
//! Moves bytes between a client connection and a bound provider without ever
//! holding more than one chunk per stage. Uploads are size-limited,
//! length-checked for backends that need the length up front, cancellable,
//! and cleaned up when a non-atomic backend was left with a partial object.
//! Downloads resolve byte ranges either at the backend or by discarding
//! bytes locally.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::metadata::Metadata;
use crate::path::GatewayPath;
use crate::providers::retry::{read_with_retry, ReadRetryConfig};
use crate::providers::{BoundProvider, ProviderError};
use crate::stream::{ByteRange, ByteStream, ResolvedRange};

const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Streaming limits, shared by every request of the process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Largest accepted upload in bytes (`None` = unlimited)
    pub max_upload_size: Option<u64>,
    /// Read size for inbound connection bodies
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_upload_size: Some(5 * 1024 * 1024 * 1024),
            chunk_size: 64 * 1024,
        }
    }
}

impl PipelineConfig {
    /// Clamp values into safe bounds
    pub fn validate(&mut self) {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    }
}

/// Result of a completed upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub metadata: Metadata,
    /// False when an existing object was replaced
    pub created: bool,
}

/// A download ready to be forwarded to the client
#[derive(Debug)]
pub struct Download {
    pub stream: ByteStream,
    /// Range actually served, when one was requested
    pub range: Option<ResolvedRange>,
    /// Size of the whole file, when known
    pub total: Option<u64>,
    /// Last segment of the requested path
    pub requested_name: String,
}

impl Download {
    /// Name the backend suggested, if any
    pub fn suggested_name(&self) -> Option<&str> {
        self.stream.name()
    }

    /// Suggested name when present, otherwise the requested one
    pub fn display_name(&self) -> &str {
        self.stream.name().unwrap_or(&self.requested_name)
    }

    /// `Content-Range` value for ranged responses
    pub fn content_range(&self) -> Option<String> {
        self.range.map(|r| r.content_range(self.total))
    }
}

/// First error seen on a stream, kept so it can win over the provider's own
/// wrapping of it (reqwest reports a failed body as a generic body error)
#[derive(Clone, Default)]
struct FaultSlot(Arc<Mutex<Option<ProviderError>>>);

impl FaultSlot {
    fn watch(&self, body: ByteStream) -> ByteStream {
        let slot = self.0.clone();
        let size = body.size();
        ByteStream::new(
            body.inspect(move |item| {
                if let Err(e) = item {
                    if let Ok(mut slot) = slot.lock() {
                        slot.get_or_insert_with(|| e.clone());
                    }
                }
            }),
            size,
        )
    }

    fn take(&self) -> Option<ProviderError> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    read_retry: ReadRetryConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, read_retry: ReadRetryConfig) -> Self {
        Self { config, read_retry }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn read_retry(&self) -> &ReadRetryConfig {
        &self.read_retry
    }

    /// Stream `body` into the file at `path`
    pub async fn upload(
        &self,
        provider: &BoundProvider,
        path: &GatewayPath,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::BadRequest(format!("cannot upload to folder {}", path)));
        }
        let size_hint = body.known_size();
        let capabilities = provider.capabilities();

        if let (Some(max), Some(hint)) = (self.config.max_upload_size, size_hint) {
            if hint > max {
                tracing::warn!(
                    "[Pipeline] Rejecting upload to {}: declared {} bytes, limit {}",
                    path,
                    hint,
                    max
                );
                return Err(ProviderError::PayloadTooLarge { limit: max });
            }
        }
        if capabilities.requires_size_hint && size_hint.is_none() {
            return Err(ProviderError::BadRequest(format!(
                "'{}' needs the content length before the upload starts",
                provider.name()
            )));
        }

        let existed = read_with_retry("exists", &self.read_retry, || provider.exists(path)).await?;

        let mut body = body;
        if let Some(max) = self.config.max_upload_size {
            body = body.limit(max);
        }
        if let (true, Some(declared)) = (capabilities.requires_size_hint, size_hint) {
            body = body.exact_length(declared);
        }
        let faults = FaultSlot::default();
        let body = faults.watch(body.cancel_on(cancel.clone()));

        tracing::debug!(
            "[Pipeline] Upload to {}:{} (size {:?}, {})",
            provider.name(),
            path,
            size_hint,
            if existed { "replace" } else { "create" }
        );

        match provider.upload(path, body, size_hint).await {
            Ok(metadata) => Ok(UploadOutcome {
                metadata,
                created: !existed,
            }),
            Err(provider_err) => {
                let err = faults.take().unwrap_or(provider_err);
                if !capabilities.atomic_replace {
                    self.discard_partial(provider, path, existed).await;
                }
                tracing::warn!("[Pipeline] Upload to {}:{} failed: {}", provider.name(), path, err);
                Err(err)
            }
        }
    }

    /// Remove what a non-atomic backend may have kept of a failed upload
    async fn discard_partial(&self, provider: &BoundProvider, path: &GatewayPath, existed: bool) {
        if existed {
            tracing::warn!(
                "[Pipeline] {}:{} may hold a partial replacement; backend has no atomic replace",
                provider.name(),
                path
            );
            return;
        }
        match provider.delete(path).await {
            Ok(()) => tracing::info!("[Pipeline] Removed partial object {}:{}", provider.name(), path),
            Err(ProviderError::PathNotFound(_)) => {}
            Err(e) => tracing::error!(
                "[Pipeline] Could not remove partial object {}:{}: {}",
                provider.name(),
                path,
                e
            ),
        }
    }

    /// Open a download of `path`, honouring `range`
    pub async fn download(
        &self,
        provider: &BoundProvider,
        path: &GatewayPath,
        range: Option<ByteRange>,
        revision: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Download, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::BadRequest(format!("{} is a folder", path)));
        }
        let requested_name = path.name().to_string();

        let Some(range) = range else {
            let stream = read_with_retry("download", &self.read_retry, || {
                provider.download(path, None, revision)
            })
            .await?;
            let total = stream.known_size();
            return Ok(Download {
                stream: stream.cancel_on(cancel.clone()),
                range: None,
                total,
                requested_name,
            });
        };

        let metadata = read_with_retry("metadata", &self.read_retry, || {
            provider.file_metadata(path, revision)
        })
        .await?;
        let total = metadata.size();
        let resolved = range.resolve(total)?;
        let native = provider.capabilities().ranged_reads;

        let stream = read_with_retry("download", &self.read_retry, || {
            provider.download(path, native.then_some(resolved), revision)
        })
        .await?;
        let stream = if native {
            stream
        } else {
            tracing::debug!(
                "[Pipeline] {} has no ranged reads, discarding bytes outside {:?}",
                provider.name(),
                resolved
            );
            stream.slice(resolved)
        };

        Ok(Download {
            stream: stream.cancel_on(cancel.clone()),
            range: Some(resolved),
            total,
            requested_name,
        })
    }
}

/// Write every chunk of `stream` to `sink`, returning the byte count.
///
/// A failed write means the client went away: the backend stream is dropped
/// with it and the failure is reported as `ConnectionAborted`.
pub async fn forward<W>(mut stream: ByteStream, sink: &mut W) -> Result<u64, ProviderError>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if let Err(e) = sink.write_all(&chunk).await {
            tracing::debug!("[Pipeline] Client closed after {} bytes: {}", written, e.kind());
            return Err(ProviderError::ConnectionAborted(format!(
                "client closed after {} bytes",
                written
            )));
        }
        written += chunk.len() as u64;
    }
    sink.flush()
        .await
        .map_err(|e| ProviderError::ConnectionAborted(format!("flush failed: {}", e.kind())))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        Capabilities, ErrorKind, MemoryFactory, MemoryOptions, MemoryStore, ProviderCredentials,
        ProviderFactory,
    };
    use crate::stream::StreamSize;
    use bytes::Bytes;
    use futures_util::stream;

    fn bind(store: &Arc<MemoryStore>, options: MemoryOptions) -> BoundProvider {
        let factory = MemoryFactory::new(store.clone(), options);
        let capabilities = factory.capabilities();
        BoundProvider::new(factory.bind(&ProviderCredentials::default()).unwrap(), capabilities)
    }

    fn pipeline(max: Option<u64>) -> Pipeline {
        Pipeline::new(
            PipelineConfig {
                max_upload_size: max,
                ..PipelineConfig::default()
            },
            ReadRetryConfig::default(),
        )
    }

    fn p(raw: &str) -> GatewayPath {
        GatewayPath::parse(raw, None).unwrap()
    }

    fn r#unsized(data: Vec<u8>, chunk: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes, ProviderError>> = data
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        ByteStream::new(stream::iter(chunks), StreamSize::Unsized)
    }

    fn flat() -> MemoryOptions {
        MemoryOptions {
            capabilities: Capabilities::default(),
            ..MemoryOptions::named("flat")
        }
    }

    #[tokio::test]
    async fn test_upload_reports_created_then_updated() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, MemoryOptions::named("memory"));
        let pipeline = pipeline(None);
        let token = CancellationToken::new();

        let first = pipeline
            .upload(&provider, &p("/a.txt"), ByteStream::from_bytes(&b"one"[..]), &token)
            .await
            .unwrap();
        assert!(first.created);
        let second = pipeline
            .upload(&provider, &p("/a.txt"), ByteStream::from_bytes(&b"two"[..]), &token)
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(store.get("/a.txt").as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn test_declared_oversize_rejected_before_reading() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, MemoryOptions::named("memory"));
        let body = ByteStream::new(stream::pending(), StreamSize::Known(10_000));
        let err = pipeline(Some(100))
            .upload(&provider, &p("/big.bin"), body, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(!store.contains("/big.bin"));
    }

    #[tokio::test]
    async fn test_unsized_oversize_leaves_nothing_on_non_atomic_backend() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, flat());
        let err = pipeline(Some(100))
            .upload(&provider, &p("/big.bin"), r#unsized(vec![1; 1000], 30), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadTooLarge);
        assert!(!store.contains("/big.bin"));
    }

    #[tokio::test]
    async fn test_size_hint_enforced_when_required() {
        let store = Arc::new(MemoryStore::new());
        let mut options = MemoryOptions::named("strict");
        options.capabilities.requires_size_hint = true;
        let provider = bind(&store, options);
        let token = CancellationToken::new();
        let pipeline = pipeline(None);

        let err = pipeline
            .upload(&provider, &p("/a.bin"), r#unsized(vec![1; 10], 4), &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let lying = ByteStream::new(
            stream::iter(vec![Ok::<_, ProviderError>(Bytes::from_static(b"short"))]),
            StreamSize::Known(50),
        );
        let err = pipeline.upload(&provider, &p("/a.bin"), lying, &token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(!store.contains("/a.bin"));
    }

    #[tokio::test]
    async fn test_cancelled_upload_is_aborted_and_cleaned() {
        let store = Arc::new(MemoryStore::new());
        let provider = bind(&store, flat());
        let token = CancellationToken::new();
        token.cancel();
        let body = ByteStream::new(
            stream::iter(vec![Ok::<_, ProviderError>(Bytes::from_static(b"abc"))])
                .chain(stream::pending()),
            StreamSize::Unsized,
        );
        let err = pipeline(None)
            .upload(&provider, &p("/c.bin"), body, &token)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
        assert!(!store.contains("/c.bin"));
    }

    #[tokio::test]
    async fn test_range_served_with_and_without_native_support() {
        let data: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();
        for options in [MemoryOptions::named("ranged"), flat()] {
            let store = Arc::new(MemoryStore::new());
            store.put("/file.bin", data.clone());
            let provider = bind(&store, options);
            let download = pipeline(None)
                .download(
                    &provider,
                    &p("/file.bin"),
                    Some(ByteRange::parse("bytes=100-199").unwrap()),
                    None,
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            assert_eq!(download.total, Some(1000));
            assert_eq!(download.content_range().as_deref(), Some("bytes 100-199/1000"));
            let body = download.stream.read_to_end().await.unwrap();
            assert_eq!(&body[..], &data[100..200]);
        }
    }

    #[tokio::test]
    async fn test_unsized_download_is_not_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.put("/a.txt", &b"hello"[..]);
        let provider = bind(
            &store,
            MemoryOptions {
                report_size: false,
                ..MemoryOptions::named("opaque")
            },
        );
        let download = pipeline(None)
            .download(&provider, &p("/a.txt"), None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(download.total, None);
        assert_eq!(download.display_name(), "a.txt");
        assert!(download.suggested_name().is_none());
        assert_eq!(&download.stream.read_to_end().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_forward_reports_client_disconnect() {
        let (mut client, server) = tokio::io::duplex(8);
        drop(server);
        let err = forward(ByteStream::from_bytes(vec![0u8; 64]), &mut client)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_forward_counts_bytes() {
        let mut sink = Vec::new();
        let written = forward(r#unsized(vec![9; 300], 64), &mut sink).await.unwrap();
        assert_eq!(written, 300);
        assert_eq!(sink.len(), 300);
    }

    #[test]
    fn test_validate_config_clamps_chunk_size() {
        let mut config = PipelineConfig {
            chunk_size: 1,
            ..PipelineConfig::default()
        };
        config.validate();
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
    }
}
