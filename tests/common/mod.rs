//! Shared fixtures: a gateway over memory stores plus a provider that fails on purpose

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use storage_gateway::metadata::{Metadata, MetadataResponse};
use storage_gateway::path::PathRules;
use storage_gateway::providers::{
    Capabilities, MemoryFactory, MemoryOptions, MemoryProvider, MemoryStore, ProviderCredentials,
    ProviderError, ProviderFactory, ProviderRegistry, Revision, StorageProvider,
};
use storage_gateway::stream::{ByteStream, ResolvedRange, StreamSize};
use storage_gateway::{Gateway, GatewayConfig, GatewayPath, RequestPath};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// Keep the first n bytes of an upload, then fail
    FailUploadAfter(usize),
    /// Serve every byte inverted
    CorruptDownload,
    /// Serve the first n bytes of a download, then fail mid-stream
    FailDownloadAfter(usize),
    /// The first n metadata calls find the backend unavailable
    FlakyMetadata(usize),
    FailDelete,
    /// Files sit exactly n segments deep with only folders above them, like
    /// a repository of datasets. Anything else does not exist.
    FixedDepth(usize),
}

pub struct FaultyFactory {
    name: String,
    store: Arc<MemoryStore>,
    fault: Fault,
    metadata_calls: Arc<AtomicUsize>,
}

impl FaultyFactory {
    pub fn new(name: &str, store: Arc<MemoryStore>, fault: Fault) -> Self {
        Self {
            name: name.to_string(),
            store,
            fault,
            metadata_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ProviderFactory for FaultyFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn bind(&self, _credentials: &ProviderCredentials) -> Result<Box<dyn StorageProvider>, ProviderError> {
        let mut options = MemoryOptions::named(&self.name);
        options.capabilities = Capabilities::default();
        Ok(Box::new(FaultyProvider {
            inner: MemoryProvider::new(self.store.clone(), options),
            fault: self.fault,
            metadata_calls: self.metadata_calls.clone(),
        }))
    }
}

struct FaultyProvider {
    inner: MemoryProvider,
    fault: Fault,
    metadata_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StorageProvider for FaultyProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn backend_id(&self) -> String {
        self.inner.backend_id()
    }

    fn path_rules(&self) -> PathRules {
        self.inner.path_rules()
    }

    async fn validate_path(&self, path: &GatewayPath) -> Result<GatewayPath, ProviderError> {
        let path = self.inner.validate_path(path).await?;
        if let Fault::FixedDepth(depth) = self.fault {
            let misplaced = if path.is_folder() {
                path.depth() >= depth
            } else {
                path.depth() != depth
            };
            if misplaced {
                return Err(ProviderError::PathNotFound(path.to_string()));
            }
        }
        Ok(path)
    }

    async fn metadata(&self, path: &GatewayPath, revision: Option<&str>) -> Result<MetadataResponse, ProviderError> {
        if let Fault::FlakyMetadata(failures) = self.fault {
            if self.metadata_calls.fetch_add(1, Ordering::SeqCst) < failures {
                return Err(ProviderError::BackendUnavailable("metadata timed out".into()));
            }
        }
        self.inner.metadata(path, revision).await
    }

    async fn download(
        &self,
        path: &GatewayPath,
        range: Option<ResolvedRange>,
        revision: Option<&str>,
    ) -> Result<ByteStream, ProviderError> {
        let stream = self.inner.download(path, range, revision).await?;
        match self.fault {
            Fault::CorruptDownload => {
                let data = stream.read_to_end().await?;
                let flipped: Vec<u8> = data.iter().map(|b| !b).collect();
                Ok(ByteStream::from_bytes(flipped))
            }
            Fault::FailDownloadAfter(limit) => {
                let data = stream.read_to_end().await?;
                let size = StreamSize::Known(data.len() as u64);
                let items = vec![
                    Ok(data.slice(..limit.min(data.len()))),
                    Err(ProviderError::BackendUnavailable("connection reset mid-stream".into())),
                ];
                Ok(ByteStream::new(stream::iter(items), size))
            }
            _ => Ok(stream),
        }
    }

    async fn upload(
        &self,
        path: &GatewayPath,
        stream: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<Metadata, ProviderError> {
        let Fault::FailUploadAfter(limit) = self.fault else {
            return self.inner.upload(path, stream, size_hint).await;
        };
        let mut kept = Vec::new();
        let mut chunks = stream.into_inner();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            let room = limit.saturating_sub(kept.len());
            kept.extend_from_slice(&chunk[..room.min(chunk.len())]);
            if kept.len() >= limit {
                break;
            }
        }
        // Leave a partial object behind, as a non-atomic backend would
        self.inner
            .upload(path, ByteStream::from_bytes(Bytes::from(kept)), None)
            .await?;
        Err(ProviderError::BackendUnavailable("connection reset by backend".into()))
    }

    async fn delete(&self, path: &GatewayPath) -> Result<(), ProviderError> {
        if self.fault == Fault::FailDelete {
            return Err(ProviderError::BackendUnavailable("delete refused".into()));
        }
        self.inner.delete(path).await
    }

    async fn create_folder(&self, path: &GatewayPath) -> Result<Metadata, ProviderError> {
        self.inner.create_folder(path).await
    }

    async fn revisions(&self, path: &GatewayPath) -> Result<Vec<Revision>, ProviderError> {
        self.inner.revisions(path).await
    }
}

/// Two independent stores:
///
/// * `mem` and `flat` share store `a`; `mem` declares every capability,
///   `flat` none (no native ops, no ranges, unsized downloads, no hashes)
/// * `other` is a fully capable provider over store `b`
pub struct Fixture {
    pub a: Arc<MemoryStore>,
    pub b: Arc<MemoryStore>,
    pub registry: ProviderRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        let a = Arc::new(MemoryStore::new());
        let b = Arc::new(MemoryStore::new());
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryFactory::new(a.clone(), MemoryOptions::named("mem"))));
        registry.register(Arc::new(MemoryFactory::new(a.clone(), flat_options("flat"))));
        registry.register(Arc::new(MemoryFactory::new(b.clone(), MemoryOptions::named("other"))));
        Self { a, b, registry }
    }

    pub fn with_faulty(mut self, name: &str, on_b: bool, fault: Fault) -> Self {
        let store = if on_b { self.b.clone() } else { self.a.clone() };
        self.registry
            .register(Arc::new(FaultyFactory::new(name, store, fault)));
        self
    }

    pub fn gateway(self, config: &GatewayConfig) -> (Gateway, Arc<MemoryStore>, Arc<MemoryStore>) {
        (Gateway::new(self.registry, config, None), self.a, self.b)
    }
}

pub fn flat_options(name: &str) -> MemoryOptions {
    let mut options = MemoryOptions::named(name);
    options.capabilities = Capabilities::default();
    options.report_size = false;
    options.report_hashes = false;
    options
}

pub fn req(raw: &str) -> RequestPath {
    RequestPath::parse(raw).unwrap()
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
