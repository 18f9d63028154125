//! Storage Providers Module
//!
//! This module provides the capability contract every storage backend plugin
//! implements. The engine only ever talks to `StorageProvider`; plugins are
//! registered by name in a `ProviderRegistry` together with the optional
//! operations they support.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │           StorageProvider Trait             │
//! │  metadata, download, upload, delete, ...    │
//! └─────────────────────────────────────────────┘
//!                      │
//!           ┌──────────┴──────────┐
//!           ▼                     ▼
//!      ┌─────────┐          ┌──────────┐
//!      │ Memory  │          │  WebDAV  │
//!      └─────────┘          └──────────┘
//! ```

pub mod memory;
pub mod retry;
pub mod types;
pub mod webdav;

pub use memory::{MemoryFactory, MemoryOptions, MemoryProvider, MemoryStore};
pub use types::*;
pub use webdav::{WebDavFactory, WebDavProvider};

use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::metadata::{Metadata, MetadataResponse};
use crate::path::{GatewayPath, PathRules};
use crate::stream::{ByteStream, ResolvedRange};

/// Unified storage provider trait
///
/// An instance is bound to one set of request-scoped credentials and is never
/// shared between requests. Every method must reject a malformed path before
/// contacting the backend.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Registered provider name
    fn name(&self) -> &str;

    /// Identity of the backend this instance talks to. Two instances with the
    /// same id can relocate objects between each other natively.
    fn backend_id(&self) -> String;

    /// Naming rules applied by the default `validate_path`
    fn path_rules(&self) -> PathRules {
        PathRules::default()
    }

    /// Provider-specific validation; returns the validated path
    async fn validate_path(&self, path: &GatewayPath) -> Result<GatewayPath, ProviderError> {
        path.validate(&self.path_rules())
    }

    /// Backend id of `name` inside the folder `parent_id` (`None` = root)
    async fn resolve_identifier(
        &self,
        _parent_id: Option<&str>,
        _name: &str,
        _is_folder: bool,
    ) -> Result<Option<String>, ProviderError> {
        Err(ProviderError::NotSupported("resolve_identifier".to_string()))
    }

    /// File record, or the children of a folder
    async fn metadata(
        &self,
        path: &GatewayPath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse, ProviderError>;

    /// Stream a file. `range` is only passed to providers declaring `ranged_reads`.
    async fn download(
        &self,
        path: &GatewayPath,
        range: Option<ResolvedRange>,
        revision: Option<&str>,
    ) -> Result<ByteStream, ProviderError>;

    /// Consume `stream` into the file at `path`
    async fn upload(
        &self,
        path: &GatewayPath,
        stream: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<Metadata, ProviderError>;

    /// Delete a file, or a folder with everything below it
    async fn delete(&self, path: &GatewayPath) -> Result<(), ProviderError>;

    async fn create_folder(&self, path: &GatewayPath) -> Result<Metadata, ProviderError>;

    async fn revisions(&self, _path: &GatewayPath) -> Result<Vec<Revision>, ProviderError> {
        Err(ProviderError::NotSupported("revisions".to_string()))
    }

    /// Relocate inside this backend (providers declaring `native_move`)
    async fn native_move(
        &self,
        _src: &GatewayPath,
        _dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        Err(ProviderError::NotSupported("move".to_string()))
    }

    /// Duplicate inside this backend (providers declaring `native_copy`)
    async fn native_copy(
        &self,
        _src: &GatewayPath,
        _dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        Err(ProviderError::NotSupported("copy".to_string()))
    }
}

/// Builds provider instances bound to request credentials
pub trait ProviderFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Optional operations, declared once at registration
    fn capabilities(&self) -> Capabilities;

    fn bind(
        &self,
        credentials: &ProviderCredentials,
    ) -> Result<Box<dyn StorageProvider>, ProviderError>;
}

struct RegisteredProvider {
    factory: Arc<dyn ProviderFactory>,
    capabilities: Capabilities,
}

/// Provider plugins known to the gateway, by name
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, RegisteredProvider>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ProviderFactory>) {
        let name = factory.name().to_string();
        let capabilities = factory.capabilities();
        tracing::info!("[Registry] Registered provider '{}': {:?}", name, capabilities);
        self.providers.insert(
            name,
            RegisteredProvider {
                factory,
                capabilities,
            },
        );
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn capabilities(&self, name: &str) -> Option<Capabilities> {
        self.providers.get(name).map(|p| p.capabilities)
    }

    /// Bind the named provider to request-scoped credentials
    pub fn bind(
        &self,
        name: &str,
        credentials: &ProviderCredentials,
    ) -> Result<BoundProvider, ProviderError> {
        let registered = self
            .providers
            .get(name)
            .ok_or_else(|| ProviderError::PathNotFound(format!("provider '{}'", name)))?;
        let inner = registered.factory.bind(credentials)?;
        Ok(BoundProvider {
            inner,
            capabilities: registered.capabilities,
        })
    }
}

/// A provider instance plus the capabilities it was registered with
pub struct BoundProvider {
    inner: Box<dyn StorageProvider>,
    capabilities: Capabilities,
}

impl Deref for BoundProvider {
    type Target = dyn StorageProvider;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl BoundProvider {
    pub fn new(inner: Box<dyn StorageProvider>, capabilities: Capabilities) -> Self {
        Self {
            inner,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// True when native relocation between `self` and `other` is possible
    pub fn same_backend(&self, other: &BoundProvider) -> bool {
        self.inner.name() == other.inner.name() && self.inner.backend_id() == other.inner.backend_id()
    }

    pub fn ensure_writable(&self, operation: &str) -> Result<(), ProviderError> {
        if self.capabilities.writable {
            Ok(())
        } else {
            Err(ProviderError::NotSupported(format!(
                "{} on read-only provider '{}'",
                operation,
                self.inner.name()
            )))
        }
    }

    /// Validate `path` and, for id-addressed providers, resolve its
    /// identifier path. `must_exist = false` lets the final segment be new.
    pub async fn validate(
        &self,
        path: &GatewayPath,
        must_exist: bool,
    ) -> Result<GatewayPath, ProviderError> {
        let validated = self.inner.validate_path(path).await?;
        if !self.capabilities.identifier_addressed || validated.is_root() {
            return Ok(validated);
        }
        match self.resolve_identifiers(&validated).await {
            Ok(resolved) => resolved.validate(&self.inner.path_rules()),
            Err(ProviderError::PathNotFound(_)) if !must_exist => {
                let parent = validated.parent().unwrap_or_else(GatewayPath::root);
                let parent = self.resolve_identifiers(&parent).await?;
                parent
                    .child(validated.name(), validated.is_folder())?
                    .validate(&self.inner.path_rules())
            }
            Err(e) => Err(e),
        }
    }

    /// Resolve every segment to its backend id, failing with `PathNotFound`
    /// at the first segment that does not exist
    pub async fn resolve_identifiers(
        &self,
        path: &GatewayPath,
    ) -> Result<GatewayPath, ProviderError> {
        let names: Vec<&str> = path.names().collect();
        let mut ids = Vec::with_capacity(names.len());
        let mut parent: Option<String> = None;
        for (i, name) in names.iter().enumerate() {
            let is_folder = i + 1 < names.len() || path.is_folder();
            let id = self
                .inner
                .resolve_identifier(parent.as_deref(), name, is_folder)
                .await?
                .ok_or_else(|| {
                    let mut prefix = format!("/{}", names[..=i].join("/"));
                    if is_folder {
                        prefix.push('/');
                    }
                    ProviderError::PathNotFound(prefix)
                })?;
            parent = Some(id.clone());
            ids.push(id);
        }
        path.with_identifiers(ids)
    }

    /// Whether anything exists at `path`
    pub async fn exists(&self, path: &GatewayPath) -> Result<bool, ProviderError> {
        match self.inner.metadata(path, None).await {
            Ok(_) => Ok(true),
            Err(ProviderError::PathNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Metadata of a single file
    pub async fn file_metadata(
        &self,
        path: &GatewayPath,
        revision: Option<&str>,
    ) -> Result<Metadata, ProviderError> {
        self.inner
            .metadata(path, revision)
            .await?
            .into_entry()
            .ok_or_else(|| ProviderError::BadRequest(format!("{} is not a file", path)))
    }

    /// Children of a folder
    pub async fn list(&self, path: &GatewayPath) -> Result<Vec<Metadata>, ProviderError> {
        self.inner
            .metadata(path, None)
            .await?
            .into_listing()
            .ok_or_else(|| ProviderError::BadRequest(format!("{} is not a folder", path)))
    }
}
