//! Content-addressed in-memory storage provider
//!
//! Blobs are stored once per sha256 digest; the namespace maps paths to
//! nodes, and every upload appends a version pointing at a blob, so the
//! digest doubles as the revision id.
//!
//! The provider's capabilities are configurable through `MemoryOptions`, so
//! one store can stand in for backends with very different feature sets
//! (native move or not, ranged reads or not, atomic uploads or not).

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{
    Capabilities, ProviderCredentials, ProviderError, ProviderFactory, Revision, StorageProvider,
};
use crate::metadata::{EntryKind, Metadata, MetadataResponse, HASH_MD5, HASH_SHA256};
use crate::path::{GatewayPath, PathRules};
use crate::stream::{ByteStream, ResolvedRange, StreamSize};

#[derive(Debug, Clone)]
struct Version {
    digest: String,
    md5: String,
    size: u64,
    modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Node {
    id: String,
    path: GatewayPath,
    versions: Vec<Version>,
    modified: DateTime<Utc>,
}

impl Node {
    fn new(path: GatewayPath) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path,
            versions: Vec::new(),
            modified: Utc::now(),
        }
    }

    fn kind(&self) -> EntryKind {
        if self.path.is_folder() {
            EntryKind::Folder
        } else {
            EntryKind::File
        }
    }

    fn version(&self, revision: Option<&str>) -> Option<&Version> {
        match revision {
            None => self.versions.last(),
            Some(rev) => self.versions.iter().rev().find(|v| v.digest == rev),
        }
    }
}

#[derive(Default)]
struct StoreState {
    blobs: HashMap<String, Bytes>,
    nodes: BTreeMap<String, Node>,
}

impl StoreState {
    fn ensure_folders(&mut self, path: &GatewayPath) {
        let mut current = path.parent();
        while let Some(folder) = current {
            let key = folder.to_string();
            if folder.is_root() || self.nodes.contains_key(&key) {
                break;
            }
            current = folder.parent();
            self.nodes.insert(key, Node::new(folder));
        }
    }

    fn children(&self, folder: &GatewayPath) -> Vec<&Node> {
        let depth = folder.depth() + 1;
        self.nodes
            .values()
            .filter(|n| n.path.depth() == depth && n.path.starts_with(folder))
            .collect()
    }

    fn subtree_keys(&self, root: &GatewayPath) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.path.starts_with(root))
            .map(|n| n.path.to_string())
            .collect()
    }

    fn commit(&mut self, path: &GatewayPath, data: Bytes, md5: String, digest: String) -> Node {
        self.ensure_folders(path);
        let size = data.len() as u64;
        self.blobs.entry(digest.clone()).or_insert(data);
        let now = Utc::now();
        let node = self
            .nodes
            .entry(path.to_string())
            .or_insert_with(|| Node::new(path.clone()));
        node.versions.push(Version {
            digest,
            md5,
            size,
            modified: now,
        });
        node.modified = now;
        node.clone()
    }
}

/// Shared content-addressed store; provider instances bind to it per request
pub struct MemoryStore {
    id: String,
    state: Mutex<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write a file directly, bypassing the provider contract (seeding)
    pub fn put(&self, path: &str, data: impl Into<Bytes>) {
        let Ok(path) = GatewayPath::parse(path, Some(false)) else {
            tracing::warn!("[Memory] Refusing to seed invalid path {}", path);
            return;
        };
        let data = data.into();
        let digest = hex::encode(Sha256::digest(&data));
        let md5 = hex::encode(Md5::digest(&data));
        self.state().commit(&path, data, md5, digest);
    }

    /// Current content of a file
    pub fn get(&self, path: &str) -> Option<Bytes> {
        let state = self.state();
        let node = state.nodes.get(path)?;
        let version = node.versions.last()?;
        state.blobs.get(&version.digest).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state().nodes.contains_key(path)
    }

    /// Every stored path, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state().nodes.keys().cloned().collect()
    }
}

/// Behaviour of a memory-backed provider
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    pub name: String,
    pub capabilities: Capabilities,
    pub rules: PathRules,
    /// Size of the chunks served by downloads
    pub chunk_size: usize,
    /// When false, sizes are hidden and downloads are unsized
    pub report_size: bool,
    /// When false, metadata carries no content hashes
    pub report_hashes: bool,
}

impl MemoryOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            capabilities: Capabilities {
                native_move: true,
                native_copy: true,
                ranged_reads: true,
                atomic_replace: true,
                revisions: true,
                ..Capabilities::default()
            },
            rules: PathRules::default(),
            chunk_size: 64 * 1024,
            report_size: true,
            report_hashes: true,
        }
    }
}

pub struct MemoryFactory {
    store: Arc<MemoryStore>,
    options: MemoryOptions,
}

impl MemoryFactory {
    pub fn new(store: Arc<MemoryStore>, options: MemoryOptions) -> Self {
        Self { store, options }
    }
}

impl ProviderFactory for MemoryFactory {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn capabilities(&self) -> Capabilities {
        self.options.capabilities
    }

    fn bind(
        &self,
        _credentials: &ProviderCredentials,
    ) -> Result<Box<dyn StorageProvider>, ProviderError> {
        Ok(Box::new(MemoryProvider {
            store: self.store.clone(),
            options: self.options.clone(),
        }))
    }
}

pub struct MemoryProvider {
    store: Arc<MemoryStore>,
    options: MemoryOptions,
}

impl MemoryProvider {
    pub fn new(store: Arc<MemoryStore>, options: MemoryOptions) -> Self {
        Self { store, options }
    }

    fn file_metadata(&self, node: &Node, version: &Version) -> Result<Metadata, ProviderError> {
        let mut meta = Metadata::file(&self.options.name, node.path.clone())?
            .with_etag(Some(version.digest[..16].to_string()))
            .with_modified(Some(version.modified))
            .with_content_type(
                mime_guess::from_path(node.path.name())
                    .first()
                    .map(|m| m.essence_str().to_string()),
            )
            .with_extra("id", node.id.clone())
            .with_extra("revision", version.digest.clone());
        if self.options.report_size {
            meta = meta.with_size(Some(version.size));
        }
        if self.options.report_hashes {
            meta = meta
                .with_hash(HASH_MD5, version.md5.clone())
                .with_hash(HASH_SHA256, version.digest.clone());
        }
        Ok(meta)
    }

    fn node_metadata(&self, node: &Node) -> Result<Metadata, ProviderError> {
        match (node.kind(), node.versions.last()) {
            (EntryKind::File, Some(version)) => self.file_metadata(node, version),
            _ => Ok(Metadata::folder(&self.options.name, node.path.clone())?
                .with_modified(Some(node.modified))
                .with_extra("id", node.id.clone())),
        }
    }

    fn relocate(
        &self,
        src: &GatewayPath,
        dest: &GatewayPath,
        keep_source: bool,
    ) -> Result<Metadata, ProviderError> {
        if src.is_folder() != dest.is_folder() {
            return Err(ProviderError::BadRequest(
                "source and destination must both be files or both be folders".to_string(),
            ));
        }
        let mut state = self.store.state();
        if !src.is_root() && !state.nodes.contains_key(&src.to_string()) {
            return Err(ProviderError::PathNotFound(src.to_string()));
        }
        if state.nodes.contains_key(&dest.to_string()) {
            return Err(ProviderError::DestinationConflict(dest.to_string()));
        }

        let keys = state.subtree_keys(src);
        let mut moved = Vec::with_capacity(keys.len());
        for key in keys {
            let node = if keep_source {
                state.nodes.get(&key).cloned()
            } else {
                state.nodes.remove(&key)
            };
            if let Some(node) = node {
                moved.push(node);
            }
        }

        state.ensure_folders(dest);
        let prefix = src.depth();
        for mut node in moved {
            let tail: Vec<String> = node.path.names().skip(prefix).map(str::to_string).collect();
            let new_path = GatewayPath::from_segments(
                dest.names().map(str::to_string).chain(tail),
                node.path.is_folder(),
            )?;
            if keep_source {
                node.id = Uuid::new_v4().to_string();
            }
            node.path = new_path;
            node.modified = Utc::now();
            state.nodes.insert(node.path.to_string(), node);
        }
        if dest.is_folder() && !state.nodes.contains_key(&dest.to_string()) {
            state.nodes.insert(dest.to_string(), Node::new(dest.clone()));
        }

        let node = state
            .nodes
            .get(&dest.to_string())
            .cloned()
            .ok_or_else(|| ProviderError::PathNotFound(dest.to_string()))?;
        drop(state);
        self.node_metadata(&node)
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn backend_id(&self) -> String {
        format!("memory:{}", self.store.id)
    }

    fn path_rules(&self) -> PathRules {
        self.options.rules.clone()
    }

    async fn resolve_identifier(
        &self,
        parent_id: Option<&str>,
        name: &str,
        is_folder: bool,
    ) -> Result<Option<String>, ProviderError> {
        let state = self.store.state();
        let parent_path = match parent_id {
            None => GatewayPath::root(),
            Some(id) => match state.nodes.values().find(|n| n.id == id) {
                Some(node) => node.path.clone(),
                None => return Ok(None),
            },
        };
        let candidate = parent_path.child(name, is_folder)?;
        Ok(state.nodes.get(&candidate.to_string()).map(|n| n.id.clone()))
    }

    async fn metadata(
        &self,
        path: &GatewayPath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse, ProviderError> {
        let state = self.store.state();
        if path.is_folder() {
            if !path.is_root() && !state.nodes.contains_key(&path.to_string()) {
                return Err(ProviderError::PathNotFound(path.to_string()));
            }
            let children: Vec<Node> = state.children(path).into_iter().cloned().collect();
            drop(state);
            let listing = children
                .iter()
                .map(|n| self.node_metadata(n))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(MetadataResponse::Listing(listing));
        }

        let node = state
            .nodes
            .get(&path.to_string())
            .cloned()
            .ok_or_else(|| ProviderError::PathNotFound(path.to_string()))?;
        drop(state);
        let version = node
            .version(revision)
            .ok_or_else(|| ProviderError::PathNotFound(format!("{} at revision {:?}", path, revision)))?;
        Ok(MetadataResponse::Entry(self.file_metadata(&node, version)?))
    }

    async fn download(
        &self,
        path: &GatewayPath,
        range: Option<ResolvedRange>,
        revision: Option<&str>,
    ) -> Result<ByteStream, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::BadRequest(format!("{} is a folder", path)));
        }
        let data = {
            let state = self.store.state();
            let node = state
                .nodes
                .get(&path.to_string())
                .ok_or_else(|| ProviderError::PathNotFound(path.to_string()))?;
            let version = node
                .version(revision)
                .ok_or_else(|| ProviderError::PathNotFound(path.to_string()))?;
            state
                .blobs
                .get(&version.digest)
                .cloned()
                .ok_or_else(|| ProviderError::Backend(format!("missing blob for {}", path)))?
        };

        let data = match range {
            Some(range) => {
                let start = (range.start as usize).min(data.len());
                let end = range
                    .end
                    .map(|e| (e as usize).saturating_add(1).min(data.len()))
                    .unwrap_or(data.len());
                data.slice(start..end.max(start))
            }
            None => data,
        };

        let size = if self.options.report_size || range.is_some() {
            StreamSize::Known(data.len() as u64)
        } else {
            StreamSize::Unsized
        };
        let chunk_size = self.options.chunk_size.max(1);
        let chunks: Vec<Result<Bytes, ProviderError>> = (0..data.len())
            .step_by(chunk_size)
            .map(|offset| Ok(data.slice(offset..(offset + chunk_size).min(data.len()))))
            .collect();
        Ok(ByteStream::new(stream::iter(chunks), size))
    }

    async fn upload(
        &self,
        path: &GatewayPath,
        mut stream: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<Metadata, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::BadRequest(format!("cannot upload to folder {}", path)));
        }
        if self.options.capabilities.requires_size_hint && size_hint.is_none() {
            return Err(ProviderError::BadRequest(format!(
                "{} needs the content length up front",
                self.options.name
            )));
        }
        if self.store.contains(&format!("{}/", path)) {
            return Err(ProviderError::DestinationConflict(format!("{}/", path)));
        }

        let mut buf = BytesMut::new();
        let mut md5 = Md5::new();
        let mut sha = Sha256::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    md5.update(&chunk);
                    sha.update(&chunk);
                    buf.extend_from_slice(&chunk);
                }
                Err(e) => {
                    if !self.options.capabilities.atomic_replace && !buf.is_empty() {
                        tracing::debug!(
                            "[Memory] Upload to {} interrupted after {} bytes, partial object kept",
                            path,
                            buf.len()
                        );
                        self.store.state().commit(
                            path,
                            buf.freeze(),
                            hex::encode(md5.finalize()),
                            hex::encode(sha.finalize()),
                        );
                    }
                    return Err(e);
                }
            }
        }

        let node = self.store.state().commit(
            path,
            buf.freeze(),
            hex::encode(md5.finalize()),
            hex::encode(sha.finalize()),
        );
        let version = node
            .versions
            .last()
            .ok_or_else(|| ProviderError::Backend(format!("no version recorded for {}", path)))?;
        self.file_metadata(&node, version)
    }

    async fn delete(&self, path: &GatewayPath) -> Result<(), ProviderError> {
        let mut state = self.store.state();
        if !path.is_root() && !state.nodes.contains_key(&path.to_string()) {
            return Err(ProviderError::PathNotFound(path.to_string()));
        }
        for key in state.subtree_keys(path) {
            state.nodes.remove(&key);
        }
        Ok(())
    }

    async fn create_folder(&self, path: &GatewayPath) -> Result<Metadata, ProviderError> {
        if path.is_file() {
            return Err(ProviderError::BadRequest(format!("{} is not a folder path", path)));
        }
        let node = {
            let mut state = self.store.state();
            let key = path.to_string();
            if path.is_root() || state.nodes.contains_key(&key) {
                return Err(ProviderError::DestinationConflict(key));
            }
            state.ensure_folders(path);
            let node = Node::new(path.clone());
            state.nodes.insert(key, node.clone());
            node
        };
        self.node_metadata(&node)
    }

    async fn revisions(&self, path: &GatewayPath) -> Result<Vec<Revision>, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::BadRequest("folders have no revisions".to_string()));
        }
        let state = self.store.state();
        let node = state
            .nodes
            .get(&path.to_string())
            .ok_or_else(|| ProviderError::PathNotFound(path.to_string()))?;
        Ok(node
            .versions
            .iter()
            .rev()
            .map(|v| Revision {
                id: v.digest.clone(),
                modified: Some(v.modified),
                size: Some(v.size),
                extra: serde_json::Map::new(),
            })
            .collect())
    }

    async fn native_move(
        &self,
        src: &GatewayPath,
        dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        self.relocate(src, dest, false)
    }

    async fn native_copy(
        &self,
        src: &GatewayPath,
        dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        self.relocate(src, dest, true)
    }
}
