//! Canonical metadata records and backend-response normalizers
//!
//! Normalizers map a backend-native response shape into `Metadata`. Missing
//! optional fields (hash, modified time, links) are omitted, never filled in
//! with defaults, and no hash is ever computed here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::path::GatewayPath;
use crate::providers::ProviderError;

pub const HASH_MD5: &str = "md5";
pub const HASH_SHA256: &str = "sha256";

const DAV_FOLDER_CONTENT_TYPE: &str = "httpd/unix-directory";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

/// Normalized description of a file or folder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    kind: EntryKind,
    provider: String,
    name: String,
    path: GatewayPath,
    size: Option<u64>,
    #[serde(default)]
    hashes: BTreeMap<String, String>,
    etag: Option<String>,
    modified: Option<DateTime<Utc>>,
    content_type: Option<String>,
    #[serde(default)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl Metadata {
    fn empty(kind: EntryKind, provider: &str, path: GatewayPath) -> Self {
        Self {
            kind,
            provider: provider.to_string(),
            name: path.name().to_string(),
            path,
            size: None,
            hashes: BTreeMap::new(),
            etag: None,
            modified: None,
            content_type: None,
            extra: serde_json::Map::new(),
        }
    }

    /// File record; the path must be a file path
    pub fn file(provider: &str, path: GatewayPath) -> Result<Self, ProviderError> {
        if path.is_folder() {
            return Err(ProviderError::invalid_path(
                path.to_string(),
                "file metadata needs a file path",
            ));
        }
        Ok(Self::empty(EntryKind::File, provider, path))
    }

    /// Folder record; the path must be a folder path
    pub fn folder(provider: &str, path: GatewayPath) -> Result<Self, ProviderError> {
        if path.is_file() {
            return Err(ProviderError::invalid_path(
                path.to_string(),
                "folder metadata needs a folder path",
            ));
        }
        Ok(Self::empty(EntryKind::Folder, provider, path))
    }

    /// Ignored for folders
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        if self.kind == EntryKind::File {
            self.size = size;
        }
        self
    }

    /// Ignored for folders
    pub fn with_hash(mut self, algorithm: &str, value: impl Into<String>) -> Self {
        if self.kind == EntryKind::File {
            self.hashes.insert(algorithm.to_string(), value.into());
        }
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_content_type(mut self, content_type: Option<String>) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Display name, when the backend names the object differently from the path
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &GatewayPath {
        &self.path
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn hashes(&self) -> &BTreeMap<String, String> {
        &self.hashes
    }

    pub fn hash(&self, algorithm: &str) -> Option<&str> {
        self.hashes.get(algorithm).map(|s| s.as_str())
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        self.modified
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }
}

/// Result of a metadata call: one entry for files, a listing for folders
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetadataResponse {
    Entry(Metadata),
    Listing(Vec<Metadata>),
}

impl MetadataResponse {
    pub fn into_entry(self) -> Option<Metadata> {
        match self {
            MetadataResponse::Entry(m) => Some(m),
            MetadataResponse::Listing(_) => None,
        }
    }

    pub fn into_listing(self) -> Option<Vec<Metadata>> {
        match self {
            MetadataResponse::Listing(children) => Some(children),
            MetadataResponse::Entry(_) => None,
        }
    }
}

/// Strip quotes and the weak-validator prefix from an etag header value
pub fn clean_etag(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("W/").unwrap_or(trimmed);
    let trimmed = trimmed.trim_matches('"');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Parse an HTTP date (RFC 2822 / RFC 1123) or an RFC 3339 timestamp
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| tracing::debug!("[Metadata] Unparseable timestamp: {}", raw))
        .ok()
}

// ---------------------------------------------------------------------------
// WebDAV (ownCloud / Nextcloud) PROPFIND entries
// ---------------------------------------------------------------------------

/// One `<response>` element of a PROPFIND multistatus body
#[derive(Debug, Clone, Default)]
pub struct DavEntry {
    /// Decoded href, e.g. `/remote.php/webdav/docs/a.txt`
    pub href: String,
    pub is_collection: bool,
    /// Property local name (`getetag`, `getcontentlength`, ...) to text
    pub properties: HashMap<String, String>,
}

/// Normalize a PROPFIND entry found under `root_href` (the DAV root folder)
pub fn normalize_dav(
    provider: &str,
    root_href: &str,
    entry: &DavEntry,
) -> Result<Metadata, ProviderError> {
    let root = root_href.trim_end_matches('/');
    let relative = entry.href.strip_prefix(root).unwrap_or(&entry.href);
    let mut relative = if relative.starts_with('/') {
        relative.to_string()
    } else {
        format!("/{}", relative)
    };
    if entry.is_collection && !relative.ends_with('/') {
        relative.push('/');
    }
    if !entry.is_collection {
        relative = relative.trim_end_matches('/').to_string();
    }

    let path = GatewayPath::parse(&relative, None)?;
    let prop = |name: &str| entry.properties.get(name).map(|s| s.as_str());

    let etag = prop("getetag").and_then(clean_etag);
    let modified = prop("getlastmodified").and_then(parse_timestamp);

    let metadata = if entry.is_collection {
        Metadata::folder(provider, path)?.with_content_type(Some(
            prop("getcontenttype")
                .unwrap_or(DAV_FOLDER_CONTENT_TYPE)
                .to_string(),
        ))
    } else {
        let size = prop("getcontentlength").and_then(|s| s.trim().parse::<u64>().ok());
        Metadata::file(provider, path)?
            .with_size(size)
            .with_content_type(prop("getcontenttype").map(str::to_string))
    };

    Ok(metadata.with_etag(etag).with_modified(modified))
}

// ---------------------------------------------------------------------------
// Object-store listing entries
// ---------------------------------------------------------------------------

/// Key-addressed listing entry (S3-style)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Console URL for the object, when the backend exposes one
    pub web_view: Option<String>,
}

/// A single-part upload etag is the md5 of the content; multipart etags
/// (`<hex>-<parts>`) are not content hashes.
fn etag_as_md5(etag: &str) -> Option<&str> {
    if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(etag)
    } else {
        None
    }
}

pub fn normalize_object(provider: &str, entry: &ObjectEntry) -> Result<Metadata, ProviderError> {
    let path = GatewayPath::parse(&format!("/{}", entry.key.trim_start_matches('/')), None)?;
    let etag = entry.etag.as_deref().and_then(clean_etag);
    let modified = entry.last_modified.as_deref().and_then(parse_timestamp);

    let mut metadata = if path.is_folder() {
        Metadata::folder(provider, path)?
    } else {
        let mut file = Metadata::file(provider, path)?.with_size(entry.size);
        if let Some(md5) = etag.as_deref().and_then(etag_as_md5) {
            file = file.with_hash(HASH_MD5, md5.to_lowercase());
        }
        file.with_content_type(
            mime_guess::from_path(&entry.key)
                .first()
                .map(|m| m.essence_str().to_string()),
        )
    };
    if let Some(link) = &entry.web_view {
        metadata = metadata.with_extra("web_view", link.clone());
    }

    Ok(metadata.with_etag(etag).with_modified(modified))
}
