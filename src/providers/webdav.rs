//! WebDAV Storage Provider
//!
//! Implementation of the StorageProvider trait for WebDAV servers
//! (Nextcloud, ownCloud, Synology, Apache mod_dav, ...).
//!
//! WebDAV extends HTTP with PROPFIND, MKCOL, MOVE and COPY, which gives us
//! native relocation inside one server. PROPFIND responses are normalized
//! through `metadata::normalize_dav`.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Body, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::time::Duration;

use super::retry::{send_with_retry, HttpRetryConfig};
use super::{Capabilities, ProviderCredentials, ProviderError, ProviderFactory, StorageProvider};
use crate::metadata::{normalize_dav, DavEntry, Metadata, MetadataResponse};
use crate::path::{GatewayPath, PathRules};
use crate::stream::{ByteStream, ResolvedRange, StreamSize};

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:resourcetype/>
        <d:getcontentlength/>
        <d:getcontenttype/>
        <d:getetag/>
        <d:getlastmodified/>
    </d:prop>
</d:propfind>"#;

/// Properties copied from each `<response>` into `DavEntry::properties`
const DAV_PROPERTIES: [&str; 4] = [
    "getcontentlength",
    "getcontenttype",
    "getetag",
    "getlastmodified",
];

/// Custom HTTP methods for WebDAV
mod webdav_methods {
    use super::ProviderError;
    use reqwest::Method;

    fn method(name: &'static str) -> Result<Method, ProviderError> {
        Method::from_bytes(name.as_bytes())
            .map_err(|_| ProviderError::Backend(format!("invalid HTTP method {}", name)))
    }

    pub fn propfind() -> Result<Method, ProviderError> {
        method("PROPFIND")
    }

    pub fn mkcol() -> Result<Method, ProviderError> {
        method("MKCOL")
    }

    pub fn copy() -> Result<Method, ProviderError> {
        method("COPY")
    }

    pub fn move_method() -> Result<Method, ProviderError> {
        method("MOVE")
    }
}

/// Registers WebDAV under a provider name. Each bind reads the server URL
/// from the `url` setting and `username` / `password` from the credentials.
pub struct WebDavFactory {
    name: String,
    client: Client,
    retry: HttpRetryConfig,
}

impl WebDavFactory {
    pub fn new(name: &str, timeout: Duration, retry: HttpRetryConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Backend(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            name: name.to_string(),
            client,
            retry,
        })
    }
}

impl ProviderFactory for WebDavFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            native_move: true,
            native_copy: true,
            ranged_reads: true,
            ..Capabilities::default()
        }
    }

    fn bind(
        &self,
        credentials: &ProviderCredentials,
    ) -> Result<Box<dyn StorageProvider>, ProviderError> {
        let url = credentials
            .setting_str("url")
            .ok_or_else(|| ProviderError::BadRequest("WebDAV needs a 'url' setting".to_string()))?;
        let parsed = url::Url::parse(url)
            .map_err(|e| ProviderError::BadRequest(format!("invalid WebDAV url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderError::BadRequest(format!(
                "unsupported WebDAV scheme '{}'",
                parsed.scheme()
            )));
        }

        Ok(Box::new(WebDavProvider {
            name: self.name.clone(),
            client: self.client.clone(),
            base_url: url.trim_end_matches('/').to_string(),
            root_href: parsed.path().to_string(),
            username: credentials.credential("username").unwrap_or_default().to_string(),
            password: SecretString::from(
                credentials.credential("password").unwrap_or_default().to_string(),
            ),
            retry: self.retry.clone(),
        }))
    }
}

/// WebDAV Storage Provider
pub struct WebDavProvider {
    name: String,
    client: Client,
    /// Server URL without trailing slash
    base_url: String,
    /// Path component of `base_url`, the prefix of every href
    root_href: String,
    username: String,
    password: SecretString,
    retry: HttpRetryConfig,
}

impl WebDavProvider {
    /// Build full URL for a path
    fn build_url(&self, path: &GatewayPath) -> String {
        let mut url = self.base_url.clone();
        for name in path.names() {
            url.push('/');
            url.push_str(&urlencoding::encode(name));
        }
        if path.is_folder() {
            url.push('/');
        }
        url
    }

    /// Make an authenticated request
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(self.password.expose_secret()))
    }

    async fn propfind(
        &self,
        path: &GatewayPath,
        depth: &str,
    ) -> Result<Vec<DavEntry>, ProviderError> {
        let request = self
            .request(webdav_methods::propfind()?, &self.build_url(path))
            .header("Depth", depth)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(PROPFIND_BODY)
            .build()
            .map_err(|e| ProviderError::from_transport("PROPFIND", &e))?;

        let response = send_with_retry(&self.client, request, &self.retry)
            .await
            .map_err(|e| ProviderError::from_transport("PROPFIND", &e))?;

        match response.status() {
            StatusCode::OK | StatusCode::MULTI_STATUS => {
                let xml = response
                    .text()
                    .await
                    .map_err(|e| ProviderError::from_transport("PROPFIND", &e))?;
                let entries = parse_multistatus(&xml)?;
                tracing::debug!("[WebDAV] PROPFIND {} returned {} entries", path, entries.len());
                Ok(entries)
            }
            status => Err(status_error("PROPFIND", path, status)),
        }
    }

    /// Metadata of exactly `path`
    async fn stat(&self, path: &GatewayPath) -> Result<Metadata, ProviderError> {
        let entries = self.propfind(path, "0").await?;
        let entry = entries
            .first()
            .ok_or_else(|| ProviderError::PathNotFound(path.to_string()))?;
        if entry.is_collection != path.is_folder() {
            return Err(ProviderError::PathNotFound(path.to_string()));
        }
        normalize_dav(&self.name, &self.root_href, entry)
    }

    async fn relocate(
        &self,
        method: Method,
        src: &GatewayPath,
        dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        let op = method.to_string();
        let response = self
            .request(method, &self.build_url(src))
            .header("Destination", self.build_url(dest))
            .header("Overwrite", "F")
            .send()
            .await
            .map_err(|e| ProviderError::from_transport(&op, &e))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                tracing::info!("[WebDAV] {} {} -> {}", op, src, dest);
                self.stat(dest).await
            }
            StatusCode::PRECONDITION_FAILED => Err(ProviderError::DestinationConflict(dest.to_string())),
            StatusCode::CONFLICT => Err(missing_parent(dest)),
            status => Err(status_error(&op, src, status)),
        }
    }
}

fn missing_parent(path: &GatewayPath) -> ProviderError {
    let parent = path.parent().unwrap_or_else(GatewayPath::root);
    ProviderError::PathNotFound(parent.to_string())
}

/// Map an unexpected status to the gateway error taxonomy
fn status_error(op: &str, path: &GatewayPath, status: StatusCode) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::PathNotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AuthenticationRejected(format!("{} {} rejected credentials ({})", op, path, status))
        }
        StatusCode::RANGE_NOT_SATISFIABLE => {
            ProviderError::InvalidRange(format!("{} not satisfiable", path))
        }
        StatusCode::INSUFFICIENT_STORAGE => {
            ProviderError::Backend("Insufficient storage space".to_string())
        }
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            ProviderError::BackendUnavailable(format!("{} {} failed with status {}", op, path, s))
        }
        s => ProviderError::Backend(format!("{} {} failed with status {}", op, path, s)),
    }
}

/// Parse a PROPFIND multistatus body into one `DavEntry` per `<response>`.
///
/// Servers disagree on namespace prefixes (`d:`, `D:`, `lp1:`, none), so
/// matching is done on local names only.
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, ProviderError> {
    let response_pattern = regex::Regex::new(
        r"(?s)<(?:[a-zA-Z0-9_]+:)?response[^>]*>(.*?)</(?:[a-zA-Z0-9_]+:)?response>",
    )
    .map_err(|e| ProviderError::Backend(e.to_string()))?;

    let mut entries = Vec::new();
    for cap in response_pattern.captures_iter(xml) {
        let Some(content) = cap.get(1).map(|m| m.as_str()) else {
            continue;
        };
        let Some(href) = extract_tag_content(content, "href") else {
            tracing::warn!("[WebDAV] No href found in response element");
            continue;
        };

        // Some servers answer with absolute URLs
        let href_path = match url::Url::parse(&href) {
            Ok(absolute) => absolute.path().to_string(),
            Err(_) => href.clone(),
        };
        let decoded = urlencoding::decode(&href_path)
            .map(|s| s.into_owned())
            .unwrap_or(href_path);

        // Koofr: <D:collection xmlns:D="DAV:"/>, Nextcloud: <d:collection/>,
        // DriveHQ: <a:iscollection>1</a:iscollection>
        let lower = content.to_lowercase();
        let in_resourcetype = lower.find("resourcetype>").and_then(|start| {
            let after = start + "resourcetype>".len();
            lower[after..]
                .find("resourcetype>")
                .map(|end| lower[after..after + end].contains("collection"))
        });
        let is_collection = in_resourcetype.unwrap_or(false)
            || lower.contains("iscollection>1</")
            || decoded.ends_with('/');

        let properties: HashMap<String, String> = DAV_PROPERTIES
            .iter()
            .filter_map(|prop| extract_tag_content(content, prop).map(|v| (prop.to_string(), v)))
            .collect();

        entries.push(DavEntry {
            href: decoded,
            is_collection,
            properties,
        });
    }
    Ok(entries)
}

/// Extract content from an XML tag (handles various namespace prefixes)
fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let patterns = [
        format!(r"<[a-zA-Z][a-zA-Z0-9]*:{}[^>]*>([^<]*)</[a-zA-Z][a-zA-Z0-9]*:{}>", tag, tag),
        format!(r"<{}[^>]*>([^<]*)</{}>", tag, tag),
        // DriveHQ wraps text in CDATA
        format!(r"<[a-zA-Z][a-zA-Z0-9]*:{}[^>]*><!\[CDATA\[(.*?)\]\]></[a-zA-Z][a-zA-Z0-9]*:{}>", tag, tag),
        format!(r"<{}[^>]*><!\[CDATA\[(.*?)\]\]></{}>", tag, tag),
    ];

    for pattern in patterns {
        let Ok(re) = regex::Regex::new(&pattern) else {
            continue;
        };
        if let Some(text) = re.captures(xml).and_then(|c| c.get(1)) {
            let text = text.as_str().trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}

fn range_header(range: &ResolvedRange) -> String {
    match range.end {
        Some(end) => format!("bytes={}-{}", range.start, end),
        None => format!("bytes={}-", range.start),
    }
}

fn body_stream(response: Response, size: StreamSize) -> ByteStream {
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let chunks = response
        .bytes_stream()
        .map(|item| item.map_err(|e| ProviderError::from_transport("download", &e)));
    ByteStream::new(chunks, size).with_content_type(content_type)
}

#[async_trait]
impl StorageProvider for WebDavProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_id(&self) -> String {
        format!("webdav:{}@{}", self.username, self.base_url)
    }

    fn path_rules(&self) -> PathRules {
        PathRules {
            max_segment_len: Some(255),
            ..PathRules::default()
        }
    }

    async fn metadata(
        &self,
        path: &GatewayPath,
        revision: Option<&str>,
    ) -> Result<MetadataResponse, ProviderError> {
        if revision.is_some() {
            return Err(ProviderError::NotSupported("WebDAV revisions".to_string()));
        }
        if path.is_file() {
            return Ok(MetadataResponse::Entry(self.stat(path).await?));
        }

        let entries = self.propfind(path, "1").await?;
        let mut children = Vec::with_capacity(entries.len());
        for entry in &entries {
            let meta = normalize_dav(&self.name, &self.root_href, entry)?;
            // The folder itself is part of a Depth: 1 answer
            if meta.path() == path {
                continue;
            }
            children.push(meta);
        }
        Ok(MetadataResponse::Listing(children))
    }

    async fn download(
        &self,
        path: &GatewayPath,
        range: Option<ResolvedRange>,
        revision: Option<&str>,
    ) -> Result<ByteStream, ProviderError> {
        if revision.is_some() {
            return Err(ProviderError::NotSupported("WebDAV revisions".to_string()));
        }
        let mut builder = self.request(Method::GET, &self.build_url(path));
        if let Some(range) = &range {
            builder = builder.header(header::RANGE, range_header(range));
        }
        let request = builder
            .build()
            .map_err(|e| ProviderError::from_transport("GET", &e))?;
        let response = send_with_retry(&self.client, request, &self.retry)
            .await
            .map_err(|e| ProviderError::from_transport("GET", &e))?;

        let size = StreamSize::from(response.content_length());
        match (response.status(), range) {
            (StatusCode::PARTIAL_CONTENT, Some(_)) => Ok(body_stream(response, size)),
            // Server ignored the Range header
            (StatusCode::OK, Some(range)) => {
                tracing::debug!("[WebDAV] Server ignored Range for {}, slicing locally", path);
                Ok(body_stream(response, size).slice(range))
            }
            (StatusCode::OK, None) => Ok(body_stream(response, size)),
            (status, _) => Err(status_error("GET", path, status)),
        }
    }

    async fn upload(
        &self,
        path: &GatewayPath,
        stream: ByteStream,
        size_hint: Option<u64>,
    ) -> Result<Metadata, ProviderError> {
        let mut builder = self
            .request(Method::PUT, &self.build_url(path))
            .body(Body::wrap_stream(stream));
        if let Some(size) = size_hint {
            builder = builder.header(header::CONTENT_LENGTH, size);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("PUT", &e))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                tracing::info!("[WebDAV] Uploaded {}", path);
                self.stat(path).await
            }
            StatusCode::CONFLICT => Err(missing_parent(path)),
            StatusCode::PAYLOAD_TOO_LARGE => Err(ProviderError::BadRequest(format!(
                "server refused the size of {}",
                path
            ))),
            status => Err(status_error("PUT", path, status)),
        }
    }

    async fn delete(&self, path: &GatewayPath) -> Result<(), ProviderError> {
        let response = self
            .request(Method::DELETE, &self.build_url(path))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("DELETE", &e))?;

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(()),
            status => Err(status_error("DELETE", path, status)),
        }
    }

    async fn create_folder(&self, path: &GatewayPath) -> Result<Metadata, ProviderError> {
        let response = self
            .request(webdav_methods::mkcol()?, &self.build_url(path))
            .send()
            .await
            .map_err(|e| ProviderError::from_transport("MKCOL", &e))?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => self.stat(path).await,
            StatusCode::METHOD_NOT_ALLOWED => Err(ProviderError::DestinationConflict(path.to_string())),
            StatusCode::CONFLICT => Err(missing_parent(path)),
            status => Err(status_error("MKCOL", path, status)),
        }
    }

    async fn native_move(
        &self,
        src: &GatewayPath,
        dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        self.relocate(webdav_methods::move_method()?, src, dest).await
    }

    async fn native_copy(
        &self,
        src: &GatewayPath,
        dest: &GatewayPath,
    ) -> Result<Metadata, ProviderError> {
        self.relocate(webdav_methods::copy()?, src, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ErrorKind;

    const NEXTCLOUD_LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
 <d:response>
  <d:href>/remote.php/webdav/Documents/</d:href>
  <d:propstat><d:prop>
   <d:resourcetype><d:collection/></d:resourcetype>
   <d:getetag>"5f1a"</d:getetag>
   <d:getlastmodified>Tue, 15 Nov 1994 12:45:26 GMT</d:getlastmodified>
  </d:prop></d:propstat>
 </d:response>
 <d:response>
  <d:href>/remote.php/webdav/Documents/Q1%20report.pdf</d:href>
  <d:propstat><d:prop>
   <d:resourcetype/>
   <d:getcontentlength>2048</d:getcontentlength>
   <d:getcontenttype>application/pdf</d:getcontenttype>
   <d:getetag>"abc123"</d:getetag>
  </d:prop></d:propstat>
 </d:response>
</d:multistatus>"#;

    fn provider() -> Box<dyn StorageProvider> {
        let factory = WebDavFactory::new("owncloud", Duration::from_secs(5), HttpRetryConfig::default())
            .unwrap();
        let credentials = ProviderCredentials {
            credentials: [("username", "user"), ("password", "pass")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            settings: serde_json::json!({ "url": "https://cloud.example.com/remote.php/webdav/" }),
        };
        factory.bind(&credentials).unwrap()
    }

    #[test]
    fn test_build_url() {
        let provider = WebDavProvider {
            name: "owncloud".into(),
            client: Client::new(),
            base_url: "https://cloud.example.com/remote.php/dav/files/user".into(),
            root_href: "/remote.php/dav/files/user".into(),
            username: "user".into(),
            password: SecretString::from("pass".to_string()),
            retry: HttpRetryConfig::default(),
        };

        let folder = GatewayPath::parse("/My Documents/", None).unwrap();
        assert_eq!(
            provider.build_url(&folder),
            "https://cloud.example.com/remote.php/dav/files/user/My%20Documents/"
        );
        assert_eq!(
            provider.build_url(&GatewayPath::root()),
            "https://cloud.example.com/remote.php/dav/files/user/"
        );
    }

    #[test]
    fn test_extract_tag_content() {
        let xml = r#"<d:getcontentlength>12345</d:getcontentlength>"#;
        assert_eq!(extract_tag_content(xml, "getcontentlength"), Some("12345".to_string()));

        let xml2 = r#"<D:getcontenttype>text/plain</D:getcontenttype>"#;
        assert_eq!(extract_tag_content(xml2, "getcontenttype"), Some("text/plain".to_string()));

        let cdata = r#"<a:displayname><![CDATA[My File]]></a:displayname>"#;
        assert_eq!(extract_tag_content(cdata, "displayname"), Some("My File".to_string()));
    }

    #[test]
    fn test_parse_multistatus_and_normalize() {
        let entries = parse_multistatus(NEXTCLOUD_LISTING).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_collection);
        assert!(!entries[1].is_collection);
        assert_eq!(entries[1].href, "/remote.php/webdav/Documents/Q1 report.pdf");

        let file = normalize_dav("owncloud", "/remote.php/webdav/", &entries[1]).unwrap();
        assert_eq!(file.path().to_string(), "/Documents/Q1 report.pdf");
        assert_eq!(file.size(), Some(2048));
        assert_eq!(file.etag(), Some("abc123"));

        let folder = normalize_dav("owncloud", "/remote.php/webdav/", &entries[0]).unwrap();
        assert!(folder.is_folder());
        assert_eq!(folder.size(), None);
    }

    #[test]
    fn test_absolute_href_is_reduced_to_path() {
        let xml = r#"<D:multistatus xmlns:D="DAV:"><D:response>
            <D:href>https://dav.example.com/dav/a.txt</D:href>
            <D:propstat><D:prop><D:resourcetype/></D:prop></D:propstat>
        </D:response></D:multistatus>"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries[0].href, "/dav/a.txt");
    }

    #[test]
    fn test_status_mapping() {
        let path = GatewayPath::parse("/a.txt", None).unwrap();
        assert_eq!(status_error("GET", &path, StatusCode::NOT_FOUND).kind(), ErrorKind::PathNotFound);
        assert_eq!(
            status_error("GET", &path, StatusCode::SERVICE_UNAVAILABLE).kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(
            status_error("GET", &path, StatusCode::RANGE_NOT_SATISFIABLE).kind(),
            ErrorKind::InvalidRange
        );
        assert_eq!(status_error("GET", &path, StatusCode::IM_A_TEAPOT).kind(), ErrorKind::Backend);
        assert_eq!(missing_parent(&path).to_string(), "Path not found: /");
    }

    #[test]
    fn test_rejected_credentials_are_unavailable_and_final() {
        let path = GatewayPath::parse("/a.txt", None).unwrap();
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = status_error("PROPFIND", &path, status);
            assert_eq!(err.kind(), ErrorKind::BackendUnavailable, "{}", status);
            assert!(!err.is_retryable(), "{}", status);
            assert!(!err.is_client_fault(), "{}", status);
        }
    }

    #[test]
    fn test_bind_requires_url() {
        let factory =
            WebDavFactory::new("owncloud", Duration::from_secs(5), HttpRetryConfig::default()).unwrap();
        let err = factory.bind(&ProviderCredentials::default()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::BadRequest);

        let provider = provider();
        assert_eq!(provider.name(), "owncloud");
        assert_eq!(
            provider.backend_id(),
            "webdav:user@https://cloud.example.com/remote.php/webdav"
        );
    }

    #[test]
    fn test_range_header() {
        let closed = ResolvedRange {
            start: 100,
            end: Some(199),
            exact: true,
        };
        assert_eq!(range_header(&closed), "bytes=100-199");
        let open = ResolvedRange {
            start: 5,
            end: None,
            exact: false,
        };
        assert_eq!(range_header(&open), "bytes=5-");
    }
}
