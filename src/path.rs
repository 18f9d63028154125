//! Gateway path model
//!
//! A `GatewayPath` is an immutable, backend-independent location inside one
//! provider's namespace: an ordered list of segments plus a folder flag.
//! Folder paths always render with a trailing separator, file paths never do.
//!
//! Segments may carry a backend identifier (for id-addressed backends). The
//! identifier is metadata only: two paths naming the same segments with the
//! same folder flag are equal whether or not they carry identifiers.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::providers::ProviderError;

pub const SEPARATOR: char = '/';

/// One named step of a path, optionally paired with its backend id
#[derive(Debug, Clone)]
pub struct PathSegment {
    name: String,
    identifier: Option<String>,
}

impl PathSegment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }
}

/// Provider-specific naming rules applied by `GatewayPath::validate`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRules {
    /// Longest accepted segment, in bytes
    pub max_segment_len: Option<usize>,
    /// Characters the backend refuses inside a name
    pub reserved_chars: Vec<char>,
    /// Deepest accepted path, in segments
    pub max_depth: Option<usize>,
}

impl PathRules {
    fn check(&self, path: &GatewayPath) -> Result<(), ProviderError> {
        if let Some(max_depth) = self.max_depth {
            if path.depth() > max_depth {
                return Err(ProviderError::invalid_path(
                    path.to_string(),
                    format!("deeper than {} segments", max_depth),
                ));
            }
        }
        for segment in &path.segments {
            if let Some(max) = self.max_segment_len {
                if segment.name.len() > max {
                    return Err(ProviderError::invalid_path(
                        segment.name.clone(),
                        format!("segment longer than {} bytes", max),
                    ));
                }
            }
            if let Some(c) = segment.name.chars().find(|c| self.reserved_chars.contains(c)) {
                return Err(ProviderError::invalid_path(
                    segment.name.clone(),
                    format!("reserved character {:?}", c),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GatewayPath {
    segments: Vec<PathSegment>,
    is_folder: bool,
    validated: bool,
}

fn check_segment(raw: &str, name: &str) -> Result<(), ProviderError> {
    if name.is_empty() {
        return Err(ProviderError::invalid_path(raw, "empty path segment"));
    }
    if name == "." || name == ".." {
        return Err(ProviderError::invalid_path(raw, "path traversal segment"));
    }
    if name.contains(SEPARATOR) {
        return Err(ProviderError::invalid_path(raw, "separator inside segment"));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(ProviderError::invalid_path(raw, "control character in segment"));
    }
    Ok(())
}

impl GatewayPath {
    /// Parse a gateway path such as `/docs/report.pdf` or `/docs/`.
    ///
    /// A trailing separator marks a folder; a run of trailing separators
    /// collapses to one. `is_folder_hint`, when given, must agree with the
    /// trailing separator.
    pub fn parse(raw: &str, is_folder_hint: Option<bool>) -> Result<Self, ProviderError> {
        if raw.is_empty() {
            return Err(ProviderError::invalid_path(raw, "must specify a path"));
        }
        if !raw.starts_with(SEPARATOR) {
            return Err(ProviderError::invalid_path(raw, "path must start with '/'"));
        }

        let is_folder = raw.ends_with(SEPARATOR);
        if let Some(hint) = is_folder_hint {
            if hint != is_folder {
                let reason = if hint {
                    "folder paths must end with '/'"
                } else {
                    "file paths must not end with '/'"
                };
                return Err(ProviderError::invalid_path(raw, reason));
            }
        }

        let body = raw[1..].trim_end_matches(SEPARATOR);
        if body.is_empty() {
            return Ok(Self::root());
        }

        let mut segments = Vec::new();
        for name in body.split(SEPARATOR) {
            check_segment(raw, name)?;
            segments.push(PathSegment {
                name: name.to_string(),
                identifier: None,
            });
        }

        Ok(Self {
            segments,
            is_folder,
            validated: false,
        })
    }

    /// The provider root
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
            is_folder: true,
            validated: false,
        }
    }

    /// Build a path from names already split by a backend (no parsing)
    pub fn from_segments<I, S>(names: I, is_folder: bool) -> Result<Self, ProviderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut path = Self::root();
        path.is_folder = is_folder;
        for name in names {
            let name = name.into();
            check_segment(&name, &name)?;
            path.segments.push(PathSegment {
                name,
                identifier: None,
            });
        }
        if path.segments.is_empty() && !is_folder {
            return Err(ProviderError::invalid_path("/", "the root is always a folder"));
        }
        Ok(path)
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn is_file(&self) -> bool {
        !self.is_folder
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_validated(&self) -> bool {
        self.validated
    }

    /// Last segment name, empty for the root
    pub fn name(&self) -> &str {
        self.segments.last().map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.name.as_str())
    }

    /// Backend id of the last segment, if resolved
    pub fn identifier(&self) -> Option<&str> {
        self.segments.last().and_then(|s| s.identifier.as_deref())
    }

    /// Parallel sequence of backend ids; `None` until every segment is resolved
    pub fn identifier_path(&self) -> Option<Vec<&str>> {
        self.segments
            .iter()
            .map(|s| s.identifier.as_deref())
            .collect()
    }

    /// Copy of this path carrying one identifier per segment
    pub fn with_identifiers(&self, ids: Vec<String>) -> Result<Self, ProviderError> {
        if ids.len() != self.segments.len() {
            return Err(ProviderError::invalid_path(
                self.to_string(),
                format!(
                    "{} identifiers for {} segments",
                    ids.len(),
                    self.segments.len()
                ),
            ));
        }
        let mut path = self.clone();
        for (segment, id) in path.segments.iter_mut().zip(ids) {
            segment.identifier = Some(id);
        }
        Ok(path)
    }

    /// Containing folder; `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.pop();
        Some(Self {
            segments,
            is_folder: true,
            validated: self.validated,
        })
    }

    /// Child of this folder
    pub fn child(&self, name: &str, is_folder: bool) -> Result<Self, ProviderError> {
        if self.is_file() {
            return Err(ProviderError::invalid_path(
                self.to_string(),
                "files have no children",
            ));
        }
        check_segment(name, name)?;
        let mut segments = self.segments.clone();
        segments.push(PathSegment {
            name: name.to_string(),
            identifier: None,
        });
        Ok(Self {
            segments,
            is_folder,
            validated: false,
        })
    }

    /// Same location under a new final name; the folder flag is kept
    pub fn rename(&self, name: &str) -> Result<Self, ProviderError> {
        match self.parent() {
            Some(parent) => parent.child(name, self.is_folder),
            None => Err(ProviderError::invalid_path("/", "the root cannot be renamed")),
        }
    }

    /// True when `self` is `ancestor` or lies below it
    pub fn starts_with(&self, ancestor: &GatewayPath) -> bool {
        if ancestor.is_file() {
            return self == ancestor;
        }
        ancestor.segments.len() <= self.segments.len()
            && ancestor
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(a, b)| a.name == b.name)
    }

    /// Slash-joined names below `ancestor`, e.g. for archive entry names
    pub fn relative_to(&self, ancestor: &GatewayPath) -> Option<String> {
        if ancestor.is_file() || !self.starts_with(ancestor) {
            return None;
        }
        let rest: Vec<&str> = self.segments[ancestor.segments.len()..]
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        let mut joined = rest.join("/");
        if self.is_folder && !joined.is_empty() {
            joined.push(SEPARATOR);
        }
        Some(joined)
    }

    /// Apply provider naming rules, returning the validated path
    pub fn validate(&self, rules: &PathRules) -> Result<Self, ProviderError> {
        rules.check(self)?;
        let mut path = self.clone();
        path.validated = true;
        Ok(path)
    }
}

impl PartialEq for GatewayPath {
    fn eq(&self, other: &Self) -> bool {
        self.is_folder == other.is_folder
            && self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|(a, b)| a.name == b.name)
    }
}

impl Eq for GatewayPath {}

impl Hash for GatewayPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.is_folder.hash(state);
        for segment in &self.segments {
            segment.name.hash(state);
        }
    }
}

impl fmt::Display for GatewayPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("/")?;
        let names: Vec<&str> = self.names().collect();
        f.write_str(&names.join("/"))?;
        if self.is_folder && !self.is_root() {
            f.write_str("/")?;
        }
        Ok(())
    }
}

impl Serialize for GatewayPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GatewayPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        GatewayPath::parse(&raw, None).map_err(serde::de::Error::custom)
    }
}

/// Inbound `<provider>/<segment>/.../<segment>[/]` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    pub provider: String,
    pub path: GatewayPath,
}

impl RequestPath {
    pub fn parse(raw: &str) -> Result<Self, ProviderError> {
        let (provider, _) = raw
            .split_once(SEPARATOR)
            .ok_or_else(|| ProviderError::invalid_path(raw, "missing path after provider"))?;
        if provider.is_empty() {
            return Err(ProviderError::invalid_path(raw, "leading separator"));
        }
        if !provider
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ProviderError::invalid_path(raw, "invalid provider name"));
        }
        let path = GatewayPath::parse(&raw[provider.len()..], None)?;
        Ok(Self {
            provider: provider.to_string(),
            path,
        })
    }
}

impl fmt::Display for RequestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.provider, self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ErrorKind;

    #[test]
    fn test_request_path_examples() {
        let file = RequestPath::parse("s3/docs/report.pdf").unwrap();
        assert_eq!(file.provider, "s3");
        assert!(file.path.is_file());
        assert_eq!(file.path.names().collect::<Vec<_>>(), vec!["docs", "report.pdf"]);

        let folder = RequestPath::parse("s3/docs/").unwrap();
        assert!(folder.path.is_folder());
        assert_eq!(folder.path.names().collect::<Vec<_>>(), vec!["docs"]);
    }

    #[test]
    fn test_round_trip() {
        for raw in ["s3/docs/report.pdf", "s3/docs/", "s3/", "osf/a/b/c d.txt", "box/x/y/"] {
            assert_eq!(RequestPath::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_trailing_separator_run_normalizes() {
        let path = RequestPath::parse("s3/docs//").unwrap();
        assert!(path.path.is_folder());
        assert_eq!(path.to_string(), "s3/docs/");
    }

    #[test]
    fn test_rejects_malformed() {
        for raw in ["/s3/docs", "s3", "s3/a//b", "s3/../etc", "s3/a/./b", "s3/a/..", "s 3/a"] {
            let err = RequestPath::parse(raw).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidPath, "{}", raw);
        }
        assert!(GatewayPath::parse("", None).is_err());
        assert!(GatewayPath::parse("docs/a", None).is_err());
    }

    #[test]
    fn test_folder_hint_must_match() {
        assert!(GatewayPath::parse("/docs/", Some(true)).is_ok());
        assert!(GatewayPath::parse("/docs", Some(true)).is_err());
        assert!(GatewayPath::parse("/docs/", Some(false)).is_err());
        assert!(GatewayPath::parse("/", Some(true)).unwrap().is_root());
    }

    #[test]
    fn test_folder_flag_is_invariant() {
        let file = GatewayPath::parse("/a/b.txt", None).unwrap();
        let ids = file.with_identifiers(vec!["1".into(), "2".into()]).unwrap();
        assert!(ids.is_file());
        assert!(file.rename("c.txt").unwrap().is_file());
        assert!(file.validate(&PathRules::default()).unwrap().is_file());

        let folder = GatewayPath::parse("/a/b/", None).unwrap();
        assert!(folder.rename("c").unwrap().is_folder());
        assert!(folder.parent().unwrap().is_folder());
    }

    #[test]
    fn test_identifiers_do_not_affect_equality() {
        let plain = GatewayPath::parse("/a/b.txt", None).unwrap();
        let with_ids = plain.with_identifiers(vec!["id-a".into(), "id-b".into()]).unwrap();
        assert_eq!(plain, with_ids);
        assert_eq!(with_ids.identifier(), Some("id-b"));
        assert_eq!(with_ids.identifier_path(), Some(vec!["id-a", "id-b"]));
        assert_eq!(plain.identifier_path(), None);
        assert!(plain.with_identifiers(vec!["x".into()]).is_err());

        let folder = GatewayPath::parse("/a/b.txt/", None).unwrap();
        assert_ne!(plain, folder);
    }

    #[test]
    fn test_rules_report_offending_segment() {
        let rules = PathRules {
            max_segment_len: Some(5),
            reserved_chars: vec![':'],
            max_depth: None,
        };
        let err = GatewayPath::parse("/ok/toolongname", None)
            .unwrap()
            .validate(&rules)
            .unwrap_err();
        match err {
            ProviderError::InvalidPath { path, .. } => assert_eq!(path, "toolongname"),
            other => panic!("unexpected {:?}", other),
        }

        let err = GatewayPath::parse("/a:b", None).unwrap().validate(&rules).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);

        let ok = GatewayPath::parse("/ok/", None).unwrap().validate(&rules).unwrap();
        assert!(ok.is_validated());
    }

    #[test]
    fn test_relative_to_and_parent() {
        let root = GatewayPath::parse("/docs/", None).unwrap();
        let nested = GatewayPath::parse("/docs/2024/q1.csv", None).unwrap();
        assert_eq!(nested.relative_to(&root).as_deref(), Some("2024/q1.csv"));
        assert_eq!(nested.parent().unwrap().to_string(), "/docs/2024/");
        assert!(nested.starts_with(&root));
        assert!(!root.starts_with(&nested));
        assert!(GatewayPath::root().parent().is_none());
    }

    #[test]
    fn test_child_requires_folder() {
        let file = GatewayPath::parse("/a.txt", None).unwrap();
        assert!(file.child("b", false).is_err());
        let folder = GatewayPath::root();
        assert_eq!(folder.child("b", true).unwrap().to_string(), "/b/");
        assert!(folder.child("..", false).is_err());
    }
}
