//! Move/copy orchestrator
//!
//! Relocates files and folders between two bound providers with the same
//! semantics whatever the backends can do natively:
//!
//! - the destination is checked before any backend call; an existing object
//!   is a `DestinationConflict` unless the caller asked for `Replace`
//! - same-backend relocations use the provider's native move/copy when it
//!   declares one
//! - everything else is emulated: download, upload, verify, and for moves
//!   delete the source last. A failed upload or verification removes the
//!   destination object and leaves the source untouched
//! - folders are relocated child by child; failed children are collected
//!   and reported, completed siblings are kept

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::metadata::{Metadata, HASH_MD5, HASH_SHA256};
use crate::path::GatewayPath;
use crate::providers::retry::{read_with_retry, ReadRetryConfig};
use crate::providers::{BoundProvider, ErrorReport, ProviderError};
use crate::stream::TransferDigest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelocateAction {
    Move,
    Copy,
}

impl fmt::Display for RelocateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelocateAction::Move => f.write_str("move"),
            RelocateAction::Copy => f.write_str("copy"),
        }
    }
}

/// What to do when the destination already exists
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    #[default]
    Fail,
    /// Delete the existing destination first. If the relocation then fails,
    /// the replaced object is gone and the source is left as it was.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Native,
    Emulated,
}

/// A child of a folder relocation that did not make it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildFailure {
    pub path: GatewayPath,
    pub error: ErrorReport,
}

impl ChildFailure {
    fn new(path: &GatewayPath, error: &ProviderError) -> Self {
        Self {
            path: path.clone(),
            error: error.report(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelocateOutcome {
    pub metadata: Metadata,
    pub mode: TransferMode,
    /// True when an existing destination was replaced
    pub replaced: bool,
    pub failed_children: Vec<ChildFailure>,
}

impl RelocateOutcome {
    pub fn is_partial(&self) -> bool {
        !self.failed_children.is_empty()
    }
}

/// One side of a relocation
#[derive(Clone, Copy)]
pub struct Endpoint<'a> {
    pub provider: &'a BoundProvider,
    pub path: &'a GatewayPath,
}

impl<'a> Endpoint<'a> {
    pub fn new(provider: &'a BoundProvider, path: &'a GatewayPath) -> Self {
        Self { provider, path }
    }

    fn at<'b>(&self, path: &'b GatewayPath) -> Endpoint<'b>
    where
        'a: 'b,
    {
        Endpoint {
            provider: self.provider,
            path,
        }
    }
}

impl fmt::Display for Endpoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider.name(), self.path)
    }
}

pub struct Orchestrator {
    read_retry: ReadRetryConfig,
}

impl Orchestrator {
    pub fn new(read_retry: ReadRetryConfig) -> Self {
        Self { read_retry }
    }

    pub async fn relocate(
        &self,
        action: RelocateAction,
        src: Endpoint<'_>,
        dest: Endpoint<'_>,
        policy: ConflictPolicy,
        cancel: &CancellationToken,
    ) -> Result<RelocateOutcome, ProviderError> {
        self.check_request(action, src, dest)?;

        let src_exists = read_with_retry("exists", &self.read_retry, || {
            src.provider.exists(src.path)
        })
        .await?;
        if !src_exists {
            return Err(ProviderError::PathNotFound(src.path.to_string()));
        }

        // One conflict check for every provider pairing, before any mutation
        let dest_exists = read_with_retry("exists", &self.read_retry, || {
            dest.provider.exists(dest.path)
        })
        .await?;
        let replaced = match (dest_exists, policy) {
            (false, _) => false,
            (true, ConflictPolicy::Fail) => {
                tracing::info!("[Orchestrator] {} {} -> {} refused: destination exists", action, src, dest);
                return Err(ProviderError::DestinationConflict(dest.path.to_string()));
            }
            (true, ConflictPolicy::Replace) => {
                tracing::info!("[Orchestrator] Replacing {} before {}", dest, action);
                dest.provider.delete(dest.path).await?;
                true
            }
        };

        if self.can_relocate_natively(action, src, dest) {
            let native = match action {
                RelocateAction::Move => src.provider.native_move(src.path, dest.path).await,
                RelocateAction::Copy => src.provider.native_copy(src.path, dest.path).await,
            };
            match native {
                Ok(metadata) => {
                    tracing::info!("[Orchestrator] Native {} {} -> {}", action, src, dest);
                    return Ok(RelocateOutcome {
                        metadata,
                        mode: TransferMode::Native,
                        replaced,
                        failed_children: Vec::new(),
                    });
                }
                Err(ProviderError::NotSupported(reason)) => {
                    tracing::debug!("[Orchestrator] Native {} unavailable ({}), emulating", action, reason);
                }
                Err(e) => return Err(e),
            }
        }

        let (metadata, failed_children) = self.emulate(action, src, dest, cancel).await?;
        if failed_children.is_empty() {
            tracing::info!("[Orchestrator] Emulated {} {} -> {}", action, src, dest);
        } else {
            tracing::warn!(
                "[Orchestrator] Emulated {} {} -> {} finished with {} failed children",
                action,
                src,
                dest,
                failed_children.len()
            );
        }
        Ok(RelocateOutcome {
            metadata,
            mode: TransferMode::Emulated,
            replaced,
            failed_children,
        })
    }

    fn check_request(
        &self,
        action: RelocateAction,
        src: Endpoint<'_>,
        dest: Endpoint<'_>,
    ) -> Result<(), ProviderError> {
        if action == RelocateAction::Move {
            src.provider.ensure_writable("move")?;
            if src.path.is_root() {
                return Err(ProviderError::BadRequest("the root cannot be moved".to_string()));
            }
        }
        dest.provider.ensure_writable(&action.to_string())?;
        if dest.path.is_root() {
            return Err(ProviderError::BadRequest(format!(
                "the root cannot be the destination of a {}",
                action
            )));
        }

        if src.path.is_folder() != dest.path.is_folder() {
            return Err(ProviderError::BadRequest(format!(
                "cannot {} {} onto {}: file/folder mismatch",
                action, src.path, dest.path
            )));
        }
        // Two registrations over one backend still address the same objects
        if src.provider.backend_id() == dest.provider.backend_id() {
            if src.path == dest.path {
                return Err(ProviderError::BadRequest(format!(
                    "{} onto itself ({})",
                    action, src.path
                )));
            }
            if src.path.is_folder() && dest.path.starts_with(src.path) {
                return Err(ProviderError::BadRequest(format!(
                    "cannot {} {} into its own descendant {}",
                    action, src.path, dest.path
                )));
            }
        }
        Ok(())
    }

    fn can_relocate_natively(&self, action: RelocateAction, src: Endpoint<'_>, dest: Endpoint<'_>) -> bool {
        let capabilities = src.provider.capabilities();
        let declared = match action {
            RelocateAction::Move => capabilities.native_move,
            RelocateAction::Copy => capabilities.native_copy,
        };
        declared && src.provider.same_backend(dest.provider)
    }

    fn emulate<'a>(
        &'a self,
        action: RelocateAction,
        src: Endpoint<'a>,
        dest: Endpoint<'a>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(Metadata, Vec<ChildFailure>), ProviderError>> {
        async move {
            if src.path.is_file() {
                let metadata = self.transfer_file(src, dest).await?;
                let mut failed = Vec::new();
                if action == RelocateAction::Move {
                    if let Err(e) = src.provider.delete(src.path).await {
                        tracing::error!(
                            "[Orchestrator] {} copied to {} but the source could not be deleted: {}",
                            src,
                            dest,
                            e
                        );
                        failed.push(ChildFailure::new(src.path, &e));
                    }
                }
                return Ok((metadata, failed));
            }

            let metadata = dest.provider.create_folder(dest.path).await?;
            let children = read_with_retry("list", &self.read_retry, || {
                src.provider.list(src.path)
            })
            .await?;

            let mut failed = Vec::new();
            for (done, child) in children.iter().enumerate() {
                // Sub-steps are never interrupted halfway; cancellation is
                // honoured between children
                if cancel.is_cancelled() {
                    tracing::warn!("[Orchestrator] {} of {} cancelled", action, src);
                    return Err(ProviderError::ConnectionAborted(format!(
                        "{} cancelled after {} of {} children",
                        action,
                        done,
                        children.len()
                    )));
                }
                let child_dest = dest.path.child(child.path().name(), child.is_folder())?;
                let result = self
                    .emulate(action, src.at(child.path()), dest.at(&child_dest), cancel)
                    .await;
                match result {
                    Ok((_, nested)) => failed.extend(nested),
                    Err(e) => {
                        tracing::warn!("[Orchestrator] {} of {} failed: {}", action, child.path(), e);
                        failed.push(ChildFailure::new(child.path(), &e));
                    }
                }
            }

            if action == RelocateAction::Move && failed.is_empty() {
                if let Err(e) = src.provider.delete(src.path).await {
                    failed.push(ChildFailure::new(src.path, &e));
                }
            }
            Ok((metadata, failed))
        }
        .boxed()
    }

    /// Stream one file across, verify it, and remove it again on failure
    async fn transfer_file(
        &self,
        src: Endpoint<'_>,
        dest: Endpoint<'_>,
    ) -> Result<Metadata, ProviderError> {
        let src_meta = read_with_retry("metadata", &self.read_retry, || {
            src.provider.file_metadata(src.path, None)
        })
        .await?;
        let body = read_with_retry("download", &self.read_retry, || {
            src.provider.download(src.path, None, None)
        })
        .await?;

        let size_hint = body.known_size().or(src_meta.size());
        let body = if dest.provider.capabilities().requires_size_hint {
            let Some(declared) = size_hint else {
                return Err(ProviderError::BadRequest(format!(
                    "{} needs a size, {} does not report one",
                    dest.provider.name(),
                    src
                )));
            };
            body.exact_length(declared)
        } else {
            body
        };
        let (body, digest) = body.digesting();

        let dest_meta = match dest.provider.upload(dest.path, body, size_hint).await {
            Ok(meta) => meta,
            Err(e) => {
                self.discard(dest).await;
                return Err(e);
            }
        };

        if let Err(e) = verify(&digest.finish(), &src_meta, &dest_meta) {
            tracing::error!("[Orchestrator] Verification of {} -> {} failed: {}", src, dest, e);
            self.discard(dest).await;
            return Err(e);
        }
        Ok(dest_meta)
    }

    /// Compensating cleanup of a destination object
    async fn discard(&self, dest: Endpoint<'_>) {
        match dest.provider.delete(dest.path).await {
            Ok(()) | Err(ProviderError::PathNotFound(_)) => {}
            Err(e) => tracing::error!("[Orchestrator] Could not remove {}: {}", dest, e),
        }
    }
}

/// Compare what was transferred with what both sides report
fn verify(
    transferred: &TransferDigest,
    src: &Metadata,
    dest: &Metadata,
) -> Result<(), ProviderError> {
    for (side, meta) in [("source", src), ("destination", dest)] {
        if let Some(size) = meta.size() {
            if size != transferred.bytes {
                return Err(ProviderError::Integrity(format!(
                    "{} reports {} bytes, {} were transferred",
                    side, size, transferred.bytes
                )));
            }
        }
        for (algorithm, value) in [(HASH_MD5, &transferred.md5), (HASH_SHA256, &transferred.sha256)] {
            if let Some(reported) = meta.hash(algorithm) {
                if !reported.eq_ignore_ascii_case(value) {
                    return Err(ProviderError::Integrity(format!(
                        "{} {} mismatch on the {}",
                        algorithm, reported, side
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{
        Capabilities, ErrorKind, MemoryFactory, MemoryOptions, MemoryStore, ProviderCredentials,
        ProviderFactory,
    };
    use std::sync::Arc;

    fn bind(store: &Arc<MemoryStore>, options: MemoryOptions) -> BoundProvider {
        let factory = MemoryFactory::new(store.clone(), options);
        let capabilities = factory.capabilities();
        BoundProvider::new(factory.bind(&ProviderCredentials::default()).unwrap(), capabilities)
    }

    fn p(raw: &str) -> GatewayPath {
        GatewayPath::parse(raw, None).unwrap()
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(ReadRetryConfig::default())
    }

    fn digest_of(data: &[u8]) -> TransferDigest {
        use md5::Md5;
        use sha2::{Digest, Sha256};
        TransferDigest {
            bytes: data.len() as u64,
            md5: hex::encode(Md5::digest(data)),
            sha256: hex::encode(Sha256::digest(data)),
        }
    }

    #[tokio::test]
    async fn test_native_move_on_same_backend() {
        let store = Arc::new(MemoryStore::new());
        store.put("/a.txt", &b"hello"[..]);
        let provider = bind(&store, MemoryOptions::named("memory"));
        let (src, dest) = (p("/a.txt"), p("/b.txt"));

        let outcome = orchestrator()
            .relocate(
                RelocateAction::Move,
                Endpoint::new(&provider, &src),
                Endpoint::new(&provider, &dest),
                ConflictPolicy::Fail,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.mode, TransferMode::Native);
        assert!(!store.contains("/a.txt"));
        assert_eq!(store.get("/b.txt").as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_emulated_copy_across_backends_is_verified() {
        let (left, right) = (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        left.put("/docs/a.txt", &b"alpha"[..]);
        left.put("/docs/sub/b.txt", &b"beta"[..]);
        let src_provider = bind(&left, MemoryOptions::named("left"));
        let dest_provider = bind(&right, MemoryOptions::named("right"));
        let (src, dest) = (p("/docs/"), p("/backup/"));

        let outcome = orchestrator()
            .relocate(
                RelocateAction::Copy,
                Endpoint::new(&src_provider, &src),
                Endpoint::new(&dest_provider, &dest),
                ConflictPolicy::Fail,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.mode, TransferMode::Emulated);
        assert!(!outcome.is_partial());
        assert!(outcome.metadata.is_folder());
        assert_eq!(right.get("/backup/sub/b.txt").as_deref(), Some(&b"beta"[..]));
        assert!(left.contains("/docs/a.txt"));
    }

    #[tokio::test]
    async fn test_same_backend_without_native_support_is_emulated() {
        let store = Arc::new(MemoryStore::new());
        store.put("/a.txt", &b"hello"[..]);
        let provider = bind(
            &store,
            MemoryOptions {
                capabilities: Capabilities::default(),
                ..MemoryOptions::named("flat")
            },
        );
        let (src, dest) = (p("/a.txt"), p("/moved/a.txt"));
        let outcome = orchestrator()
            .relocate(
                RelocateAction::Move,
                Endpoint::new(&provider, &src),
                Endpoint::new(&provider, &dest),
                ConflictPolicy::Fail,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.mode, TransferMode::Emulated);
        assert!(!store.contains("/a.txt"));
        assert_eq!(store.get("/moved/a.txt").as_deref(), Some(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_replace_policy_overwrites() {
        let store = Arc::new(MemoryStore::new());
        store.put("/a.txt", &b"new"[..]);
        store.put("/b.txt", &b"old"[..]);
        let provider = bind(&store, MemoryOptions::named("memory"));
        let (src, dest) = (p("/a.txt"), p("/b.txt"));
        let outcome = orchestrator()
            .relocate(
                RelocateAction::Copy,
                Endpoint::new(&provider, &src),
                Endpoint::new(&provider, &dest),
                ConflictPolicy::Replace,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.replaced);
        assert_eq!(store.get("/b.txt").as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn test_guards() {
        let store = Arc::new(MemoryStore::new());
        store.put("/d/a.txt", &b"a"[..]);
        let provider = bind(&store, MemoryOptions::named("memory"));
        let readonly = bind(
            &store,
            MemoryOptions {
                capabilities: Capabilities::read_only(),
                ..MemoryOptions::named("archive")
            },
        );
        let token = CancellationToken::new();
        let o = orchestrator();
        let cases = [
            (RelocateAction::Move, &provider, p("/d/"), &provider, p("/d/"), ErrorKind::BadRequest),
            (RelocateAction::Move, &provider, p("/d/"), &provider, p("/d/e/"), ErrorKind::BadRequest),
            (RelocateAction::Copy, &provider, p("/d/a.txt"), &provider, p("/x/"), ErrorKind::BadRequest),
            (RelocateAction::Move, &provider, p("/"), &provider, p("/x/"), ErrorKind::BadRequest),
            (RelocateAction::Copy, &provider, p("/d/a.txt"), &readonly, p("/b.txt"), ErrorKind::NotSupported),
            (RelocateAction::Move, &readonly, p("/d/a.txt"), &provider, p("/b.txt"), ErrorKind::NotSupported),
            (RelocateAction::Copy, &provider, p("/nope.txt"), &provider, p("/b.txt"), ErrorKind::PathNotFound),
        ];
        for (action, src_p, src, dest_p, dest, kind) in cases {
            let err = o
                .relocate(
                    action,
                    Endpoint::new(src_p, &src),
                    Endpoint::new(dest_p, &dest),
                    ConflictPolicy::Fail,
                    &token,
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "{} {} -> {}", action, src, dest);
        }
        assert_eq!(store.paths(), vec!["/d/".to_string(), "/d/a.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_read_only_provider_can_be_copied_from() {
        let (left, right) = (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        left.put("/paper.pdf", &b"%PDF"[..]);
        let readonly = bind(
            &left,
            MemoryOptions {
                capabilities: Capabilities::read_only(),
                ..MemoryOptions::named("dryad")
            },
        );
        let writable = bind(&right, MemoryOptions::named("memory"));
        let path = p("/paper.pdf");
        orchestrator()
            .relocate(
                RelocateAction::Copy,
                Endpoint::new(&readonly, &path),
                Endpoint::new(&writable, &path),
                ConflictPolicy::Fail,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(right.get("/paper.pdf").as_deref(), Some(&b"%PDF"[..]));
    }

    #[tokio::test]
    async fn test_cancelled_folder_copy_stops_between_children() {
        let (left, right) = (Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()));
        left.put("/d/a.txt", &b"a"[..]);
        let src_provider = bind(&left, MemoryOptions::named("left"));
        let dest_provider = bind(&right, MemoryOptions::named("right"));
        let token = CancellationToken::new();
        token.cancel();
        let (src, dest) = (p("/d/"), p("/d/"));
        let err = orchestrator()
            .relocate(
                RelocateAction::Copy,
                Endpoint::new(&src_provider, &src),
                Endpoint::new(&dest_provider, &dest),
                ConflictPolicy::Fail,
                &token,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionAborted);
        assert!(!right.contains("/d/a.txt"));
    }

    #[test]
    fn test_verify_detects_mismatches() {
        let path = p("/a.txt");
        let good = digest_of(b"abc");
        let meta = Metadata::file("memory", path.clone())
            .unwrap()
            .with_size(Some(3))
            .with_hash(HASH_MD5, good.md5.to_uppercase());
        assert!(verify(&good, &meta, &meta).is_ok());

        let short = Metadata::file("memory", path.clone()).unwrap().with_size(Some(2));
        assert_eq!(verify(&good, &meta, &short).unwrap_err().kind(), ErrorKind::Integrity);

        let wrong_hash = Metadata::file("memory", path)
            .unwrap()
            .with_hash(HASH_SHA256, digest_of(b"abd").sha256);
        assert_eq!(verify(&good, &wrong_hash, &meta).unwrap_err().kind(), ErrorKind::Integrity);

        let bare = Metadata::file("memory", p("/b")).unwrap();
        assert!(verify(&good, &bare, &bare).is_ok());
    }
}
