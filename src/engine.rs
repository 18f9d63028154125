//! Request-level facade
//!
//! A request arrives as a provider name plus a path. The gateway binds the
//! provider to the request credentials, validates the path against that
//! provider, runs the operation and, when the request carries a callback
//! URL, queues a notification describing the outcome.

use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::archive::Archiver;
use crate::callback::{CallbackPayload, CallbackQueue};
use crate::config::GatewayConfig;
use crate::metadata::{Metadata, MetadataResponse};
use crate::orchestrator::{
    ChildFailure, ConflictPolicy, Endpoint, Orchestrator, RelocateAction, RelocateOutcome,
};
use crate::path::RequestPath;
use crate::pipeline::{Download, Pipeline, UploadOutcome};
use crate::providers::retry::{read_with_retry, ReadRetryConfig};
use crate::providers::{
    BoundProvider, Capabilities, ProviderCredentials, ProviderError, ProviderRegistry, Revision,
};
use crate::stream::{ByteRange, ByteStream};

/// Everything scoped to a single request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Credentials and settings per provider name
    pub credentials: HashMap<String, ProviderCredentials>,
    pub callback_url: Option<String>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(mut self, provider: &str, credentials: ProviderCredentials) -> Self {
        self.credentials.insert(provider.to_string(), credentials);
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub struct Gateway {
    registry: ProviderRegistry,
    pipeline: Pipeline,
    orchestrator: Orchestrator,
    archiver: Archiver,
    read_retry: ReadRetryConfig,
    callbacks: Option<CallbackQueue>,
}

impl Gateway {
    pub fn new(registry: ProviderRegistry, config: &GatewayConfig, callbacks: Option<CallbackQueue>) -> Self {
        Self {
            registry,
            pipeline: Pipeline::new(config.pipeline.clone(), config.read_retry.clone()),
            orchestrator: Orchestrator::new(config.read_retry.clone()),
            archiver: Archiver::new(config.archive.clone(), config.read_retry.clone()),
            read_retry: config.read_retry.clone(),
            callbacks,
        }
    }

    pub fn providers(&self) -> Vec<&str> {
        self.registry.names()
    }

    pub fn capabilities(&self, provider: &str) -> Option<Capabilities> {
        self.registry.capabilities(provider)
    }

    fn bind(&self, provider: &str, ctx: &RequestContext) -> Result<BoundProvider, ProviderError> {
        let empty = ProviderCredentials::default();
        let credentials = ctx.credentials.get(provider).unwrap_or(&empty);
        self.registry.bind(provider, credentials)
    }

    fn notify(&self, ctx: &RequestContext, payload: CallbackPayload) {
        if let (Some(queue), Some(url)) = (&self.callbacks, &ctx.callback_url) {
            queue.enqueue(url, payload);
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Metadata of a file, or the listing of a folder
    pub async fn metadata(
        &self,
        target: &RequestPath,
        revision: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<MetadataResponse, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        let path = provider.validate(&target.path, true).await?;
        if revision.is_some() && !provider.capabilities().revisions {
            return Err(ProviderError::NotSupported(format!(
                "revisions on '{}'",
                target.provider
            )));
        }
        read_with_retry("metadata", &self.read_retry, || provider.metadata(&path, revision)).await
    }

    pub async fn revisions(
        &self,
        target: &RequestPath,
        ctx: &RequestContext,
    ) -> Result<Vec<Revision>, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        if !provider.capabilities().revisions {
            return Err(ProviderError::NotSupported(format!(
                "revisions on '{}'",
                target.provider
            )));
        }
        if target.path.is_folder() {
            return Err(ProviderError::BadRequest(format!(
                "{} is a folder; revisions are tracked per file",
                target
            )));
        }
        let path = provider.validate(&target.path, true).await?;
        read_with_retry("revisions", &self.read_retry, || provider.revisions(&path)).await
    }

    /// Open a download. The callback is sent once the body has been read to
    /// the end, failed, or was dropped unfinished.
    pub async fn download(
        &self,
        target: &RequestPath,
        range: Option<ByteRange>,
        revision: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Download, ProviderError> {
        let mut download = match self.download_inner(target, range, revision, ctx).await {
            Ok(download) => download,
            Err(e) => {
                self.notify(ctx, CallbackPayload::new("download", target.to_string(), Err(&e)));
                return Err(e);
            }
        };
        if let (Some(queue), Some(url)) = (self.callbacks.clone(), ctx.callback_url.clone()) {
            let source = target.to_string();
            download.stream = download.stream.on_finish(move |result| {
                queue.enqueue(&url, CallbackPayload::new("download", source, result.map(|_| None)));
            });
        }
        Ok(download)
    }

    async fn download_inner(
        &self,
        target: &RequestPath,
        range: Option<ByteRange>,
        revision: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Download, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        let path = provider.validate(&target.path, true).await?;
        if revision.is_some() && !provider.capabilities().revisions {
            return Err(ProviderError::NotSupported(format!(
                "revisions on '{}'",
                target.provider
            )));
        }
        self.pipeline
            .download(&provider, &path, range, revision, &ctx.cancel)
            .await
    }

    /// Stream a folder as a ZIP archive
    pub async fn zip(&self, target: &RequestPath, ctx: &RequestContext) -> Result<ByteStream, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        if target.path.is_file() {
            return Err(ProviderError::BadRequest(format!("{} is not a folder", target)));
        }
        let path = provider.validate(&target.path, true).await?;
        if !path.is_root() && !provider.exists(&path).await? {
            return Err(ProviderError::PathNotFound(path.to_string()));
        }
        self.archiver.zip_folder(provider, path, ctx.cancel.clone())
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    pub async fn upload(
        &self,
        target: &RequestPath,
        body: ByteStream,
        ctx: &RequestContext,
    ) -> Result<UploadOutcome, ProviderError> {
        let result = self.upload_inner(target, body, ctx).await;
        let action = match &result {
            Ok(outcome) if outcome.created => "create",
            Ok(_) => "update",
            Err(_) => "upload",
        };
        self.notify(
            ctx,
            CallbackPayload::new(
                action,
                target.to_string(),
                result.as_ref().map(|o| Some(o.metadata.clone())),
            ),
        );
        result
    }

    async fn upload_inner(
        &self,
        target: &RequestPath,
        body: ByteStream,
        ctx: &RequestContext,
    ) -> Result<UploadOutcome, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        provider.ensure_writable("upload")?;
        let path = provider.validate(&target.path, false).await?;
        self.pipeline.upload(&provider, &path, body, &ctx.cancel).await
    }

    pub async fn delete(&self, target: &RequestPath, ctx: &RequestContext) -> Result<(), ProviderError> {
        let result = self.delete_inner(target, ctx).await;
        self.notify(
            ctx,
            CallbackPayload::new("delete", target.to_string(), result.as_ref().map(|_| None)),
        );
        result
    }

    async fn delete_inner(&self, target: &RequestPath, ctx: &RequestContext) -> Result<(), ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        provider.ensure_writable("delete")?;
        if target.path.is_root() {
            return Err(ProviderError::BadRequest(format!(
                "refusing to delete the root of '{}'",
                target.provider
            )));
        }
        let path = provider.validate(&target.path, true).await?;
        provider.delete(&path).await?;
        tracing::info!("[Gateway] Deleted {}", target);
        Ok(())
    }

    pub async fn create_folder(
        &self,
        target: &RequestPath,
        ctx: &RequestContext,
    ) -> Result<Metadata, ProviderError> {
        let result = self.create_folder_inner(target, ctx).await;
        self.notify(
            ctx,
            CallbackPayload::new(
                "create_folder",
                target.to_string(),
                result.as_ref().map(|m| Some(m.clone())),
            ),
        );
        result
    }

    async fn create_folder_inner(
        &self,
        target: &RequestPath,
        ctx: &RequestContext,
    ) -> Result<Metadata, ProviderError> {
        let provider = self.bind(&target.provider, ctx)?;
        provider.ensure_writable("create_folder")?;
        if !target.path.is_folder() {
            return Err(ProviderError::BadRequest(format!(
                "{} is not a folder path",
                target
            )));
        }
        if target.path.is_root() {
            return Err(ProviderError::DestinationConflict(target.path.to_string()));
        }
        let path = provider.validate(&target.path, false).await?;
        if provider.exists(&path).await? {
            return Err(ProviderError::DestinationConflict(path.to_string()));
        }
        provider.create_folder(&path).await
    }

    /// Move or copy between any two registered providers
    pub async fn relocate(
        &self,
        action: RelocateAction,
        source: &RequestPath,
        destination: &RequestPath,
        policy: ConflictPolicy,
        ctx: &RequestContext,
    ) -> Result<RelocateOutcome, ProviderError> {
        let result = self
            .relocate_inner(action, source, destination, policy, ctx)
            .await;
        let failed: Vec<ChildFailure> = match &result {
            Ok(outcome) => outcome.failed_children.clone(),
            Err(_) => Vec::new(),
        };
        self.notify(
            ctx,
            CallbackPayload::new(
                &action.to_string(),
                source.to_string(),
                result.as_ref().map(|o| Some(o.metadata.clone())),
            )
            .with_destination(destination.to_string())
            .with_failed_children(failed),
        );
        result
    }

    async fn relocate_inner(
        &self,
        action: RelocateAction,
        source: &RequestPath,
        destination: &RequestPath,
        policy: ConflictPolicy,
        ctx: &RequestContext,
    ) -> Result<RelocateOutcome, ProviderError> {
        let src_provider = self.bind(&source.provider, ctx)?;
        let dest_provider = self.bind(&destination.provider, ctx)?;
        let src_path = src_provider.validate(&source.path, true).await?;
        let dest_path = dest_provider.validate(&destination.path, false).await?;
        self.orchestrator
            .relocate(
                action,
                Endpoint::new(&src_provider, &src_path),
                Endpoint::new(&dest_provider, &dest_path),
                policy,
                &ctx.cancel,
            )
            .await
    }

    pub async fn move_path(
        &self,
        source: &RequestPath,
        destination: &RequestPath,
        policy: ConflictPolicy,
        ctx: &RequestContext,
    ) -> Result<RelocateOutcome, ProviderError> {
        self.relocate(RelocateAction::Move, source, destination, policy, ctx)
            .await
    }

    pub async fn copy_path(
        &self,
        source: &RequestPath,
        destination: &RequestPath,
        policy: ConflictPolicy,
        ctx: &RequestContext,
    ) -> Result<RelocateOutcome, ProviderError> {
        self.relocate(RelocateAction::Copy, source, destination, policy, ctx)
            .await
    }
}
