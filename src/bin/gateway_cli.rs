//! Storage Gateway CLI - drive the gateway against an in-memory store
//!
//! Usage:
//!   storage-gateway-cli --seed ./dir ls mem/
//!   storage-gateway-cli --seed ./dir get mem/a.txt --range bytes=0-9
//!   storage-gateway-cli put ./local.txt mem/docs/local.txt
//!   storage-gateway-cli --seed ./dir cp mem/a.txt flat/b.txt
//!   storage-gateway-cli --seed ./dir mv mem/docs/ flat/archive/ --replace
//!   storage-gateway-cli --seed ./dir zip mem/docs/ -o docs.zip
//!
//! `mem` relocates natively; `flat` shares the same store without native
//! move/copy, ranged reads, atomic replace or reported sizes, so transfers
//! between the two exercise the emulated paths. `dav` is a WebDAV backend
//! configured with `--webdav-url` (password from `GATEWAY_WEBDAV_PASSWORD`).

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use storage_gateway::callback::{CallbackDispatcher, HttpCallbackTransport};
use storage_gateway::engine::{Gateway, RequestContext};
use storage_gateway::pipeline::forward;
use storage_gateway::providers::retry::HttpRetryConfig;
use storage_gateway::providers::{
    Capabilities, MemoryFactory, MemoryOptions, MemoryStore, ProviderCredentials, ProviderRegistry,
    WebDavFactory,
};
use storage_gateway::{ByteRange, ByteStream, ConflictPolicy, RequestPath, StreamSize};

const WEBDAV_PASSWORD_ENV: &str = "GATEWAY_WEBDAV_PASSWORD";

#[derive(Parser)]
#[command(
    name = "storage-gateway-cli",
    about = "Storage Gateway CLI - one file/folder contract over many backends",
    version
)]
struct Cli {
    /// Config file (default: <config_dir>/storage-gateway/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Local directory copied into the in-memory store before the command runs
    #[arg(long, global = true)]
    seed: Option<PathBuf>,
    /// URL notified with the outcome of the command
    #[arg(long, global = true)]
    callback: Option<String>,
    /// Base URL of the WebDAV backend registered as `dav`
    #[arg(long, global = true)]
    webdav_url: Option<String>,
    #[arg(long, global = true)]
    webdav_user: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file
    Put {
        /// Local file path
        local: PathBuf,
        /// Target, e.g. mem/docs/a.txt
        target: String,
    },
    /// Download a file to stdout or a local path
    Get {
        target: String,
        /// Byte range, e.g. bytes=0-99
        #[arg(long)]
        range: Option<String>,
        #[arg(long)]
        revision: Option<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print metadata of a file or the listing of a folder
    Ls { target: String },
    /// Copy a file or folder
    Cp {
        source: String,
        destination: String,
        /// Replace an existing destination
        #[arg(long)]
        replace: bool,
    },
    /// Move a file or folder
    Mv {
        source: String,
        destination: String,
        #[arg(long)]
        replace: bool,
    },
    /// Download a folder as a ZIP archive
    Zip {
        target: String,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    storage_gateway::logging::init();
    let cli = Cli::parse();
    let config = storage_gateway::load_config(cli.config.as_deref());

    let store = Arc::new(MemoryStore::new());
    if let Some(dir) = &cli.seed {
        let count = seed(&store, dir, dir).await?;
        tracing::info!("Seeded {} file(s) from {}", count, dir.display());
    }

    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MemoryFactory::new(store.clone(), MemoryOptions::named("mem"))));
    registry.register(Arc::new(MemoryFactory::new(store.clone(), flat_options())));
    registry.register(Arc::new(WebDavFactory::new(
        "dav",
        Duration::from_secs(60),
        HttpRetryConfig::default(),
    )?));

    let dispatcher = match &cli.callback {
        Some(_) => {
            let transport = HttpCallbackTransport::new(Duration::from_secs(config.callback.timeout_secs))?;
            Some(CallbackDispatcher::spawn(config.callback.clone(), Arc::new(transport)))
        }
        None => None,
    };
    let gateway = Gateway::new(registry, &config, dispatcher.as_ref().map(|d| d.queue()));

    let mut ctx = RequestContext::new();
    if let Some(url) = &cli.callback {
        ctx = ctx.with_callback(url.clone());
    }
    if let Some(url) = &cli.webdav_url {
        let mut credentials = ProviderCredentials {
            settings: serde_json::json!({ "url": url }),
            ..Default::default()
        };
        if let Some(user) = &cli.webdav_user {
            credentials.credentials.insert("username".into(), user.clone());
        }
        if let Ok(password) = std::env::var(WEBDAV_PASSWORD_ENV) {
            credentials.credentials.insert("password".into(), password);
        }
        ctx = ctx.with_credentials("dav", credentials);
    }

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    let result = run(&gateway, &ctx, config.pipeline.chunk_size, cli.command).await;

    if let Some(dispatcher) = dispatcher {
        let report = dispatcher.shutdown().await;
        eprintln!(
            "Callbacks: {} delivered, {} exhausted",
            report.delivered,
            report.exhausted.len()
        );
    }
    result
}

async fn run(gateway: &Gateway, ctx: &RequestContext, chunk_size: usize, command: Commands) -> Result<()> {
    match command {
        Commands::Put { local, target } => {
            let target = RequestPath::parse(&target)?;
            let file = tokio::fs::File::open(&local)
                .await
                .with_context(|| format!("opening {}", local.display()))?;
            let size = file.metadata().await?.len();
            let body = ByteStream::from_reader(file, StreamSize::Known(size), chunk_size)
                .with_content_type(mime_guess::from_path(&local).first().map(|m| m.to_string()));
            let outcome = gateway.upload(&target, body, ctx).await?;
            println!("{}", serde_json::to_string_pretty(&outcome.metadata)?);
            eprintln!("{} {}", if outcome.created { "Created" } else { "Updated" }, target);
        }
        Commands::Get {
            target,
            range,
            revision,
            output,
        } => {
            let target = RequestPath::parse(&target)?;
            let range = range.as_deref().map(ByteRange::parse).transpose()?;
            let download = gateway
                .download(&target, range, revision.as_deref(), ctx)
                .await?;
            if let Some(content_range) = download.content_range() {
                eprintln!("Content-Range: {}", content_range);
            }
            let name = download.display_name().to_string();
            let written = match output {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("creating {}", path.display()))?;
                    let n = forward(download.stream, &mut file).await?;
                    file.flush().await?;
                    n
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let n = forward(download.stream, &mut stdout).await?;
                    stdout.flush().await?;
                    n
                }
            };
            eprintln!("{}: {} bytes", name, written);
        }
        Commands::Ls { target } => {
            let target = RequestPath::parse(&target)?;
            let response = gateway.metadata(&target, None, ctx).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Cp {
            source,
            destination,
            replace,
        } => {
            let (source, destination) = (RequestPath::parse(&source)?, RequestPath::parse(&destination)?);
            let outcome = gateway
                .copy_path(&source, &destination, policy(replace), ctx)
                .await?;
            report_relocation("Copied", &outcome)?;
        }
        Commands::Mv {
            source,
            destination,
            replace,
        } => {
            let (source, destination) = (RequestPath::parse(&source)?, RequestPath::parse(&destination)?);
            let outcome = gateway
                .move_path(&source, &destination, policy(replace), ctx)
                .await?;
            report_relocation("Moved", &outcome)?;
        }
        Commands::Zip { target, output } => {
            let target = RequestPath::parse(&target)?;
            let archive = gateway.zip(&target, ctx).await?;
            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            let written = forward(archive, &mut file).await?;
            file.flush().await?;
            eprintln!("Wrote {} ({} bytes)", output.display(), written);
        }
    }
    Ok(())
}

fn policy(replace: bool) -> ConflictPolicy {
    if replace {
        ConflictPolicy::Replace
    } else {
        ConflictPolicy::Fail
    }
}

fn report_relocation(verb: &str, outcome: &storage_gateway::RelocateOutcome) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&outcome.metadata)?);
    eprintln!("{} ({:?})", verb, outcome.mode);
    if outcome.is_partial() {
        for failure in &outcome.failed_children {
            eprintln!("  failed: {} ({})", failure.path, failure.error.message);
        }
        bail!("{} of the entries could not be transferred", outcome.failed_children.len());
    }
    Ok(())
}

/// Second view of the store with every optional capability switched off
fn flat_options() -> MemoryOptions {
    let mut options = MemoryOptions::named("flat");
    options.capabilities = Capabilities::default();
    options.report_size = false;
    options.report_hashes = false;
    options
}

/// Copy every regular file under `dir` into the store, keyed relative to `root`
async fn seed(store: &MemoryStore, root: &Path, dir: &Path) -> Result<usize> {
    let mut count = 0;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current)
            .await
            .with_context(|| format!("reading {}", current.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                let relative = path.strip_prefix(root)?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                store.put(&format!("/{}", key), tokio::fs::read(&path).await?);
                count += 1;
            }
        }
    }
    Ok(count)
}
