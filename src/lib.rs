// Storage Gateway - one file/folder contract over many storage backends
// Streaming uploads/downloads, cross-backend move/copy, outcome callbacks

pub mod archive;
pub mod callback;
pub mod config;
pub mod engine;
pub mod logging;
pub mod metadata;
pub mod orchestrator;
pub mod path;
pub mod pipeline;
pub mod providers;
pub mod stream;

pub use callback::{CallbackDispatcher, CallbackPayload, CallbackQueue, HttpCallbackTransport};
pub use config::{load_config, GatewayConfig};
pub use engine::{Gateway, RequestContext};
pub use metadata::{Metadata, MetadataResponse};
pub use orchestrator::{ConflictPolicy, RelocateAction, RelocateOutcome, TransferMode};
pub use path::{GatewayPath, RequestPath};
pub use providers::{
    BoundProvider, Capabilities, ErrorKind, ProviderCredentials, ProviderError, ProviderFactory,
    ProviderRegistry, StorageProvider,
};
pub use stream::{ByteRange, ByteStream, StreamSize};
