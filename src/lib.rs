//! Chunked binary uploads for an interactive visualization server.
//!
//! A client declares the files it is about to send, streams them as binary
//! frames, and gets exactly one response once every file is loaded into the
//! scene, loading failed, or the request was cancelled. Progress is
//! reported while bytes arrive and while loaders run.

pub mod assembler;
pub mod cancel;
pub mod config;
mod errors;
pub mod loader;
pub mod param;
pub mod pipeline;
pub mod progress;
pub mod rpc;
pub mod scene;
pub mod session;
pub mod task;
pub mod upload;

pub use errors::{
    LoadError, Result, UploadError, ALREADY_PENDING_REQUEST,
    INVALID_BINARY_RECEIVE, INVALID_PATH, LOADING_BINARY_FAILED,
    MISSING_PARAMS, RUNTIME_ERROR, UNSUPPORTED_TYPE,
};

pub use assembler::{AssemblerStatus, ChunkAssembler};
pub use config::PipelineConfig;
pub use loader::{Loader, LoaderRegistry};
pub use param::{Blob, ParameterDescriptor};
pub use pipeline::LoadingPipeline;
pub use progress::{Progress, ProgressReport};
pub use rpc::{Outgoing, UploadService};
pub use scene::{LoadedModel, Scene, SharedScene};
pub use session::{SessionStatus, UploadSession};
pub use task::{
    CancellableTask, ClientId, TaskOutcome, TaskRegistry, TaskState,
    WorkerPool,
};

/// Declared type that is always accepted and loads until cancelled.
pub const FOREVER_TYPE: &str = "forever";
