//! Container engine adapter.
//!
//! A narrow async interface over the local Docker/Podman daemon via the
//! bollard API: container lifecycle, command execution with demuxed and
//! capped output, tar-based file transfer, image commit/list/remove, and
//! one-shot resource stats.
//!
//! ## Architecture
//!
//! - [`client`]: daemon connection with Docker→Podman fallback
//! - [`lifecycle`]: create/start/stop/pause/unpause/remove, idempotent
//! - [`exec`]: command execution with timeout and output caps
//! - [`files`]: put/get single files through tar streams
//! - [`images`]: pull, commit, list, remove
//! - [`stats`]: one-sample resource usage

mod client;
mod exec;
mod files;
mod images;
mod lifecycle;
mod spec;
mod stats;

pub use client::{Engine, RuntimeType};
pub use exec::{ExecOutput, ExecSpec, ExecSpecBuilder};
pub use images::ImageInfo;
pub use lifecycle::ManagedContainer;
pub use spec::ContainerSpec;
pub use stats::ContainerStats;

use std::time::Duration;

/// Label marking every container this server creates.
pub const MANAGED_LABEL: &str = "execbox.managed";

/// Label carrying the container's role (`pool` or `session`).
pub const ROLE_LABEL: &str = "execbox.role";

/// Label carrying the container's language tag.
pub const LANGUAGE_LABEL: &str = "execbox.language";

/// Engine adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Daemon API error
    #[error("engine API error: {0}")]
    Api(#[from] bollard::errors::Error),

    /// Container not found
    #[error("container not found: {0}")]
    NotFound(String),

    /// Command execution failed before producing a result
    #[error("execution error: {0}")]
    Exec(String),

    /// Execution deadline elapsed; the exec stream was closed
    #[error("execution timed out after {0:?}")]
    ExecTimeout(Duration),

    /// Tar stream encode/decode failure during file transfer
    #[error("file transfer error: {0}")]
    FileTransfer(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// General error
    #[error("engine error: {0}")]
    Other(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
