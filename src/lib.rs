//! # execbox
//!
//! A local, multi-language code-execution sandbox served over the Model
//! Context Protocol (stdio JSON-RPC). Untrusted snippets run inside
//! hardened containers on the host's Docker/Podman engine; results carry
//! captured stdout/stderr, exit code, and duration.
//!
//! ## Architecture Overview
//!
//! The system consists of several key components organized into modules:
//!
//! - **[`engine`]**: thin adapter over the container engine (bollard)
//! - **[`security`]**: stateless validators and the hardening profile
//! - **[`audit`]**: append-only event trail (ring buffer + JSONL files)
//! - **[`runtime`]**: per-language adapters translating code to commands
//! - **[`pool`]**: pre-warmed container pool with LRU eviction
//! - **[`cache`]**: package-install image cache keyed by content hash
//! - **[`session`]**: named long-lived containers with TTL expiry
//! - **[`limiter`]**: sliding-window request limiter
//! - **[`server`]**: the MCP tool surface and service facade
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use execbox::{ServerConfig, server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::from_env();
//!     let service = server::SandboxService::new(config).await?;
//!     server::run(service).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Ownership model
//!
//! A container belongs to exactly one owner at any instant: the pool while
//! idle, the caller during a poolless execution, or a session for its
//! whole lifetime. Cache images outlive containers and belong to the
//! package cache.

/// Append-only audit trail with ring-buffer queries.
pub mod audit;

/// Package-install image cache.
pub mod cache;

/// Server configuration and environment overrides.
pub mod config;

/// Container engine adapter (bollard).
pub mod engine;

/// Error taxonomy for the tool boundary.
pub mod error;

/// Sliding-window rate limiter.
pub mod limiter;

/// Warm container pool.
pub mod pool;

/// Per-language runtime adapters.
pub mod runtime;

/// Security gate: validators and hardening.
pub mod security;

/// MCP tool surface and service facade.
pub mod server;

/// Named long-lived sessions.
pub mod session;

// Re-export the types most callers need
pub use config::{PoolConfig, ServerConfig};
pub use engine::{ContainerSpec, Engine, ExecOutput, ExecSpec};
pub use error::{Result, SandboxError};
pub use runtime::{Language, RuntimeAdapter};
pub use security::SecurityLevel;
pub use server::{SandboxServer, SandboxService};
pub use session::{CreateSessionOptions, Session, SessionStore};
