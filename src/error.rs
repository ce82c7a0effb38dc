//! Error taxonomy surfaced at the tool boundary.
//!
//! Each subsystem carries its own `thiserror` enum (`EngineError`,
//! `SecurityError`, `SessionError`); this module defines the flat taxonomy
//! that tool responses are expressed in, plus the conversions from the
//! subsystem errors into it.

use crate::engine::EngineError;
use crate::security::SecurityError;
use crate::session::SessionError;

/// Top-level error returned by every tool operation.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Malformed tool input; rejected before any side effect
    #[error("invalid input: {0}")]
    Validation(String),

    /// Denied by the security gate, before any container action
    #[error("security violation: {0}")]
    Security(#[from] SecurityError),

    /// Execution deadline elapsed
    #[error("execution timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// Engine reported OOM or a process/ulimit ceiling
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Engine or transport failure, original message preserved
    #[error("container engine error: {0}")]
    Container(String),

    /// Missing session or other named resource
    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate session name
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Throttled by the request limiter
    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },
}

impl SandboxError {
    /// Short machine-readable kind tag used in tool error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Security(_) => "security",
            Self::Timeout { .. } => "timeout",
            Self::ResourceLimit(_) => "resource_limit",
            Self::Container(_) => "container",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists(_) => "already_exists",
            Self::RateLimited { .. } => "rate_limited",
        }
    }
}

impl From<EngineError> for SandboxError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ExecTimeout(timeout) => Self::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
            EngineError::NotFound(id) => Self::Container(format!("container not found: {id}")),
            other => Self::Container(other.to_string()),
        }
    }
}

impl From<SessionError> for SandboxError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Invalid(reason) => Self::Validation(reason),
            SessionError::NotFound(name) => Self::NotFound(format!("session {name}")),
            SessionError::AlreadyExists(name) => Self::AlreadyExists(format!("session {name}")),
            SessionError::Engine(engine) => engine.into(),
        }
    }
}

/// Result type for tool-boundary operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn engine_timeout_maps_to_timeout_kind() {
        let err: SandboxError = EngineError::ExecTimeout(Duration::from_secs(30)).into();
        assert_eq!(err.kind(), "timeout");
        assert!(matches!(err, SandboxError::Timeout { timeout_ms: 30_000 }));
    }

    #[test]
    fn session_errors_map_to_named_kinds() {
        let missing: SandboxError = SessionError::NotFound("dev".into()).into();
        assert_eq!(missing.kind(), "not_found");

        let dup: SandboxError = SessionError::AlreadyExists("dev".into()).into();
        assert_eq!(dup.kind(), "already_exists");
    }
}
