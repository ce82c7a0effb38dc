//! Security gate: stateless validators and the container hardening profile.
//!
//! Everything here runs before any container action. The code and package
//! validators are pattern-based and advisory, complementing the kernel-level
//! controls carried by the hardening profile; the path and volume validators
//! are load-bearing and gate every caller-supplied path.
//!
//! ## Architecture
//!
//! - [`code`]: per-language source blocklists
//! - [`packages`]: package-spec validation
//! - [`paths`]: workspace path sanitizer and volume-bind validation
//! - [`hardening`]: resource caps, capability set, seccomp profile

mod code;
mod hardening;
mod packages;
mod paths;

pub use code::validate_code;
pub use hardening::{HardeningProfile, SYSV_IPC_SYSCALLS, SecurityLevel, Ulimit};
pub use packages::validate_packages;
pub use paths::{WORKSPACE_ROOT, is_workspace_root, sanitize_path, validate_volume_binds};

/// Violations raised by the gate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SecurityError {
    /// Source matched a per-language blocklist pattern
    #[error("Dangerous pattern detected: {0}")]
    DangerousPattern(String),

    /// Package name is on the blocked identifier list
    #[error("blocked package: {0}")]
    BlockedPackage(String),

    /// Package spec is malformed or carries a disallowed source
    #[error("invalid package spec: {0}")]
    InvalidPackage(String),

    /// Path escapes the workspace or is otherwise malformed
    #[error("path violation: {0}")]
    PathViolation(String),

    /// Volume bind touches a protected host or container location
    #[error("forbidden mount: {0}")]
    ForbiddenMount(String),
}

/// Result type for gate checks.
pub type Result<T> = std::result::Result<T, SecurityError>;
