//! Server configuration.
//!
//! Defaults are chosen for a developer workstation; environment variables
//! override the pool and cache knobs (`POOL_MIN_IDLE`, `POOL_MAX_ACTIVE`,
//! `CACHE_MAX_SIZE_GB`). `LOG_LEVEL` is consumed by the tracing setup in
//! `main`, not here.

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::security::SecurityLevel;

/// Top-level configuration for the sandbox server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Security level applied to every container the server creates
    pub security_level: SecurityLevel,
    /// Pool sizing and probe cadence
    pub pool: PoolConfig,
    /// Session TTL janitor cadence
    pub session_janitor_interval: Duration,
    /// Audit ring-buffer capacity
    pub audit_ring_capacity: usize,
    /// Directory holding audit JSONL files
    pub log_dir: PathBuf,
    /// Default execute timeout when the caller supplies none
    pub default_exec_timeout: Duration,
    /// Cap on returned stdout bytes per exec
    pub max_stdout_bytes: usize,
    /// Cap on returned stderr bytes per exec
    pub max_stderr_bytes: usize,
    /// Advisory ceiling for cache pruning, in bytes
    pub cache_max_bytes: u64,
    /// Cache images retained per language when pruning
    pub cache_keep_per_language: usize,
    /// Sliding-window rate limit: requests per window per caller key
    pub rate_limit: usize,
    /// Sliding-window length
    pub rate_window: Duration,
}

/// Container pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle containers maintained per warm language
    pub min_idle_per_language: usize,
    /// Total pooled containers before LRU eviction kicks in
    pub max_active: usize,
    /// Languages warmed at startup
    pub warm_languages: Vec<crate::runtime::Language>,
    /// Liveness probe cadence
    pub probe_interval: Duration,
    /// Timeout for the probe command itself
    pub probe_timeout: Duration,
    /// Default memory cap for pooled containers, bytes
    pub memory_bytes: i64,
    /// Default CPU quota for pooled containers, microseconds per 100ms period
    pub cpu_quota: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle_per_language: 1,
            max_active: 10,
            warm_languages: vec![
                crate::runtime::Language::Python,
                crate::runtime::Language::JavaScript,
            ],
            probe_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 50_000,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Standard,
            pool: PoolConfig::default(),
            session_janitor_interval: Duration::from_secs(60),
            audit_ring_capacity: 1_000,
            log_dir: default_log_dir(),
            default_exec_timeout: Duration::from_secs(30),
            max_stdout_bytes: 10 * 1024 * 1024,
            max_stderr_bytes: 5 * 1024 * 1024,
            cache_max_bytes: 10 * 1024 * 1024 * 1024,
            cache_keep_per_language: 5,
            rate_limit: 60,
            rate_window: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from defaults plus recognized environment
    /// variables. Unparsable values are ignored with a warning rather than
    /// failing startup.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(min_idle) = read_env_number::<usize>("POOL_MIN_IDLE") {
            config.pool.min_idle_per_language = min_idle;
        }
        if let Some(max_active) = read_env_number::<usize>("POOL_MAX_ACTIVE") {
            config.pool.max_active = max_active.max(1);
        }
        if let Some(gb) = read_env_number::<u64>("CACHE_MAX_SIZE_GB") {
            config.cache_max_bytes = gb.saturating_mul(1024 * 1024 * 1024);
        }

        config
    }
}

/// Audit logs live under the user config root, next to nothing else we
/// persist; all runtime state is in-process.
fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".execbox")
        .join("logs")
}

fn read_env_number<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", name, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.pool.min_idle_per_language, 1);
        assert_eq!(config.pool.max_active, 10);
        assert_eq!(config.audit_ring_capacity, 1_000);
        assert_eq!(config.max_stdout_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_stderr_bytes, 5 * 1024 * 1024);
        assert_eq!(config.default_exec_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_log_dir_is_under_config_root() {
        let dir = default_log_dir();
        assert!(dir.ends_with(".execbox/logs") || dir.ends_with("logs"));
    }
}
