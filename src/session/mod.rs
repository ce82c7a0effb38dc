//! Named long-lived sandbox sessions.
//!
//! A session binds a unique name to a container that survives across tool
//! calls, with optional TTL-based expiry enforced by a janitor task.
//! Session containers are owned by the store for their entire lifetime and
//! are never pooled.

mod store;

pub use store::{SessionStore, SessionSummary};

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::engine::EngineError;
use crate::runtime::Language;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Paused,
    Stopped,
}

/// A live session record.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub language: Language,
    pub container_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Packages installed into this session so far
    pub packages: Vec<String>,
    pub env: HashMap<String, String>,
    pub gpu: bool,
    /// Whether this session runs the ML Python image
    pub ml: bool,
}

/// Options for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSessionOptions {
    pub language: Language,
    /// Opt into the ML Python image (Python only)
    pub ml: bool,
    pub ttl: Option<Duration>,
    pub memory_bytes: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub env: HashMap<String, String>,
    pub gpu: bool,
}

impl CreateSessionOptions {
    pub fn new(language: Language) -> Self {
        Self {
            language,
            ml: false,
            ttl: None,
            memory_bytes: None,
            cpu_quota: None,
            env: HashMap::new(),
            gpu: false,
        }
    }
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Malformed session request (empty name, bad option combination)
    #[error("invalid session request: {0}")]
    Invalid(String),

    /// A session with this name is already registered
    #[error("session already exists: {0}")]
    AlreadyExists(String),

    /// No session with this name or id
    #[error("session not found: {0}")]
    NotFound(String),

    /// Engine failure while acting on the session's container
    #[error(transparent)]
    Engine(#[from] EngineError),
}
