//! Session store and TTL janitor.
//!
//! One store owns every session. Both indexes (id and name) live behind a
//! single lock; engine calls never happen while it is held. Destruction is
//! race-safe: the janitor and explicit destroy calls can interleave freely
//! because the map entry is claimed before the container is touched and
//! "already gone" engine responses count as success.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::engine::{ContainerSpec, Engine};
use crate::runtime::{Language, ML_PYTHON_IMAGE};
use crate::security::{HardeningProfile, SecurityLevel};
use crate::session::{CreateSessionOptions, Session, SessionError, SessionState};

/// Client-facing session summary.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub language: String,
    pub state: SessionState,
    pub created_at: String,
    pub last_used_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_remaining_secs: Option<i64>,
    pub package_count: usize,
    pub gpu: bool,
    pub ml: bool,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            name: session.name.clone(),
            language: session.language.as_str().to_string(),
            state: session.state,
            created_at: session.created_at.to_rfc3339(),
            last_used_at: session.last_used_at.to_rfc3339(),
            expires_at: session.expires_at.map(|t| t.to_rfc3339()),
            ttl_remaining_secs: session
                .expires_at
                .map(|t| (t - Utc::now()).num_seconds().max(0)),
            package_count: session.packages.len(),
            gpu: session.gpu,
            ml: session.ml,
        }
    }
}

#[derive(Default)]
struct SessionMaps {
    by_id: HashMap<String, Session>,
    name_to_id: HashMap<String, String>,
}

/// Store owning all sessions and the expiry janitor.
pub struct SessionStore {
    engine: Engine,
    audit: Arc<AuditLog>,
    security_level: SecurityLevel,
    maps: Mutex<SessionMaps>,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionStore {
    pub fn new(engine: Engine, audit: Arc<AuditLog>, security_level: SecurityLevel) -> Arc<Self> {
        Arc::new(Self {
            engine,
            audit,
            security_level,
            maps: Mutex::new(SessionMaps::default()),
            janitor: Mutex::new(None),
        })
    }

    /// Start the janitor at the given interval.
    pub async fn start_janitor(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let handle = tokio::spawn(async move {
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.reap_expired().await;
            }
        });
        *self.janitor.lock().await = Some(handle);
    }

    /// Create a session bound to `name`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a duplicate name and engine errors when
    /// the container cannot be created or started.
    pub async fn create(
        &self,
        name: &str,
        options: CreateSessionOptions,
    ) -> Result<Session, SessionError> {
        if name.is_empty() {
            return Err(SessionError::Invalid("session name is empty".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();

        // Reserve the name before creating the container so concurrent
        // creates with the same name race on the map, not on the engine.
        {
            let mut maps = self.maps.lock().await;
            if maps.name_to_id.contains_key(name) {
                return Err(SessionError::AlreadyExists(name.to_string()));
            }
            maps.name_to_id.insert(name.to_string(), id.clone());
        }

        let result = self.create_container(&id, &options).await;
        let container_id = match result {
            Ok(container_id) => container_id,
            Err(e) => {
                // Release the reservation
                self.maps.lock().await.name_to_id.remove(name);
                return Err(SessionError::Engine(e));
            }
        };

        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            name: name.to_string(),
            language: options.language,
            container_id: container_id.clone(),
            state: SessionState::Active,
            created_at: now,
            last_used_at: now,
            expires_at: options
                .ttl
                .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_default()),
            packages: Vec::new(),
            env: options.env,
            gpu: options.gpu,
            ml: options.ml,
        };

        self.maps
            .lock()
            .await
            .by_id
            .insert(id.clone(), session.clone());

        info!(
            "Created session '{}' ({}) with container {}",
            name,
            &id[..8],
            container_id.get(..12).unwrap_or(&container_id)
        );
        self.audit.record(
            AuditEvent::new(EventType::SessionCreate)
                .language(options.language.as_str())
                .session(id)
                .container(container_id)
                .detail("name", name)
                .detail("ttl_secs", options.ttl.map(|t| t.as_secs()).unwrap_or(0))
                .detail("ml", options.ml),
        );

        Ok(session)
    }

    async fn create_container(
        &self,
        id: &str,
        options: &CreateSessionOptions,
    ) -> crate::engine::Result<String> {
        let image = if options.ml {
            ML_PYTHON_IMAGE.to_string()
        } else {
            options.language.default_image().to_string()
        };

        let hardening = HardeningProfile::for_level_with_syscalls(
            self.security_level,
            options.language.syscall_extras(),
        );
        let mut spec = ContainerSpec::new(image, hardening)
            .role("session")
            .language_label(options.language.as_str())
            .gpu(options.gpu)
            .envs(options.env.clone());
        if let Some(memory) = options.memory_bytes {
            spec = spec.memory_bytes(memory);
        }
        if let Some(cpu) = options.cpu_quota {
            spec = spec.cpu_quota(cpu);
        }

        let short_id = id.get(..12).unwrap_or(id);
        let container_name = format!("execbox-session-{short_id}");

        let container_id = self.engine.create_container(&spec, Some(&container_name)).await?;
        self.engine.start_container(&container_id).await?;
        Ok(container_id)
    }

    /// Look up a session by name or id. Refreshes `last_used_at` on hit;
    /// missing sessions yield `None`, never an error.
    pub async fn get(&self, name_or_id: &str) -> Option<Session> {
        let mut maps = self.maps.lock().await;
        let id = match maps.name_to_id.get(name_or_id) {
            Some(id) => id.clone(),
            None => name_or_id.to_string(),
        };
        let session = maps.by_id.get_mut(&id)?;
        session.last_used_at = Utc::now();
        Some(session.clone())
    }

    /// All sessions, for the list action.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let maps = self.maps.lock().await;
        let mut summaries: Vec<SessionSummary> =
            maps.by_id.values().map(SessionSummary::from).collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    /// Pause a session's container. Pausing a paused session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sessions and engine errors otherwise.
    pub async fn pause(&self, name_or_id: &str) -> Result<(), SessionError> {
        let (id, container_id, state) = self.resolve(name_or_id).await?;
        if state == SessionState::Paused {
            return Ok(());
        }

        self.engine.pause_container(&container_id).await?;
        self.set_state(&id, SessionState::Paused, false).await;
        self.audit
            .record(AuditEvent::new(EventType::SessionPause).session(id).container(container_id));
        Ok(())
    }

    /// Resume a paused session. Resuming an active session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sessions and engine errors otherwise.
    pub async fn resume(&self, name_or_id: &str) -> Result<(), SessionError> {
        let (id, container_id, state) = self.resolve(name_or_id).await?;
        if state != SessionState::Paused {
            return Ok(());
        }

        self.engine.unpause_container(&container_id).await?;
        self.set_state(&id, SessionState::Active, true).await;
        self.audit
            .record(AuditEvent::new(EventType::SessionResume).session(id).container(container_id));
        Ok(())
    }

    /// Extend a session's TTL by `delta`. An unset expiry becomes
    /// now + delta; a set one moves out by delta.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown sessions.
    pub async fn extend(
        &self,
        name_or_id: &str,
        delta: Duration,
    ) -> Result<chrono::DateTime<Utc>, SessionError> {
        let mut maps = self.maps.lock().await;
        let id = match maps.name_to_id.get(name_or_id) {
            Some(id) => id.clone(),
            None => name_or_id.to_string(),
        };
        let session = maps
            .by_id
            .get_mut(&id)
            .ok_or_else(|| SessionError::NotFound(name_or_id.to_string()))?;

        let delta = chrono::Duration::from_std(delta).unwrap_or_default();
        let new_expiry = match session.expires_at {
            Some(current) => current + delta,
            None => Utc::now() + delta,
        };
        session.expires_at = Some(new_expiry);
        let session_id = session.id.clone();
        drop(maps);

        self.audit.record(
            AuditEvent::new(EventType::SessionExtend)
                .session(session_id)
                .detail("expires_at", new_expiry.to_rfc3339()),
        );
        Ok(new_expiry)
    }

    /// Destroy a session and its container. A session that is already gone
    /// counts as destroyed; the janitor may have won the race.
    pub async fn destroy(&self, name_or_id: &str, reason: &str) -> Result<bool, SessionError> {
        // Claim the entry first so only one destroyer touches the engine
        let claimed = {
            let mut maps = self.maps.lock().await;
            let id = match maps.name_to_id.get(name_or_id) {
                Some(id) => id.clone(),
                None => name_or_id.to_string(),
            };
            maps.by_id.remove(&id).inspect(|session| {
                maps.name_to_id.remove(&session.name);
            })
        };

        let Some(session) = claimed else {
            debug!("Session {} already gone", name_or_id);
            return Ok(false);
        };

        let destroy_result = self.engine.destroy_container(&session.container_id).await;
        match destroy_result {
            Ok(()) => {
                info!("Destroyed session '{}' ({})", session.name, reason);
                self.audit.record(
                    AuditEvent::new(EventType::SessionDestroy)
                        .session(session.id)
                        .container(session.container_id)
                        .detail("name", session.name)
                        .detail("reason", reason),
                );
                Ok(true)
            }
            Err(e) => {
                // The map entry is already gone; report but do not resurrect
                warn!("Failed to destroy session container: {}", e);
                self.audit.record(
                    AuditEvent::new(EventType::SessionDestroy)
                        .session(session.id)
                        .container(session.container_id)
                        .detail("reason", reason)
                        .failed(e.to_string()),
                );
                Err(SessionError::Engine(e))
            }
        }
    }

    /// Append installed package names to a session's metadata.
    pub async fn record_packages(&self, name_or_id: &str, packages: &[String]) {
        let mut maps = self.maps.lock().await;
        let id = match maps.name_to_id.get(name_or_id) {
            Some(id) => id.clone(),
            None => name_or_id.to_string(),
        };
        if let Some(session) = maps.by_id.get_mut(&id) {
            for package in packages {
                if !session.packages.contains(package) {
                    session.packages.push(package.clone());
                }
            }
        }
    }

    /// Janitor pass: destroy every session whose expiry has passed.
    /// Failures are audited per session and do not stop the sweep.
    async fn reap_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let maps = self.maps.lock().await;
            maps.by_id
                .values()
                .filter(|session| session.expires_at.is_some_and(|t| t <= now))
                .map(|session| session.id.clone())
                .collect()
        };

        for id in expired {
            if let Err(e) = self.destroy(&id, "ttl expired").await {
                warn!("Janitor: destroying expired session {} failed: {}", id, e);
            }
        }
    }

    /// Stop the janitor and destroy every session concurrently.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.janitor.lock().await.take() {
            handle.abort();
        }

        let ids: Vec<String> = {
            let maps = self.maps.lock().await;
            maps.by_id.keys().cloned().collect()
        };

        info!("Shutting down {} session(s)", ids.len());
        join_all(ids.iter().map(|id| self.destroy(id, "server shutdown"))).await;
    }

    /// Count of live sessions.
    pub async fn count(&self) -> usize {
        self.maps.lock().await.by_id.len()
    }

    async fn resolve(
        &self,
        name_or_id: &str,
    ) -> Result<(String, String, SessionState), SessionError> {
        let maps = self.maps.lock().await;
        let id = match maps.name_to_id.get(name_or_id) {
            Some(id) => id.clone(),
            None => name_or_id.to_string(),
        };
        maps.by_id
            .get(&id)
            .map(|session| (session.id.clone(), session.container_id.clone(), session.state))
            .ok_or_else(|| SessionError::NotFound(name_or_id.to_string()))
    }

    async fn set_state(&self, id: &str, state: SessionState, touch: bool) {
        let mut maps = self.maps.lock().await;
        if let Some(session) = maps.by_id.get_mut(id) {
            session.state = state;
            if touch {
                session.last_used_at = Utc::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_ttl_remaining() {
        let now = Utc::now();
        let session = Session {
            id: "abc".to_string(),
            name: "dev".to_string(),
            language: Language::Python,
            container_id: "c1".to_string(),
            state: SessionState::Active,
            created_at: now,
            last_used_at: now,
            expires_at: Some(now + chrono::Duration::seconds(120)),
            packages: vec!["requests".to_string()],
            env: HashMap::new(),
            gpu: false,
            ml: false,
        };

        let summary = SessionSummary::from(&session);
        assert_eq!(summary.package_count, 1);
        let remaining = summary.ttl_remaining_secs.unwrap();
        assert!((115..=120).contains(&remaining));
    }

    #[test]
    fn test_summary_without_ttl() {
        let now = Utc::now();
        let session = Session {
            id: "abc".to_string(),
            name: "dev".to_string(),
            language: Language::Go,
            container_id: "c1".to_string(),
            state: SessionState::Paused,
            created_at: now,
            last_used_at: now,
            expires_at: None,
            packages: Vec::new(),
            env: HashMap::new(),
            gpu: false,
            ml: false,
        };

        let summary = SessionSummary::from(&session);
        assert!(summary.expires_at.is_none());
        assert!(summary.ttl_remaining_secs.is_none());
        assert_eq!(summary.state, SessionState::Paused);
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_session_lifecycle() {
        let engine = Engine::connect().await.unwrap();
        let audit = Arc::new(AuditLog::new(std::env::temp_dir().join("execbox-test"), 100));
        let store = SessionStore::new(engine, audit, SecurityLevel::Permissive);

        let session = store
            .create("lifecycle-test", CreateSessionOptions::new(Language::Bash))
            .await
            .unwrap();
        assert_eq!(session.state, SessionState::Active);

        // Duplicate name rejected
        let dup = store
            .create("lifecycle-test", CreateSessionOptions::new(Language::Bash))
            .await;
        assert!(matches!(dup, Err(SessionError::AlreadyExists(_))));

        // Pause twice is a no-op the second time
        store.pause("lifecycle-test").await.unwrap();
        store.pause("lifecycle-test").await.unwrap();
        assert_eq!(
            store.get("lifecycle-test").await.unwrap().state,
            SessionState::Paused
        );

        store.resume("lifecycle-test").await.unwrap();
        store.resume("lifecycle-test").await.unwrap();
        assert_eq!(
            store.get("lifecycle-test").await.unwrap().state,
            SessionState::Active
        );

        assert!(store.destroy("lifecycle-test", "test done").await.unwrap());
        // Second destroy: already gone counts as success
        assert!(!store.destroy("lifecycle-test", "test done").await.unwrap());
        assert!(store.get("lifecycle-test").await.is_none());
    }

    #[tokio::test]
    #[ignore]
    async fn test_ttl_expiry_reaped() {
        let engine = Engine::connect().await.unwrap();
        let audit = Arc::new(AuditLog::new(std::env::temp_dir().join("execbox-test"), 100));
        let store = SessionStore::new(engine, audit, SecurityLevel::Permissive);
        store.start_janitor(Duration::from_secs(1)).await;

        let mut options = CreateSessionOptions::new(Language::Bash);
        options.ttl = Some(Duration::from_secs(2));
        store.create("ttl-test", options).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(store.get("ttl-test").await.is_none());

        store.shutdown().await;
    }
}
