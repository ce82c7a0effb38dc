//! Sandbox service facade.
//!
//! Owns every subsystem and implements the tool flows: validate, pick a
//! container (session or pool), translate, execute, audit, release. The
//! MCP handler is a thin shim over this type.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::cache::PackageCache;
use crate::config::ServerConfig;
use crate::engine::{Engine, ExecSpec};
use crate::error::{Result, SandboxError};
use crate::limiter::{RateDecision, RateLimiter};
use crate::pool::ContainerPool;
use crate::runtime::{
    ExecContext, ExecutionOutcome, Language, ML_PYTHON_IMAGE, MlOptions, MlRuntime, RuntimeAdapter,
    validate_ml_packages,
};
use crate::security::{self, is_workspace_root};
use crate::server::types::*;
use crate::session::{CreateSessionOptions, SessionStore};

/// Exit code the kernel reports for an OOM-killed process.
const OOM_EXIT_CODE: i64 = 137;

/// Top-level sandbox service: all components, constructed once.
pub struct SandboxService {
    config: ServerConfig,
    engine: Engine,
    audit: Arc<AuditLog>,
    pool: Arc<ContainerPool>,
    sessions: Arc<SessionStore>,
    cache: PackageCache,
    limiter: RateLimiter,
}

impl SandboxService {
    /// Connect to the engine and bring up every subsystem.
    ///
    /// # Errors
    ///
    /// Returns error when no container engine is reachable.
    pub async fn new(config: ServerConfig) -> Result<Arc<Self>> {
        let engine =
            Engine::connect_with_limits(config.max_stdout_bytes, config.max_stderr_bytes).await?;

        let audit = Arc::new(AuditLog::new(
            config.log_dir.clone(),
            config.audit_ring_capacity,
        ));

        sweep_orphans(&engine).await;

        let pool = ContainerPool::new(
            engine.clone(),
            Arc::clone(&audit),
            config.pool.clone(),
            config.security_level,
        );
        pool.start().await;

        let sessions = SessionStore::new(engine.clone(), Arc::clone(&audit), config.security_level);
        sessions.start_janitor(config.session_janitor_interval).await;

        let cache = PackageCache::new(
            engine.clone(),
            Arc::clone(&audit),
            config.cache_keep_per_language,
            config.cache_max_bytes,
        );

        let limiter = RateLimiter::new(config.rate_limit, config.rate_window);
        limiter.start_sweeper(config.rate_window).await;

        Ok(Arc::new(Self {
            config,
            engine,
            audit,
            pool,
            sessions,
            cache,
            limiter,
        }))
    }

    /// Execute a code snippet.
    pub async fn execute(&self, args: ExecuteArgs) -> Result<ExecuteResponse> {
        let key = args.session.clone().unwrap_or_else(|| "anonymous".to_string());
        self.check_rate(&key).await?;

        let ml = args.ml.unwrap_or(false);
        if ml && args.language != Language::Python {
            return Err(SandboxError::Validation(
                "ml execution is only available for python".to_string(),
            ));
        }
        if args.code.trim().is_empty() {
            return Err(SandboxError::Validation("code is empty".to_string()));
        }

        let code_hash = hash_code(&args.code);

        // Screen before any container is touched
        if let Err(violation) = security::validate_code(args.language, &args.code) {
            self.audit.record(
                AuditEvent::new(EventType::ExecuteBlocked)
                    .language(args.language.as_str())
                    .detail("code_hash", code_hash.clone())
                    .failed(violation.to_string()),
            );
            return Err(violation.into());
        }

        let timeout = args
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.config.default_exec_timeout);

        // Session containers are used in place; poolless runs borrow from
        // the pool and return (or discard) afterwards.
        let (container_id, session_id, borrowed) = match args.session {
            Some(ref name_or_id) => {
                let session = self
                    .sessions
                    .get(name_or_id)
                    .await
                    .ok_or_else(|| SandboxError::NotFound(format!("session {name_or_id}")))?;
                (session.container_id, Some(session.id), None)
            }
            None => {
                let custom_image = ml.then_some(ML_PYTHON_IMAGE);
                let acquired = self.pool.acquire(args.language, custom_image).await?;
                (acquired.container_id.clone(), None, Some(acquired))
            }
        };

        self.audit.record(
            AuditEvent::new(EventType::ExecuteStart)
                .language(args.language.as_str())
                .container(container_id.clone())
                .detail("code_hash", code_hash.clone())
                .detail("ml", ml),
        );

        let mut ctx = ExecContext::new(timeout);
        if let Some(env) = args.env {
            ctx.env = env;
        }
        ctx.stdin = args.stdin;

        let result = if ml {
            let runtime = MlRuntime::new(MlOptions::default());
            runtime
                .execute(&self.engine, &container_id, &args.code, &ctx)
                .await
        } else {
            let adapter = RuntimeAdapter::for_language(args.language);
            adapter
                .execute(&self.engine, &container_id, &args.code, &ctx)
                .await
        };

        let response = self
            .finish_execute(
                result,
                args.language,
                &container_id,
                session_id.as_deref(),
                &code_hash,
                timeout,
            )
            .await;

        if let Some(acquired) = borrowed {
            match response {
                // A timed-out container may still be running the command;
                // do not hand it to the next caller.
                Err(SandboxError::Timeout { .. }) | Err(SandboxError::Container(_)) => {
                    self.pool.discard(acquired).await;
                }
                _ => {
                    if let Err(e) = self.pool.release(acquired).await {
                        warn!("Pool release failed: {}", e);
                    }
                }
            }
        }

        response
    }

    async fn finish_execute(
        &self,
        result: Result<ExecutionOutcome>,
        language: Language,
        container_id: &str,
        session_id: Option<&str>,
        code_hash: &str,
        timeout: Duration,
    ) -> Result<ExecuteResponse> {
        let attach = |mut event: AuditEvent| {
            event = event
                .language(language.as_str())
                .container(container_id.to_string())
                .detail("code_hash", code_hash.to_string());
            if let Some(id) = session_id {
                event = event.session(id.to_string());
            }
            event
        };

        match result {
            Ok(outcome) => {
                // OOM kills surface as 137 with the kernel flag set
                if outcome.exit_code == OOM_EXIT_CODE
                    && self.engine.was_oom_killed(container_id).await.unwrap_or(false)
                {
                    self.audit.record(
                        attach(AuditEvent::new(EventType::ExecuteError))
                            .failed("out of memory"),
                    );
                    return Err(SandboxError::ResourceLimit(
                        "container memory limit exceeded".to_string(),
                    ));
                }

                let duration_ms = outcome.duration.as_millis() as u64;
                let event = attach(AuditEvent::new(EventType::ExecuteEnd)).duration_ms(duration_ms);
                self.audit.record(if outcome.exit_code == 0 {
                    event
                } else {
                    event.failed(format!("exit code {}", outcome.exit_code))
                });

                Ok(ExecuteResponse {
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    exit_code: outcome.exit_code,
                    duration: duration_ms,
                    metrics: outcome.metrics,
                })
            }
            Err(SandboxError::Timeout { timeout_ms }) => {
                self.audit.record(
                    attach(AuditEvent::new(EventType::ExecuteTimeout))
                        .duration_ms(timeout.as_millis() as u64)
                        .failed(format!("deadline of {timeout_ms} ms elapsed")),
                );
                Err(SandboxError::Timeout { timeout_ms })
            }
            Err(err) => {
                self.audit
                    .record(attach(AuditEvent::new(EventType::ExecuteError)).failed(err.to_string()));
                Err(err)
            }
        }
    }

    /// Handle a `sandbox_session` action.
    pub async fn session(&self, args: SessionArgs) -> Result<SessionResponse> {
        match args.action {
            SessionAction::List => {
                let sessions = self.sessions.list().await;
                let count = sessions.len();
                Ok(SessionResponse::with_data(
                    format!("{count} session(s)"),
                    serde_json::to_value(sessions).unwrap_or_default(),
                ))
            }
            SessionAction::Create => {
                let name = require(args.name.as_deref(), "name")?;
                let language = args
                    .language
                    .ok_or_else(|| SandboxError::Validation("language is required".to_string()))?;
                let ttl = args
                    .ttl
                    .ok_or_else(|| SandboxError::Validation("ttl is required for create".to_string()))?;
                let ml = args.ml.unwrap_or(false);
                if ml && language != Language::Python {
                    return Err(SandboxError::Validation(
                        "ml sessions are only available for python".to_string(),
                    ));
                }

                let mut options = CreateSessionOptions::new(language);
                options.ml = ml;
                options.gpu = args.gpu.unwrap_or(false);
                options.ttl = Some(Duration::from_secs(ttl));

                let session = self.sessions.create(name, options).await?;
                Ok(SessionResponse::with_data(
                    format!("created session '{name}'"),
                    serde_json::to_value(crate::session::SessionSummary::from(&session))
                        .unwrap_or_default(),
                ))
            }
            SessionAction::Get => {
                let name = require(args.name.as_deref(), "name")?;
                match self.sessions.get(name).await {
                    Some(session) => Ok(SessionResponse::with_data(
                        format!("session '{name}'"),
                        serde_json::to_value(crate::session::SessionSummary::from(&session))
                            .unwrap_or_default(),
                    )),
                    None => Ok(SessionResponse {
                        success: false,
                        message: format!("session '{name}' not found"),
                        data: None,
                    }),
                }
            }
            SessionAction::Pause => {
                let name = require(args.name.as_deref(), "name")?;
                self.sessions.pause(name).await?;
                Ok(SessionResponse::ok(format!("paused '{name}'")))
            }
            SessionAction::Resume => {
                let name = require(args.name.as_deref(), "name")?;
                self.sessions.resume(name).await?;
                Ok(SessionResponse::ok(format!("resumed '{name}'")))
            }
            SessionAction::Destroy => {
                let name = require(args.name.as_deref(), "name")?;
                let destroyed = self.sessions.destroy(name, "operator request").await?;
                Ok(SessionResponse::ok(if destroyed {
                    format!("destroyed '{name}'")
                } else {
                    format!("'{name}' was already gone")
                }))
            }
            SessionAction::Extend => {
                let name = require(args.name.as_deref(), "name")?;
                let ttl = args
                    .ttl
                    .ok_or_else(|| SandboxError::Validation("ttl is required for extend".to_string()))?;
                let expires = self
                    .sessions
                    .extend(name, Duration::from_secs(ttl))
                    .await?;
                Ok(SessionResponse::ok(format!(
                    "'{name}' now expires at {}",
                    expires.to_rfc3339()
                )))
            }
        }
    }

    /// Install packages into a session, via the image cache.
    pub async fn install(&self, args: InstallArgs) -> Result<InstallResponse> {
        self.check_rate(&args.session).await?;

        if args.packages.is_empty() {
            return Err(SandboxError::Validation("packages is empty".to_string()));
        }

        let session = self
            .sessions
            .get(&args.session)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("session {}", args.session)))?;

        // ML sessions only accept the curated library set
        let validation = if session.ml {
            validate_ml_packages(&args.packages)
        } else {
            security::validate_packages(session.language, &args.packages)
                .map(|_| ())
                .map_err(Into::into)
        };
        if let Err(violation) = validation {
            self.audit.record(
                AuditEvent::new(EventType::InstallBlocked)
                    .language(session.language.as_str())
                    .session(session.id.clone())
                    .detail("packages", args.packages.join(","))
                    .failed(violation.to_string()),
            );
            return Err(violation);
        }

        self.audit.record(
            AuditEvent::new(EventType::InstallStart)
                .language(session.language.as_str())
                .session(session.id.clone())
                .container(session.container_id.clone())
                .detail("packages", args.packages.join(",")),
        );

        let adapter = if session.ml {
            RuntimeAdapter::with_image(session.language, ML_PYTHON_IMAGE)
        } else {
            RuntimeAdapter::for_language(session.language)
        };
        let result = self
            .cache
            .ensure_installed(&adapter, &session.container_id, &args.packages)
            .await?;

        let event = AuditEvent::new(EventType::InstallEnd)
            .language(session.language.as_str())
            .session(session.id.clone())
            .container(session.container_id.clone())
            .detail("cached", result.cached)
            .duration_ms(result.duration_ms);
        self.audit.record(if result.success {
            event
        } else {
            event.failed(result.errors.join("; "))
        });

        if result.success {
            self.sessions
                .record_packages(&args.session, &result.installed)
                .await;
        }

        Ok(InstallResponse {
            success: result.success,
            cached: result.cached,
            duration: result.duration_ms,
            installed_packages: result.installed,
            errors: result.errors,
        })
    }

    /// File operations inside a session's workspace.
    pub async fn file_ops(&self, args: FileOpsArgs) -> Result<FileOpsResponse> {
        let session = self
            .sessions
            .get(&args.session)
            .await
            .ok_or_else(|| SandboxError::NotFound(format!("session {}", args.session)))?;

        let path = match security::sanitize_path(&args.path) {
            Ok(path) => path,
            Err(violation) => {
                self.audit.record(
                    AuditEvent::new(EventType::SecurityViolation)
                        .session(session.id.clone())
                        .detail("path", args.path.clone())
                        .failed(violation.to_string()),
                );
                return Err(violation.into());
            }
        };

        match args.operation {
            FileOperation::Read => {
                let bytes = self.engine.get_file(&session.container_id, &path).await?;
                self.audit.record(
                    AuditEvent::new(EventType::FileRead)
                        .session(session.id)
                        .detail("path", path),
                );
                Ok(FileOpsResponse {
                    success: true,
                    content: Some(String::from_utf8_lossy(&bytes).into_owned()),
                    entries: None,
                })
            }
            FileOperation::Write => {
                if is_workspace_root(&path) {
                    return Err(SandboxError::Validation(
                        "cannot write to the workspace root".to_string(),
                    ));
                }
                let content = args.content.ok_or_else(|| {
                    SandboxError::Validation("content is required for write".to_string())
                })?;
                self.engine
                    .put_file(&session.container_id, &path, content.as_bytes())
                    .await?;
                self.audit.record(
                    AuditEvent::new(EventType::FileWrite)
                        .session(session.id)
                        .detail("path", path)
                        .detail("bytes", content.len() as u64),
                );
                Ok(FileOpsResponse {
                    success: true,
                    content: None,
                    entries: None,
                })
            }
            FileOperation::List => {
                let spec = ExecSpec::builder(["ls", "-A", path.as_str()])
                    .timeout(Duration::from_secs(10))
                    .build();
                let output = self.engine.exec(&session.container_id, &spec).await?;
                if !output.success() {
                    return Err(SandboxError::NotFound(format!("path {path}")));
                }
                self.audit.record(
                    AuditEvent::new(EventType::FileList)
                        .session(session.id)
                        .detail("path", path),
                );
                Ok(FileOpsResponse {
                    success: true,
                    content: None,
                    entries: Some(
                        output
                            .stdout
                            .lines()
                            .map(str::to_string)
                            .filter(|line| !line.is_empty())
                            .collect(),
                    ),
                })
            }
            FileOperation::Delete => {
                if is_workspace_root(&path) {
                    return Err(SandboxError::Validation(
                        "cannot delete the workspace root".to_string(),
                    ));
                }
                let spec = ExecSpec::builder(["rm", "-rf", path.as_str()])
                    .timeout(Duration::from_secs(10))
                    .build();
                let output = self.engine.exec(&session.container_id, &spec).await?;
                self.audit.record(
                    AuditEvent::new(EventType::FileDelete)
                        .session(session.id)
                        .detail("path", path),
                );
                Ok(FileOpsResponse {
                    success: output.success(),
                    content: None,
                    entries: None,
                })
            }
        }
    }

    /// Stats blocks for `sandbox_inspect`.
    pub async fn inspect(&self, args: InspectArgs) -> Result<InspectResponse> {
        let mut response = InspectResponse::default();

        if matches!(args.target, InspectTarget::Pool | InspectTarget::All) {
            response.pool = Some(self.pool.stats().await);
        }
        if matches!(args.target, InspectTarget::Cache | InspectTarget::All) {
            response.cache = Some(self.cache.stats().await?);
        }
        if matches!(args.target, InspectTarget::Sessions | InspectTarget::All) {
            response.sessions = Some(self.sessions.list().await);
        }
        if matches!(args.target, InspectTarget::Audit | InspectTarget::All) {
            response.audit = Some(self.audit.stats());
        }
        if matches!(args.target, InspectTarget::All) {
            response.engine_reachable = Some(self.engine.ping().await.is_ok());
        }

        Ok(response)
    }

    /// Security views for `sandbox_security`.
    pub async fn security(&self, args: SecurityArgs) -> Result<SecurityResponse> {
        let count = args.count.unwrap_or(20);
        Ok(match args.action {
            SecurityAction::Events => SecurityResponse {
                events: Some(self.audit.security_events(count)),
                stats: None,
            },
            SecurityAction::Violations => {
                let filter = crate::audit::EventFilter {
                    event_type: Some(EventType::SecurityViolation),
                    ..Default::default()
                };
                SecurityResponse {
                    events: Some(self.audit.recent(count, Some(&filter))),
                    stats: None,
                }
            }
            SecurityAction::Stats => SecurityResponse {
                events: None,
                stats: Some(self.audit.stats()),
            },
        })
    }

    /// Graceful shutdown: stop timers, drain the pool, destroy sessions.
    pub async fn shutdown(&self) {
        info!("Shutting down sandbox service");
        self.audit.record(AuditEvent::new(EventType::Shutdown));

        self.limiter.shutdown().await;
        self.sessions.shutdown().await;
        self.pool.drain().await;
    }

    async fn check_rate(&self, key: &str) -> Result<()> {
        match self.limiter.check(key).await {
            RateDecision::Allowed => Ok(()),
            RateDecision::Denied { retry_after_ms } => {
                self.audit.record(
                    AuditEvent::new(EventType::RateLimited)
                        .detail("key", key.to_string())
                        .detail("retry_after_ms", retry_after_ms),
                );
                Err(SandboxError::RateLimited { retry_after_ms })
            }
        }
    }
}

/// Remove labeled containers left behind by a previous process. All state
/// is in-process, so anything found at boot is garbage.
async fn sweep_orphans(engine: &Engine) {
    match engine.list_managed().await {
        Ok(orphans) if !orphans.is_empty() => {
            info!("Removing {} orphaned container(s)", orphans.len());
            for orphan in orphans {
                if let Err(e) = engine.destroy_container(&orphan.id).await {
                    warn!(
                        "Failed to remove orphan {} ({:?}): {}",
                        orphan.id.get(..12).unwrap_or(&orphan.id),
                        orphan.role,
                        e
                    );
                }
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Orphan sweep failed: {}", e),
    }
}

fn require<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(SandboxError::Validation(format!("{field} is required"))),
    }
}

/// Short content hash correlating EXECUTE_START and EXECUTE_END events.
fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_code_is_stable_and_short() {
        let a = hash_code("print(2+2)");
        let b = hash_code("print(2+2)");
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
        assert_ne!(a, hash_code("print(3+3)"));
    }

    #[test]
    fn test_require_rejects_missing_and_empty() {
        assert!(require(None, "name").is_err());
        assert!(require(Some(""), "name").is_err());
        assert_eq!(require(Some("dev"), "name").unwrap(), "dev");
    }
}
