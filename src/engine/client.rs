//! Daemon connection handling.
//!
//! Wraps the bollard client with automatic connection fallback (Docker
//! first, then rootless and system Podman sockets) and a health ping.

use std::sync::Arc;

use bollard::Docker;
use tracing::{debug, info};

use crate::engine::{EngineError, Result};

/// Output caps applied to every exec through this engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputLimits {
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
}

/// Handle to the local container engine.
///
/// Cheap to clone; all clones share one daemon connection. Safe for
/// concurrent calls.
#[derive(Clone)]
pub struct Engine {
    docker: Arc<Docker>,
    pub(crate) limits: OutputLimits,
}

impl Engine {
    /// Connect to the local engine with default output caps.
    ///
    /// # Errors
    ///
    /// Returns error if neither Docker nor Podman is reachable.
    pub async fn connect() -> Result<Self> {
        Self::connect_with_limits(10 * 1024 * 1024, 5 * 1024 * 1024).await
    }

    /// Connect with explicit stdout/stderr caps in bytes.
    ///
    /// # Errors
    ///
    /// Returns error if neither Docker nor Podman is reachable.
    pub async fn connect_with_limits(stdout_bytes: usize, stderr_bytes: usize) -> Result<Self> {
        let docker = Self::try_connect().await?;

        let engine = Self {
            docker: Arc::new(docker),
            limits: OutputLimits {
                stdout_bytes,
                stderr_bytes,
            },
        };

        // Verify the connection actually works
        engine.ping().await?;

        Ok(engine)
    }

    /// Try connection strategies in order: local defaults, rootless Podman
    /// socket, system Podman socket.
    async fn try_connect() -> Result<Docker> {
        debug!("Connecting to container engine...");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container engine via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            if let Ok(home) = std::env::var("HOME") {
                let rootless = format!("unix://{}/run/podman/podman.sock", home);
                debug!("Trying Podman socket: {}", rootless);

                match Docker::connect_with_socket(&rootless, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("Connected to Podman via rootless socket");
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman rootless socket failed: {}", e);
                    }
                }
            }

            let system = "unix:///run/podman/podman.sock";
            debug!("Trying system Podman socket: {}", system);

            match Docker::connect_with_socket(system, 120, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => {
                    info!("Connected to Podman via system socket");
                    return Ok(docker);
                }
                Err(e) => {
                    debug!("Podman system socket failed: {}", e);
                }
            }
        }

        Err(EngineError::Other(
            "No container engine reachable. Ensure Docker or Podman is installed and running."
                .to_string(),
        ))
    }

    /// Ping the engine.
    ///
    /// # Errors
    ///
    /// Returns error if the daemon does not answer.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Other(format!("engine ping failed: {e}")))?;
        debug!("Engine ping successful");
        Ok(())
    }

    /// Engine version string, for the startup banner.
    ///
    /// # Errors
    ///
    /// Returns error if the version query fails.
    pub async fn version_string(&self) -> Result<String> {
        let version = self.docker.version().await?;
        Ok(version.version.unwrap_or_else(|| "unknown".to_string()))
    }

    /// Detect whether the daemon is Docker or Podman.
    ///
    /// # Errors
    ///
    /// Returns error if the version query fails.
    pub async fn runtime_type(&self) -> Result<RuntimeType> {
        let version = self.docker.version().await?;

        let is_podman = version
            .components
            .and_then(|comps| {
                comps
                    .iter()
                    .find(|c| c.name == "Engine")
                    .map(|c| c.version.clone())
            })
            .filter(|name| name.to_lowercase().contains("podman"))
            .is_some();

        Ok(if is_podman {
            RuntimeType::Podman
        } else {
            RuntimeType::Docker
        })
    }

    /// Direct access to the bollard client for the few call sites that
    /// need endpoints the adapter does not wrap.
    pub(crate) fn docker(&self) -> &Docker {
        &self.docker
    }
}

/// Type of container engine behind the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeType {
    Docker,
    Podman,
}

impl std::fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeType::Docker => write!(f, "Docker"),
            RuntimeType::Podman => write!(f, "Podman"),
        }
    }
}
