//! Container lifecycle operations.
//!
//! Create, start, stop, pause, unpause, and remove. Start/stop/pause
//! collapse "already in that state" daemon responses to success so callers
//! can retry and race freely; remove tolerates "already gone".

use std::collections::HashMap;

use bollard::errors::Error as BollardError;
use tracing::{debug, info, warn};

use crate::engine::{ContainerSpec, Engine, EngineError, MANAGED_LABEL, Result, ROLE_LABEL};

/// Seconds the daemon waits before SIGKILL on stop.
const STOP_TIMEOUT_SECS: i64 = 5;

/// Summary of a container carrying the managed label.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub id: String,
    pub names: Vec<String>,
    pub role: Option<String>,
    pub state: String,
}

impl Engine {
    /// Create a container from a spec, ensuring the image exists first.
    ///
    /// Returns the container id.
    ///
    /// # Errors
    ///
    /// Returns error if the image cannot be pulled or creation fails.
    pub async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: Option<&str>,
    ) -> Result<String> {
        self.ensure_image(spec.image()).await?;

        let container_name = name
            .map(String::from)
            .unwrap_or_else(|| format!("execbox-{}", uuid::Uuid::new_v4()));

        debug!("Creating container: {}", container_name);

        let options = bollard::container::CreateContainerOptions {
            name: container_name.clone(),
            ..Default::default()
        };

        let response = self
            .docker()
            .create_container(Some(options), spec.to_bollard())
            .await?;

        info!("Created container: {} ({})", container_name, short(&response.id));
        Ok(response.id)
    }

    /// Start a container. Starting a running container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than "already started".
    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        debug!("Starting container: {}", short(container_id));

        match self
            .docker()
            .start_container(
                container_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_in_state(&e) => {
                debug!("Container {} already started", short(container_id));
                Ok(())
            }
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Stop a container. Stopping a stopped container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than "not running".
    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        debug!("Stopping container: {}", short(container_id));

        match self
            .docker()
            .stop_container(
                container_id,
                Some(bollard::container::StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if already_in_state(&e) || is_gone(&e) => {
                debug!("Container {} already stopped", short(container_id));
                Ok(())
            }
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Pause a container. Pausing a paused container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than "already paused".
    pub async fn pause_container(&self, container_id: &str) -> Result<()> {
        match self.docker().pause_container(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if already_in_state(&e) => Ok(()),
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Unpause a container. Unpausing a running container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than "not paused".
    pub async fn unpause_container(&self, container_id: &str) -> Result<()> {
        match self.docker().unpause_container(container_id).await {
            Ok(()) => Ok(()),
            Err(e) if already_in_state(&e) => Ok(()),
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Remove a container. Removing a missing container succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than "no such container".
    pub async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        debug!("Removing container: {}", short(container_id));

        match self
            .docker()
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_gone(&e) => {
                debug!("Container {} already removed", short(container_id));
                Ok(())
            }
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Stop then force-remove; stop failures are logged, not propagated.
    ///
    /// # Errors
    ///
    /// Returns error if removal fails.
    pub async fn destroy_container(&self, container_id: &str) -> Result<()> {
        if let Err(e) = self.stop_container(container_id).await {
            warn!("Failed to stop container {}: {}", short(container_id), e);
        }
        self.remove_container(container_id, true).await
    }

    /// Whether the kernel OOM-killed the container's init process.
    ///
    /// # Errors
    ///
    /// Returns error if inspection fails.
    pub async fn was_oom_killed(&self, container_id: &str) -> Result<bool> {
        let inspect = self
            .docker()
            .inspect_container(
                container_id,
                None::<bollard::container::InspectContainerOptions>,
            )
            .await?;

        Ok(inspect
            .state
            .and_then(|s| s.oom_killed)
            .unwrap_or(false))
    }

    /// List containers carrying the managed label, running or not.
    ///
    /// Used by the startup orphan sweep; state is in-process only, so any
    /// labeled container found at boot is a leftover.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    pub async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );

        let containers = self
            .docker()
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| {
                let role = c
                    .labels
                    .as_ref()
                    .and_then(|labels| labels.get(ROLE_LABEL).cloned());
                ManagedContainer {
                    id: c.id.unwrap_or_default(),
                    names: c.names.unwrap_or_default(),
                    role,
                    state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                }
            })
            .collect())
    }
}

/// 304 and the "already started/paused/not running" 409s all mean the
/// container is already where we wanted it.
fn already_in_state(err: &BollardError) -> bool {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 304, ..
        } => true,
        BollardError::DockerResponseServerError {
            status_code: 409,
            message,
        } => {
            let msg = message.to_lowercase();
            msg.contains("already") || msg.contains("not running") || msg.contains("not paused")
        }
        _ => false,
    }
}

fn is_gone(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{HardeningProfile, SecurityLevel};

    #[test]
    fn test_already_in_state_matching() {
        let not_modified = BollardError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        assert!(already_in_state(&not_modified));

        let already_paused = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "container abc is already paused".to_string(),
        };
        assert!(already_in_state(&already_paused));

        let conflict = BollardError::DockerResponseServerError {
            status_code: 409,
            message: "name is in use".to_string(),
        };
        assert!(!already_in_state(&conflict));
    }

    #[test]
    fn test_gone_matching() {
        let missing = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        assert!(is_gone(&missing));
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_lifecycle_round_trip() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            HardeningProfile::for_level(SecurityLevel::Permissive),
        );

        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();
        // Idempotent start
        engine.start_container(&id).await.unwrap();

        engine.pause_container(&id).await.unwrap();
        engine.pause_container(&id).await.unwrap();
        engine.unpause_container(&id).await.unwrap();
        engine.unpause_container(&id).await.unwrap();

        engine.stop_container(&id).await.unwrap();
        engine.stop_container(&id).await.unwrap();
        engine.remove_container(&id, true).await.unwrap();
        engine.remove_container(&id, true).await.unwrap();
    }
}
