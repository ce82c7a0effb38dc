//! Image management: pull on demand, commit, list, remove.

use futures::stream::StreamExt;
use tracing::{debug, info};

use crate::engine::{Engine, EngineError, Result};

/// Image summary.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub size: i64,
    pub created: i64,
}

impl Engine {
    /// Check if an image exists locally.
    ///
    /// # Errors
    ///
    /// Returns error if inspection fails for a reason other than 404.
    pub async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker().inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(EngineError::Api(e)),
        }
    }

    /// Pull an image if not present locally.
    ///
    /// # Errors
    ///
    /// Returns error if the pull fails.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            debug!("Image {} already present", image);
            return Ok(());
        }

        info!("Pulling image: {}", image);

        let mut stream = self.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(result) = stream.next().await {
            let progress = result?;
            if let Some(error) = progress.error {
                return Err(EngineError::Other(format!("pull failed: {error}")));
            }
            if let Some(status) = progress.status {
                debug!("Pull: {}", status);
            }
        }

        info!("Pulled image: {}", image);
        Ok(())
    }

    /// Commit a container's current filesystem to an image under `tag`
    /// (format `repo:tag`).
    ///
    /// # Errors
    ///
    /// Returns error if the tag is malformed or the commit fails.
    pub async fn commit_image(&self, container_id: &str, tag: &str) -> Result<String> {
        let (repo, version) = tag
            .rsplit_once(':')
            .ok_or_else(|| EngineError::Other(format!("image tag without version: {tag}")))?;

        info!("Committing container {} as {}", container_id, tag);

        let commit = self
            .docker()
            .commit_container(
                bollard::image::CommitContainerOptions {
                    container: container_id.to_string(),
                    repo: repo.to_string(),
                    tag: version.to_string(),
                    pause: true,
                    ..Default::default()
                },
                bollard::container::Config::<String>::default(),
            )
            .await?;

        Ok(commit.id.unwrap_or_default())
    }

    /// List all local images.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        let images = self
            .docker()
            .list_images(Some(bollard::image::ListImagesOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
            })
            .collect())
    }

    /// Remove an image by id or tag. Removing a missing image succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on daemon failure other than 404.
    pub async fn remove_image(&self, image: &str, force: bool) -> Result<()> {
        debug!("Removing image: {}", image);

        match self
            .docker()
            .remove_image(
                image,
                Some(bollard::image::RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(EngineError::Api(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_ensure_and_list() {
        let engine = Engine::connect().await.unwrap();
        engine.ensure_image("alpine:latest").await.unwrap();

        let images = engine.list_images().await.unwrap();
        assert!(
            images
                .iter()
                .any(|img| img.repo_tags.iter().any(|t| t.starts_with("alpine")))
        );
    }

    #[tokio::test]
    #[ignore]
    async fn test_commit_round_trip() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            crate::security::HardeningProfile::for_level(crate::security::SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        engine
            .commit_image(&id, "execbox-test-commit:latest")
            .await
            .unwrap();
        assert!(engine.image_exists("execbox-test-commit:latest").await.unwrap());

        engine.destroy_container(&id).await.unwrap();
        engine
            .remove_image("execbox-test-commit:latest", true)
            .await
            .unwrap();
    }
}
