//! File transfer through tar streams.
//!
//! The daemon's archive endpoints speak tar; single files are wrapped in a
//! one-entry archive on upload and unwrapped on download. Paths handed to
//! these functions have already passed the workspace sanitizer.

use std::io::Read;

use futures::stream::StreamExt;
use tracing::debug;

use crate::engine::{Engine, EngineError, Result};

impl Engine {
    /// Write `bytes` to `path` inside the container.
    ///
    /// # Errors
    ///
    /// Returns error if the archive cannot be built or the upload fails.
    pub async fn put_file(&self, container_id: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let (dir, file_name) = split_container_path(path)?;

        debug!("Uploading {} bytes to {}:{}", bytes.len(), container_id, path);

        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_uid(1000);
        header.set_gid(1000);
        header.set_cksum();
        builder
            .append_data(&mut header, file_name, bytes)
            .map_err(|e| EngineError::FileTransfer(format!("tar encode: {e}")))?;
        let archive = builder
            .into_inner()
            .map_err(|e| EngineError::FileTransfer(format!("tar finish: {e}")))?;

        self.docker()
            .upload_to_container(
                container_id,
                Some(bollard::container::UploadToContainerOptions {
                    path: dir,
                    ..Default::default()
                }),
                archive.into(),
            )
            .await?;

        Ok(())
    }

    /// Read the file at `path` inside the container.
    ///
    /// # Errors
    ///
    /// Returns error if the path does not name a regular file or the
    /// download fails.
    pub async fn get_file(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        debug!("Downloading {}:{}", container_id, path);

        let mut stream = self.docker().download_from_container(
            container_id,
            Some(bollard::container::DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );

        let mut archive_bytes = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive_bytes.extend_from_slice(&chunk?);
        }

        let mut archive = tar::Archive::new(archive_bytes.as_slice());
        let entries = archive
            .entries()
            .map_err(|e| EngineError::FileTransfer(format!("tar decode: {e}")))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| EngineError::FileTransfer(format!("tar entry: {e}")))?;
            if entry.header().entry_type().is_file() {
                let mut contents = Vec::new();
                entry
                    .read_to_end(&mut contents)
                    .map_err(|e| EngineError::FileTransfer(format!("tar read: {e}")))?;
                return Ok(contents);
            }
        }

        Err(EngineError::FileTransfer(format!(
            "no regular file at {path}"
        )))
    }
}

/// Split an absolute container path into (parent dir, file name) for the
/// upload endpoint, which extracts the archive relative to a directory.
fn split_container_path(path: &str) -> Result<(String, String)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) if !name.is_empty() => Ok(("/".to_string(), name.to_string())),
        Some((dir, name)) if !name.is_empty() => Ok((dir.to_string(), name.to_string())),
        _ => Err(EngineError::FileTransfer(format!(
            "not a file path: {path}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_container_path() {
        assert_eq!(
            split_container_path("/workspace/data/out.txt").unwrap(),
            ("/workspace/data".to_string(), "out.txt".to_string())
        );
        assert_eq!(
            split_container_path("/top.txt").unwrap(),
            ("/".to_string(), "top.txt".to_string())
        );
        assert!(split_container_path("/").is_err());
        assert!(split_container_path("relative.txt").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_put_get_round_trip() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            crate::security::HardeningProfile::for_level(crate::security::SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let payload = b"round trip payload";
        engine
            .put_file(&id, "/workspace/fixture.txt", payload)
            .await
            .unwrap();
        let read_back = engine.get_file(&id, "/workspace/fixture.txt").await.unwrap();
        assert_eq!(read_back, payload);

        engine.destroy_container(&id).await.unwrap();
    }
}
