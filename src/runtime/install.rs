//! Per-language package installation.
//!
//! Each language uses its canonical tool. The package validator runs
//! first; a non-zero exit from the package manager becomes a failed
//! `InstallResult`, not an error.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{Engine, ExecSpec};
use crate::error::Result;
use crate::runtime::{Language, RuntimeAdapter};
use crate::security::{WORKSPACE_ROOT, validate_packages};

/// Generous ceiling: package managers resolve and download.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Structured result of a package install.
#[derive(Debug, Clone, Serialize)]
pub struct InstallResult {
    pub success: bool,
    /// Whether the result came from the image cache rather than a live
    /// install; always false at this layer, set by the cache above
    pub cached: bool,
    pub duration_ms: u64,
    pub installed: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RuntimeAdapter {
    /// Install packages into a running container using the language's
    /// native tool.
    ///
    /// # Errors
    ///
    /// Returns a security error when a spec fails validation; engine
    /// failures propagate. Package-manager failures are reported in the
    /// returned result.
    pub async fn install_packages(
        &self,
        engine: &Engine,
        container_id: &str,
        packages: &[String],
    ) -> Result<InstallResult> {
        let names = validate_packages(self.language(), packages)?;
        let started = Instant::now();

        info!(
            "Installing {} {} package(s) into {}",
            names.len(),
            self.language(),
            container_id.get(..12).unwrap_or(container_id)
        );

        let mut errors = Vec::new();

        match self.language() {
            Language::Python => {
                let manifest = format!(
                    "{WORKSPACE_ROOT}/.requirements-{}.txt",
                    chrono::Utc::now().timestamp_millis()
                );
                engine
                    .put_file(container_id, &manifest, names.join("\n").as_bytes())
                    .await?;

                let output = self
                    .run_tool(
                        engine,
                        container_id,
                        vec![
                            "pip".into(),
                            "install".into(),
                            "--no-cache-dir".into(),
                            "-r".into(),
                            manifest.clone(),
                        ],
                    )
                    .await?;
                if !output.0 {
                    errors.push(output.1);
                }

                let cleanup = ExecSpec::builder(["rm", "-f", manifest.as_str()])
                    .timeout(Duration::from_secs(5))
                    .build();
                let _ = engine.exec(container_id, &cleanup).await;
            }
            Language::JavaScript | Language::TypeScript => {
                let mut cmd = vec!["npm".to_string(), "install".to_string(), "--no-save".to_string()];
                cmd.extend(names.iter().cloned());
                let output = self.run_tool(engine, container_id, cmd).await?;
                if !output.0 {
                    errors.push(output.1);
                }
            }
            Language::Go => {
                self.ensure_manifest(
                    engine,
                    container_id,
                    "test -f go.mod || go mod init sandbox",
                )
                .await?;
                for name in &names {
                    let output = self
                        .run_tool(
                            engine,
                            container_id,
                            vec!["go".into(), "get".into(), name.clone()],
                        )
                        .await?;
                    if !output.0 {
                        errors.push(output.1);
                    }
                }
            }
            Language::Rust => {
                self.ensure_manifest(
                    engine,
                    container_id,
                    "test -f Cargo.toml || cargo init --name sandbox .",
                )
                .await?;
                for name in &names {
                    let output = self
                        .run_tool(
                            engine,
                            container_id,
                            vec!["cargo".into(), "add".into(), name.clone()],
                        )
                        .await?;
                    if !output.0 {
                        errors.push(output.1);
                    }
                }
            }
            Language::Bash => {
                let update = self
                    .run_tool(
                        engine,
                        container_id,
                        vec!["apk".into(), "update".into()],
                    )
                    .await?;
                if !update.0 {
                    errors.push(update.1);
                } else {
                    let mut cmd = vec![
                        "apk".to_string(),
                        "add".to_string(),
                        "--no-cache".to_string(),
                    ];
                    cmd.extend(names.iter().cloned());
                    let output = self.run_tool(engine, container_id, cmd).await?;
                    if !output.0 {
                        errors.push(output.1);
                    }
                }
            }
        }

        let success = errors.is_empty();
        debug!(
            "Install {} after {:?}",
            if success { "succeeded" } else { "failed" },
            started.elapsed()
        );

        Ok(InstallResult {
            success,
            cached: false,
            duration_ms: started.elapsed().as_millis() as u64,
            installed: if success { names } else { Vec::new() },
            errors,
        })
    }

    /// Run one package-manager command; returns (success, stderr).
    async fn run_tool(
        &self,
        engine: &Engine,
        container_id: &str,
        cmd: Vec<String>,
    ) -> Result<(bool, String)> {
        let spec = ExecSpec::builder(cmd)
            .working_dir(WORKSPACE_ROOT)
            .timeout(INSTALL_TIMEOUT)
            .build();
        let output = engine.exec(container_id, &spec).await?;
        Ok((output.success(), output.stderr))
    }

    async fn ensure_manifest(
        &self,
        engine: &Engine,
        container_id: &str,
        script: &str,
    ) -> Result<()> {
        let spec = ExecSpec::builder(["sh", "-c", script])
            .working_dir(WORKSPACE_ROOT)
            .timeout(Duration::from_secs(30))
            .build();
        engine.exec(container_id, &spec).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityError;

    #[tokio::test]
    async fn test_validation_precedes_engine_calls() {
        // validate_packages runs before any container command; a blocked
        // spec must fail without an engine in reach.
        let err = validate_packages(Language::Python, &["os".to_string()]);
        assert!(matches!(err, Err(SecurityError::BlockedPackage(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman and network for pip
    async fn test_pip_install_round_trip() {
        use crate::security::{HardeningProfile, SecurityLevel};

        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            Language::Python.default_image(),
            HardeningProfile::for_level(SecurityLevel::Permissive),
        )
        .network_mode("bridge");
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let adapter = RuntimeAdapter::for_language(Language::Python);
        let result = adapter
            .install_packages(&engine, &id, &["six".to_string()])
            .await
            .unwrap();
        assert!(result.success);
        assert!(!result.cached);
        assert_eq!(result.installed, vec!["six"]);

        engine.destroy_container(&id).await.unwrap();
    }
}
