//! Command execution inside running containers.
//!
//! Output arrives from the daemon as multiplexed frames; we demux stdout
//! from stderr, cap each stream independently, and enforce the caller's
//! deadline by dropping the exec stream when it elapses.

use std::time::{Duration, Instant};

use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::stream::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine::{Engine, EngineError, Result};

/// Marker appended when a stream hit its byte cap.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Execution request.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    cmd: Vec<String>,
    env: Vec<String>,
    working_dir: Option<String>,
    stdin: Option<String>,
    timeout: Duration,
}

impl ExecSpec {
    /// Start building an exec request for the given argv.
    pub fn builder<I, S>(cmd: I) -> ExecSpecBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecSpecBuilder {
            spec: ExecSpec {
                cmd: cmd.into_iter().map(Into::into).collect(),
                env: Vec::new(),
                working_dir: None,
                stdin: None,
                timeout: Duration::from_secs(30),
            },
        }
    }

    /// The argv this request will run.
    pub fn cmd(&self) -> &[String] {
        &self.cmd
    }
}

/// Builder for [`ExecSpec`].
pub struct ExecSpecBuilder {
    spec: ExecSpec,
}

impl ExecSpecBuilder {
    /// Add an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add multiple environment variables.
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in envs {
            self.spec.env.push(format!("{}={}", k.into(), v.into()));
        }
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.spec.working_dir = Some(dir.into());
        self
    }

    /// Provide stdin content, written then closed before output is read.
    pub fn stdin(mut self, content: impl Into<String>) -> Self {
        self.spec.stdin = Some(content.into());
        self
    }

    /// Set the execution deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.spec.timeout = timeout;
        self
    }

    pub fn build(self) -> ExecSpec {
        self.spec
    }
}

/// Captured output of an exec.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; -1 when the daemon reported none
    pub exit_code: i64,
    pub duration: Duration,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Accumulates one output stream up to a byte cap; bytes past the cap are
/// drained and discarded so the exit code can still be collected.
struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > remaining {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        } else {
            self.buf.extend_from_slice(chunk);
        }
    }

    fn into_string(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

impl Engine {
    /// Execute a command in a running container.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::ExecTimeout` when the deadline elapses before
    /// the command completes, or an API error on daemon failure.
    pub async fn exec(&self, container_id: &str, spec: &ExecSpec) -> Result<ExecOutput> {
        debug!(
            "Executing in container {}: {:?}",
            container_id.get(..12).unwrap_or(container_id),
            spec.cmd
        );

        let started = Instant::now();

        let exec_options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            working_dir: spec.working_dir.clone(),
            attach_stdin: Some(spec.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self.docker().create_exec(container_id, exec_options).await?;
        let start_results = self.docker().start_exec(&exec.id, None).await?;

        let mut stdout = CappedBuffer::new(self.limits.stdout_bytes);
        let mut stderr = CappedBuffer::new(self.limits.stderr_bytes);

        match start_results {
            StartExecResults::Attached {
                mut output,
                mut input,
            } => {
                if let Some(ref content) = spec.stdin {
                    // Best-effort: the process may exit before reading
                    let _ = input.write_all(content.as_bytes()).await;
                    let _ = input.shutdown().await;
                }

                let drain = async {
                    while let Some(result) = output.next().await {
                        match result {
                            Ok(bollard::container::LogOutput::StdOut { message }) => {
                                stdout.push(&message);
                            }
                            Ok(bollard::container::LogOutput::StdErr { message }) => {
                                stderr.push(&message);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                return Err(EngineError::Exec(format!(
                                    "failed to read exec output: {e}"
                                )));
                            }
                        }
                    }
                    Ok(())
                };

                // Dropping the stream on timeout closes the exec connection.
                match tokio::time::timeout(spec.timeout, drain).await {
                    Ok(result) => result?,
                    Err(_) => return Err(EngineError::ExecTimeout(spec.timeout)),
                }
            }
            StartExecResults::Detached => {
                return Err(EngineError::Exec("unexpected detached execution".to_string()));
            }
        }

        let inspect = self.docker().inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        let duration = started.elapsed();
        debug!("Exec finished with code {} in {:?}", exit_code, duration);

        let (stdout, stdout_truncated) = stdout.into_string();
        let (stderr, stderr_truncated) = stderr.into_string();

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
            duration,
            stdout_truncated,
            stderr_truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_spec_builder() {
        let spec = ExecSpec::builder(["echo", "hello"])
            .env("FOO", "bar")
            .working_dir("/workspace")
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(spec.cmd(), &["echo", "hello"]);
        assert_eq!(spec.env, vec!["FOO=bar"]);
        assert_eq!(spec.working_dir.as_deref(), Some("/workspace"));
        assert_eq!(spec.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_capped_buffer_truncates_at_cap() {
        let mut buf = CappedBuffer::new(8);
        buf.push(b"hello ");
        buf.push(b"world!");
        let (text, truncated) = buf.into_string();

        assert!(truncated);
        assert_eq!(text, format!("hello wo{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_capped_buffer_no_marker_under_cap() {
        let mut buf = CappedBuffer::new(64);
        buf.push(b"short");
        let (text, truncated) = buf.into_string();

        assert!(!truncated);
        assert_eq!(text, "short");
    }

    #[test]
    fn test_capped_buffer_discards_after_cap() {
        let mut buf = CappedBuffer::new(4);
        buf.push(b"abcdef");
        buf.push(b"ghij");
        let (text, _) = buf.into_string();
        assert_eq!(text, format!("abcd{}", TRUNCATION_MARKER));
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_exec_echo() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            crate::security::HardeningProfile::for_level(crate::security::SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let output = engine
            .exec(&id, &ExecSpec::builder(["echo", "hello"]).build())
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.contains("hello"));

        engine.destroy_container(&id).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_exec_timeout_reported() {
        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            crate::security::HardeningProfile::for_level(crate::security::SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let result = engine
            .exec(
                &id,
                &ExecSpec::builder(["sleep", "60"])
                    .timeout(Duration::from_millis(300))
                    .build(),
            )
            .await;
        assert!(matches!(result, Err(EngineError::ExecTimeout(_))));

        engine.destroy_container(&id).await.unwrap();
    }
}
