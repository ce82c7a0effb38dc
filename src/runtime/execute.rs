//! Code-to-command translation and execution.
//!
//! Interpreted languages run straight from an inline `-c`/`-e` argument;
//! Go, Rust, and TypeScript go through a temp file under `/workspace`
//! (never `/tmp`, which may be mounted noexec). Fragments without an entry
//! point are wrapped into one. The security gate screens every source
//! before a container command is issued.

use std::time::Duration;

use rand::Rng;
use rand::distributions::Alphanumeric;
use tracing::debug;

use crate::engine::{Engine, ExecOutput, ExecSpec};
use crate::error::Result;
use crate::runtime::ml::ExecMetrics;
use crate::runtime::{EnvMap, Language, RuntimeAdapter};
use crate::security::{WORKSPACE_ROOT, validate_code};

/// Prefix surfaced in stderr when a compiled language fails to build.
pub(crate) const COMPILE_FAILURE_PREFIX: &str = "compilation failed:";

/// Execution context handed to an adapter.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub timeout: Duration,
    pub env: EnvMap,
    pub stdin: Option<String>,
    pub cwd: Option<String>,
}

impl ExecContext {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            env: EnvMap::new(),
            stdin: None,
            cwd: None,
        }
    }
}

/// Result of a sandboxed execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub duration: Duration,
    /// Telemetry parsed from stderr; populated by the ML runtime only
    pub metrics: Option<ExecMetrics>,
}

impl From<ExecOutput> for ExecutionOutcome {
    fn from(output: ExecOutput) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            duration: output.duration,
            metrics: None,
        }
    }
}

impl RuntimeAdapter {
    /// Execute source code in the given container.
    ///
    /// # Errors
    ///
    /// Returns a security error before any engine call when the source
    /// matches the language blocklist; engine and timeout errors otherwise.
    pub async fn execute(
        &self,
        engine: &Engine,
        container_id: &str,
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        validate_code(self.language(), source)?;

        debug!(
            "Executing {} snippet ({} bytes) in {}",
            self.language(),
            source.len(),
            container_id.get(..12).unwrap_or(container_id)
        );

        let outcome = match self.language() {
            Language::Python => {
                self.run_inline(engine, container_id, &["python", "-c"], source, ctx)
                    .await?
            }
            Language::JavaScript => {
                self.run_inline(engine, container_id, &["node", "-e"], source, ctx)
                    .await?
            }
            Language::Bash => {
                self.run_inline(engine, container_id, &["sh", "-c"], source, ctx)
                    .await?
            }
            Language::TypeScript => {
                self.run_typescript(engine, container_id, source, ctx).await?
            }
            Language::Go => self.run_go(engine, container_id, source, ctx).await?,
            Language::Rust => self.run_rust(engine, container_id, source, ctx).await?,
        };

        Ok(outcome)
    }

    async fn run_inline(
        &self,
        engine: &Engine,
        container_id: &str,
        prefix: &[&str],
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        let mut cmd: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        cmd.push(source.to_string());

        let output = engine
            .exec(container_id, &exec_spec(cmd, ctx))
            .await?;
        Ok(output.into())
    }

    async fn run_typescript(
        &self,
        engine: &Engine,
        container_id: &str,
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        let path = temp_path("ts");
        engine.put_file(container_id, &path, source.as_bytes()).await?;

        let result = engine
            .exec(
                container_id,
                &exec_spec(vec!["tsx".to_string(), path.clone()], ctx),
            )
            .await;

        remove_best_effort(engine, container_id, &[&path]).await;
        Ok(result?.into())
    }

    async fn run_go(
        &self,
        engine: &Engine,
        container_id: &str,
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        let wrapped = wrap_go(source);
        let path = temp_path("go");
        engine
            .put_file(container_id, &path, wrapped.as_bytes())
            .await?;

        let result = engine
            .exec(
                container_id,
                &exec_spec(
                    vec!["go".to_string(), "run".to_string(), path.clone()],
                    ctx,
                ),
            )
            .await;

        remove_best_effort(engine, container_id, &[&path]).await;
        Ok(result?.into())
    }

    async fn run_rust(
        &self,
        engine: &Engine,
        container_id: &str,
        source: &str,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome> {
        let wrapped = wrap_rust(source);
        let src_path = temp_path("rs");
        let bin_path = format!("{src_path}.bin");
        engine
            .put_file(container_id, &src_path, wrapped.as_bytes())
            .await?;

        // Compile first; a failed build is reported as the execution result
        // with a distinct stderr prefix, not as an engine error.
        let compile = engine
            .exec(
                container_id,
                &exec_spec(
                    vec![
                        "rustc".to_string(),
                        "-O".to_string(),
                        src_path.clone(),
                        "-o".to_string(),
                        bin_path.clone(),
                    ],
                    ctx,
                ),
            )
            .await;

        let compile = match compile {
            Ok(output) => output,
            Err(e) => {
                remove_best_effort(engine, container_id, &[&src_path, &bin_path]).await;
                return Err(e.into());
            }
        };

        if !compile.success() {
            remove_best_effort(engine, container_id, &[&src_path, &bin_path]).await;
            return Ok(ExecutionOutcome {
                stdout: compile.stdout,
                stderr: format!("{COMPILE_FAILURE_PREFIX}\n{}", compile.stderr),
                exit_code: compile.exit_code,
                duration: compile.duration,
                metrics: None,
            });
        }

        let run = engine
            .exec(container_id, &exec_spec(vec![bin_path.clone()], ctx))
            .await;

        remove_best_effort(engine, container_id, &[&src_path, &bin_path]).await;
        Ok(run?.into())
    }
}

fn exec_spec(cmd: Vec<String>, ctx: &ExecContext) -> ExecSpec {
    let mut builder = ExecSpec::builder(cmd)
        .working_dir(ctx.cwd.clone().unwrap_or_else(|| WORKSPACE_ROOT.to_string()))
        .timeout(ctx.timeout)
        .envs(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if let Some(ref stdin) = ctx.stdin {
        builder = builder.stdin(stdin.clone());
    }
    builder.build()
}

/// Temp-file path under the workspace: timestamp plus random suffix keeps
/// concurrent executions in one container from colliding.
fn temp_path(extension: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect();
    format!(
        "{WORKSPACE_ROOT}/.exec-{}-{}.{}",
        chrono::Utc::now().timestamp_millis(),
        suffix,
        extension
    )
}

/// Best-effort temp-file removal; failures never propagate.
async fn remove_best_effort(engine: &Engine, container_id: &str, paths: &[&str]) {
    let mut cmd = vec!["rm".to_string(), "-f".to_string()];
    cmd.extend(paths.iter().map(|p| p.to_string()));
    let spec = ExecSpec::builder(cmd)
        .timeout(Duration::from_secs(5))
        .build();
    if let Err(e) = engine.exec(container_id, &spec).await {
        debug!("Temp file cleanup failed (ignored): {}", e);
    }
}

/// Wrap a Go fragment into a runnable program when it lacks `func main()`.
/// An `fmt` import is injected when the fragment references the package.
pub(crate) fn wrap_go(source: &str) -> String {
    if source.contains("func main(") {
        return source.to_string();
    }

    let imports = if source.contains("fmt.") {
        "\nimport \"fmt\"\n"
    } else {
        ""
    };

    let indented: String = source
        .lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("\t{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("package main\n{imports}\nfunc main() {{\n{indented}\n}}\n")
}

/// Wrap a Rust fragment into a runnable program when it lacks `fn main()`.
pub(crate) fn wrap_rust(source: &str) -> String {
    if source.contains("fn main(") {
        return source.to_string();
    }

    let indented: String = source
        .lines()
        .map(|line| {
            if line.is_empty() {
                line.to_string()
            } else {
                format!("    {line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("fn main() {{\n{indented}\n}}\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_go_wrap_injects_main_and_fmt() {
        let wrapped = wrap_go("fmt.Println(\"hi\")");
        assert!(wrapped.starts_with("package main"));
        assert!(wrapped.contains("import \"fmt\""));
        assert!(wrapped.contains("func main() {"));
        assert!(wrapped.contains("\tfmt.Println(\"hi\")"));
    }

    #[test]
    fn test_go_wrap_skips_fmt_when_unused() {
        let wrapped = wrap_go("x := 1\n_ = x");
        assert!(!wrapped.contains("import \"fmt\""));
        assert!(wrapped.contains("func main() {"));
    }

    #[test]
    fn test_go_complete_program_untouched() {
        let program = "package main\n\nfunc main() {\n\tprintln(1)\n}\n";
        assert_eq!(wrap_go(program), program);
    }

    #[test]
    fn test_rust_wrap() {
        let wrapped = wrap_rust("println!(\"hi\");");
        assert!(wrapped.starts_with("fn main() {"));
        assert!(wrapped.contains("    println!(\"hi\");"));
    }

    #[test]
    fn test_rust_complete_program_untouched() {
        let program = "fn main() { println!(\"hi\"); }";
        assert_eq!(wrap_rust(program), program);
    }

    #[test]
    fn test_temp_path_shape() {
        let a = temp_path("rs");
        let b = temp_path("rs");
        assert!(a.starts_with("/workspace/.exec-"));
        assert!(a.ends_with(".rs"));
        assert_ne!(a, b, "random suffix must differ");
    }

    #[test]
    fn test_go_wrap_preserves_blank_lines() {
        let wrapped = wrap_go("x := 1\n\ny := 2\n_ = x + y");
        assert!(wrapped.contains("\tx := 1\n\n\ty := 2"));
    }

    #[test]
    fn test_compile_failure_prefix_is_stable() {
        assert_eq!(COMPILE_FAILURE_PREFIX, "compilation failed:");
    }
}
