//! Post-release container scrub.
//!
//! One shell script wipes everything a previous tenant could have left
//! behind: workspace contents including dotfiles, temp directories, shell
//! and REPL history, package-manager caches, Python byte-code caches, SysV
//! IPC segments, and exported environment. A failed scrub retires the
//! container; a scrub that leaves residue is audited but not fatal.

use std::time::Duration;

use tracing::debug;

use crate::engine::{Engine, ExecSpec, Result};

const CLEAN_TIMEOUT: Duration = Duration::from_secs(30);

/// The scrub script. Each step tolerates absence of its target; the exit
/// code reflects only catastrophic failure (shell unavailable, workspace
/// unrecreatable).
const CLEANER_SCRIPT: &str = r#"
find /workspace -mindepth 1 -delete 2>/dev/null || true
rm -rf /tmp/* /tmp/.[!.]* /tmp/..?* 2>/dev/null || true
rm -rf /var/tmp/* /var/tmp/.[!.]* 2>/dev/null || true
rm -f "$HOME/.bash_history" "$HOME/.ash_history" "$HOME/.sh_history" "$HOME/.python_history" "$HOME/.node_repl_history" 2>/dev/null || true
rm -rf "$HOME/.ipython" 2>/dev/null || true
rm -rf "$HOME/.cache/pip" "$HOME/.npm/_cacache" "$HOME/.cargo/registry" "$HOME/go/pkg/mod/cache" 2>/dev/null || true
find "$HOME" /workspace -maxdepth 6 \( -name __pycache__ -type d -o -name '*.pyc' \) -exec rm -rf {} + 2>/dev/null || true
if command -v ipcs >/dev/null 2>&1; then
  for id in $(ipcs -m 2>/dev/null | awk '$3 == 1000 {print $2}'); do ipcrm -m "$id" 2>/dev/null || true; done
  for id in $(ipcs -s 2>/dev/null | awk '$3 == 1000 {print $2}'); do ipcrm -s "$id" 2>/dev/null || true; done
  for id in $(ipcs -q 2>/dev/null | awk '$3 == 1000 {print $2}'); do ipcrm -q "$id" 2>/dev/null || true; done
fi
for var in $(env | cut -d= -f1); do
  case "$var" in PATH|HOME|TERM|LANG|PWD|SHLVL) ;; *) unset "$var" 2>/dev/null || true ;; esac
done
mkdir -p /workspace && chmod 0755 /workspace
"#;

/// Run the scrub inside a container.
///
/// Returns the number of entries left in the workspace afterwards; zero is
/// a complete clean.
///
/// # Errors
///
/// Returns error if the scrub itself cannot run or exits non-zero. Callers
/// must retire the container in that case.
pub async fn clean_container(engine: &Engine, container_id: &str) -> Result<usize> {
    debug!(
        "Cleaning container {}",
        container_id.get(..12).unwrap_or(container_id)
    );

    let scrub = ExecSpec::builder(["sh", "-c", CLEANER_SCRIPT])
        .timeout(CLEAN_TIMEOUT)
        .build();
    let output = engine.exec(container_id, &scrub).await?;

    if !output.success() {
        return Err(crate::engine::EngineError::Exec(format!(
            "cleaner exited {}: {}",
            output.exit_code,
            output.stderr.trim()
        )));
    }

    // Verification pass: anything surviving the scrub is residue
    let verify = ExecSpec::builder(["sh", "-c", "ls -A /workspace | wc -l"])
        .timeout(Duration::from_secs(5))
        .build();
    let output = engine.exec(container_id, &verify).await?;
    let leftover = output.stdout.trim().parse::<usize>().unwrap_or(0);

    Ok(leftover)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_covers_required_surfaces() {
        for needle in [
            "find /workspace -mindepth 1 -delete",
            "/var/tmp",
            ".bash_history",
            ".python_history",
            ".ipython",
            ".cache/pip",
            ".npm",
            ".cargo/registry",
            "go/pkg/mod",
            "__pycache__",
            "*.pyc",
            "ipcrm -m",
            "ipcrm -s",
            "ipcrm -q",
            "unset",
            "chmod 0755 /workspace",
        ] {
            assert!(CLEANER_SCRIPT.contains(needle), "script must contain {needle:?}");
        }
    }

    #[tokio::test]
    #[ignore] // Requires Docker/Podman
    async fn test_clean_leaves_empty_workspace() {
        use crate::security::{HardeningProfile, SecurityLevel};

        let engine = Engine::connect().await.unwrap();
        let spec = crate::engine::ContainerSpec::new(
            "alpine:latest",
            HardeningProfile::for_level(SecurityLevel::Permissive),
        );
        let id = engine.create_container(&spec, None).await.unwrap();
        engine.start_container(&id).await.unwrap();

        engine
            .put_file(&id, "/workspace/leftover.txt", b"junk")
            .await
            .unwrap();
        engine
            .put_file(&id, "/workspace/.hidden", b"dotfile")
            .await
            .unwrap();

        let leftover = clean_container(&engine, &id).await.unwrap();
        assert_eq!(leftover, 0);

        engine.destroy_container(&id).await.unwrap();
    }
}
