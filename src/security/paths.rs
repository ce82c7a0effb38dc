//! Workspace path sanitizer and volume-bind validation.
//!
//! Caller-supplied container paths are percent-decoded (up to three rounds,
//! defeating double/triple encoding), checked for traversal on the decoded
//! form, and normalized under the fixed workspace root. Host-side bind
//! sources are screened against the protected system prefixes.

use crate::security::{Result, SecurityError};

/// Fixed root every file operation is confined to.
pub const WORKSPACE_ROOT: &str = "/workspace";

/// Container-side mount targets allowed for volume binds.
const ALLOWED_MOUNT_TARGETS: &[&str] = &["/workspace", "/data"];

/// Host prefixes never allowed as bind sources.
const PROTECTED_HOST_PREFIXES: &[&str] = &[
    "/etc", "/proc", "/sys", "/dev", "/var", "/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64",
    "/root", "/home", "/boot", "/opt", "/run", "/srv", "/mnt", "/media",
];

/// Maximum percent-decoding rounds applied before traversal checks.
const DECODE_ROUNDS: usize = 3;

/// Sanitize a caller-supplied path into an absolute path under the
/// workspace root.
///
/// # Errors
///
/// Returns `SecurityError::PathViolation` on null bytes, traversal
/// components (including percent-encoded forms), or escape from the root.
pub fn sanitize_path(input: &str) -> Result<String> {
    if input.is_empty() {
        return Err(SecurityError::PathViolation("empty path".to_string()));
    }
    if input.contains('\0') || input.contains("%00") {
        return Err(SecurityError::PathViolation(
            "null byte in path".to_string(),
        ));
    }

    // Decode before checking: %252e%252e survives one round as %2e%2e.
    let decoded = percent_decode_rounds(input, DECODE_ROUNDS);

    if decoded.contains('\0') {
        return Err(SecurityError::PathViolation(
            "null byte in path".to_string(),
        ));
    }
    if decoded.contains('\\') {
        return Err(SecurityError::PathViolation(
            "backslash in path".to_string(),
        ));
    }

    for component in decoded.split('/') {
        if component == ".." {
            return Err(SecurityError::PathViolation(format!(
                "traversal component in {input:?}"
            )));
        }
        if component == "." && decoded != "." {
            return Err(SecurityError::PathViolation(format!(
                "dot component in {input:?}"
            )));
        }
    }
    if decoded == "." || decoded == ".." {
        return Err(SecurityError::PathViolation(format!(
            "relative component {input:?}"
        )));
    }

    // Normalize under the root: absolute paths must already live there,
    // relative paths are joined onto it.
    let normalized = if let Some(rest) = decoded.strip_prefix(WORKSPACE_ROOT) {
        if rest.is_empty() || rest.starts_with('/') {
            decoded.clone()
        } else {
            // `/workspacefoo` shares the prefix string but not the directory
            return Err(SecurityError::PathViolation(format!(
                "path escapes workspace: {input:?}"
            )));
        }
    } else if decoded.starts_with('/') {
        return Err(SecurityError::PathViolation(format!(
            "path outside workspace: {input:?}"
        )));
    } else {
        format!("{WORKSPACE_ROOT}/{}", decoded.trim_start_matches('/'))
    };

    // Collapse doubled separators and trailing slash
    let mut collapsed = String::with_capacity(normalized.len());
    let mut last_was_slash = false;
    for ch in normalized.chars() {
        if ch == '/' {
            if !last_was_slash {
                collapsed.push(ch);
            }
            last_was_slash = true;
        } else {
            collapsed.push(ch);
            last_was_slash = false;
        }
    }
    let collapsed = if collapsed.len() > 1 {
        collapsed.trim_end_matches('/').to_string()
    } else {
        collapsed
    };

    debug_assert!(
        collapsed == WORKSPACE_ROOT || collapsed.starts_with(&format!("{WORKSPACE_ROOT}/"))
    );

    Ok(collapsed)
}

/// Whether a sanitized path names the workspace root itself.
pub fn is_workspace_root(sanitized: &str) -> bool {
    sanitized == WORKSPACE_ROOT
}

/// Validate volume binds of the form `host:container[:mode]`.
///
/// # Errors
///
/// Returns `SecurityError::ForbiddenMount` when a host source sits under a
/// protected prefix (including the engine socket) or a container target is
/// outside the allowed mount points.
pub fn validate_volume_binds(binds: &[String]) -> Result<()> {
    for bind in binds {
        let mut parts = bind.splitn(3, ':');
        let host = parts.next().unwrap_or_default();
        let container = parts.next().unwrap_or_default();

        if host.is_empty() || container.is_empty() {
            return Err(SecurityError::ForbiddenMount(format!(
                "malformed bind {bind:?}"
            )));
        }
        if !host.starts_with('/') {
            return Err(SecurityError::ForbiddenMount(format!(
                "host path must be absolute: {host}"
            )));
        }

        if host.ends_with("docker.sock") || host.ends_with("podman.sock") {
            return Err(SecurityError::ForbiddenMount(format!(
                "engine socket may not be mounted: {host}"
            )));
        }

        for prefix in PROTECTED_HOST_PREFIXES {
            if host == *prefix || host.starts_with(&format!("{prefix}/")) {
                return Err(SecurityError::ForbiddenMount(format!(
                    "host path under protected prefix {prefix}: {host}"
                )));
            }
        }

        let target_ok = ALLOWED_MOUNT_TARGETS
            .iter()
            .any(|allowed| container == *allowed || container.starts_with(&format!("{allowed}/")));
        if !target_ok {
            return Err(SecurityError::ForbiddenMount(format!(
                "container target outside /workspace and /data: {container}"
            )));
        }
    }

    Ok(())
}

/// Decode `%XX` sequences repeatedly, up to `rounds` times or until stable.
fn percent_decode_rounds(input: &str, rounds: usize) -> String {
    let mut current = input.to_string();
    for _ in 0..rounds {
        let decoded = percent_decode_once(&current);
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

fn percent_decode_once(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3])
            && let Ok(value) = u8::from_str_radix(hex, 16)
        {
            out.push(value);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_joins_root() {
        assert_eq!(sanitize_path("data/out.txt").unwrap(), "/workspace/data/out.txt");
        assert_eq!(sanitize_path("file.py").unwrap(), "/workspace/file.py");
    }

    #[test]
    fn test_absolute_workspace_path_kept() {
        assert_eq!(
            sanitize_path("/workspace/a/b.txt").unwrap(),
            "/workspace/a/b.txt"
        );
        assert_eq!(sanitize_path("/workspace").unwrap(), "/workspace");
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(sanitize_path("..").is_err());
        assert!(sanitize_path("../etc/passwd").is_err());
        assert!(sanitize_path("/workspace/../etc").is_err());
        assert!(sanitize_path("a/../../b").is_err());
    }

    #[test]
    fn test_absolute_outside_root_rejected() {
        assert!(sanitize_path("/etc/passwd").is_err());
        assert!(sanitize_path("/tmp/x").is_err());
        assert!(sanitize_path("/workspacefoo/x").is_err());
    }

    #[test]
    fn test_percent_encoded_traversal_rejected() {
        assert!(sanitize_path("%2e%2e/x").is_err());
        // Double-encoded: decodes to %2e%2e, then to ..
        assert!(sanitize_path("%252e%252e/x").is_err());
        // Triple-encoded still resolves within three rounds
        assert!(sanitize_path("%25252e%25252e/x").is_err());
    }

    #[test]
    fn test_null_byte_rejected() {
        assert!(sanitize_path("a\0b").is_err());
        assert!(sanitize_path("a%00b").is_err());
    }

    #[test]
    fn test_doubled_separators_collapse() {
        assert_eq!(sanitize_path("a//b///c").unwrap(), "/workspace/a/b/c");
    }

    #[test]
    fn test_workspace_root_detection() {
        assert!(is_workspace_root(&sanitize_path("/workspace").unwrap()));
        assert!(!is_workspace_root(&sanitize_path("/workspace/x").unwrap()));
    }

    #[test]
    fn test_engine_socket_bind_rejected() {
        let binds = vec!["/var/run/docker.sock:/workspace/sock".to_string()];
        assert!(matches!(
            validate_volume_binds(&binds),
            Err(SecurityError::ForbiddenMount(_))
        ));
    }

    #[test]
    fn test_system_prefix_bind_rejected() {
        for host in ["/etc/passwd", "/proc", "/sys/kernel", "/home/user", "/root/.ssh"] {
            let binds = vec![format!("{host}:/workspace/x")];
            assert!(validate_volume_binds(&binds).is_err(), "{host} should be rejected");
        }
    }

    #[test]
    fn test_container_target_restricted() {
        let binds = vec!["/scratch/project:/etc/override".to_string()];
        assert!(validate_volume_binds(&binds).is_err());

        let binds = vec!["/scratch/project:/workspace/project:ro".to_string()];
        assert!(validate_volume_binds(&binds).is_ok());

        let binds = vec!["/scratch/data:/data".to_string()];
        assert!(validate_volume_binds(&binds).is_ok());
    }
}
