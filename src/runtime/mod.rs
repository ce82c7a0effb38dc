//! Per-language runtime adapters.
//!
//! Each supported language is described by a small adapter value carrying
//! its default image and package-manager convention, plus the translation
//! from source code to a container command. Dispatch is a match over the
//! closed [`Language`] enum rather than a trait object; the set of
//! languages is fixed and the enum keeps the policy in one place.
//!
//! ## Architecture
//!
//! - [`execute`]: code-to-command translation and temp-file protocol
//! - [`install`]: per-language package installation
//! - [`ml`]: ML Python variant composed over the base Python adapter
//! - [`recipes`]: Dockerfile text generation for the image builder

mod execute;
mod install;
mod ml;
mod recipes;

pub use execute::{ExecContext, ExecutionOutcome};
pub use install::InstallResult;
pub use ml::{ExecMetrics, ML_PYTHON_IMAGE, MlOptions, MlRuntime, parse_telemetry, validate_ml_packages};

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::security::SYSV_IPC_SYSCALLS;

/// Supported languages. The ML Python variant is a flag carried beside
/// `Python`, not a seventh member.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    TypeScript,
    JavaScript,
    Go,
    Rust,
    Bash,
}

impl Language {
    /// All supported languages.
    pub const ALL: [Language; 6] = [
        Language::Python,
        Language::TypeScript,
        Language::JavaScript,
        Language::Go,
        Language::Rust,
        Language::Bash,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Bash => "bash",
        }
    }

    /// Default base image for pooled containers of this language.
    pub fn default_image(&self) -> &'static str {
        match self {
            Language::Python => "python:3.12-slim",
            Language::TypeScript | Language::JavaScript => "node:22-slim",
            Language::Go => "golang:1.23-alpine",
            Language::Rust => "rust:1.82-slim",
            Language::Bash => "alpine:3.20",
        }
    }

    /// Native package manager tag, for diagnostics and recipes.
    pub fn package_manager(&self) -> &'static str {
        match self {
            Language::Python => "pip",
            Language::TypeScript | Language::JavaScript => "npm",
            Language::Go => "go",
            Language::Rust => "cargo",
            Language::Bash => "apk",
        }
    }

    /// Extra syscalls this language's interpreter needs beyond the base
    /// allow list.
    pub fn syscall_extras(&self) -> &'static [&'static str] {
        match self {
            // CPython multiprocessing uses SysV shared memory and semaphores
            Language::Python => SYSV_IPC_SYSCALLS,
            _ => &[],
        }
    }
}

impl std::str::FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "python" | "py" => Ok(Language::Python),
            "typescript" | "ts" => Ok(Language::TypeScript),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "go" | "golang" => Ok(Language::Go),
            "rust" | "rs" => Ok(Language::Rust),
            "bash" | "sh" | "shell" => Ok(Language::Bash),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter value for one language.
#[derive(Debug, Clone)]
pub struct RuntimeAdapter {
    language: Language,
    image: String,
}

impl RuntimeAdapter {
    /// Adapter with the language's default image.
    pub fn for_language(language: Language) -> Self {
        Self {
            language,
            image: language.default_image().to_string(),
        }
    }

    /// Adapter targeting a custom image (used by the ML variant).
    pub fn with_image(language: Language, image: impl Into<String>) -> Self {
        Self {
            language,
            image: image.into(),
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn image(&self) -> &str {
        &self.image
    }
}

/// Environment map alias used across execution contexts.
pub type EnvMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_round_trip() {
        for language in Language::ALL {
            let parsed: Language = language.as_str().parse().unwrap();
            assert_eq!(parsed, language);
        }
    }

    #[test]
    fn test_language_aliases() {
        assert_eq!("js".parse::<Language>().unwrap(), Language::JavaScript);
        assert_eq!("golang".parse::<Language>().unwrap(), Language::Go);
        assert_eq!("sh".parse::<Language>().unwrap(), Language::Bash);
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_python_gets_ipc_extras() {
        assert!(Language::Python.syscall_extras().contains(&"shmget"));
        assert!(Language::Bash.syscall_extras().is_empty());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&Language::TypeScript).unwrap();
        assert_eq!(json, "\"typescript\"");
        let parsed: Language = serde_json::from_str("\"go\"").unwrap();
        assert_eq!(parsed, Language::Go);
    }
}
