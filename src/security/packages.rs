//! Package-spec validation.
//!
//! Install requests arrive as loose specs (`requests==2.31`, `left-pad`,
//! `@types/node@20`). The validator strips version syntax, rejects anything
//! that is not a plain registry name, and screens the base name against the
//! per-language blocked identifier list.

use std::sync::LazyLock;

use regex::Regex;

use crate::runtime::Language;
use crate::security::{Result, SecurityError};

const MAX_SPEC_LEN: usize = 200;

// `>` and `<` are absent: they appear in legitimate version constraints
// and are stripped with the rest of the version syntax.
const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '(', ')', '\n', '\r'];

/// Identifiers that shadow interpreter internals or grant process control.
fn blocked_identifiers(language: Language) -> &'static [&'static str] {
    match language {
        Language::Python => &["os", "sys", "subprocess", "ctypes", "importlib"],
        Language::JavaScript | Language::TypeScript => &["child_process", "fs", "vm", "cluster"],
        Language::Go => &["os/exec", "syscall", "unsafe"],
        Language::Rust => &["std"],
        Language::Bash => &["sudo"],
    }
}

static PYTHON_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());
static NPM_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(@[a-z0-9][a-z0-9._-]*/)?[a-z0-9][a-z0-9._-]*$").unwrap());
static GO_MODULE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9./_-]*$").unwrap());
static CRATE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").unwrap());
static APK_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").unwrap());

fn name_pattern(language: Language) -> &'static Regex {
    match language {
        Language::Python => &PYTHON_NAME,
        Language::JavaScript | Language::TypeScript => &NPM_NAME,
        Language::Go => &GO_MODULE,
        Language::Rust => &CRATE_NAME,
        Language::Bash => &APK_NAME,
    }
}

/// Validate a list of package specs for a language.
///
/// Returns the stripped base names in input order.
///
/// # Errors
///
/// Returns `SecurityError::InvalidPackage` for malformed or non-registry
/// specs and `SecurityError::BlockedPackage` for blocked identifiers.
pub fn validate_packages(language: Language, specs: &[String]) -> Result<Vec<String>> {
    specs
        .iter()
        .map(|spec| validate_one(language, spec))
        .collect()
}

fn validate_one(language: Language, spec: &str) -> Result<String> {
    let spec = spec.trim();

    if spec.is_empty() {
        return Err(SecurityError::InvalidPackage("empty spec".to_string()));
    }
    if spec.len() > MAX_SPEC_LEN {
        return Err(SecurityError::InvalidPackage(format!(
            "spec exceeds {MAX_SPEC_LEN} characters"
        )));
    }
    if spec.contains(SHELL_METACHARACTERS) || spec.contains(char::is_whitespace) {
        return Err(SecurityError::InvalidPackage(format!(
            "shell metacharacters in {spec:?}"
        )));
    }
    if spec.starts_with("git+") || spec.contains("://") {
        return Err(SecurityError::InvalidPackage(format!(
            "URL and git sources are not allowed: {spec}"
        )));
    }
    if spec.starts_with('/') || spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('~') {
        return Err(SecurityError::InvalidPackage(format!(
            "local paths are not allowed: {spec}"
        )));
    }

    let base = strip_version(language, spec);
    if base.is_empty() {
        return Err(SecurityError::InvalidPackage(format!(
            "no package name in {spec:?}"
        )));
    }

    let lowered = base.to_lowercase();
    if blocked_identifiers(language)
        .iter()
        .any(|blocked| *blocked == lowered)
    {
        return Err(SecurityError::BlockedPackage(base.to_string()));
    }

    if !name_pattern(language).is_match(&base) {
        return Err(SecurityError::InvalidPackage(format!(
            "invalid {} package name: {base}",
            language.as_str()
        )));
    }

    Ok(base)
}

/// Strip version specifiers and extras, leaving the registry name.
fn strip_version(language: Language, spec: &str) -> String {
    // Extras first: requests[socks]==2.x
    let spec = spec.split('[').next().unwrap_or(spec);

    // Comparison operators
    let spec = ["==", ">=", "<=", "!=", "~=", "===", ">", "<", "="]
        .iter()
        .fold(spec, |s, op| s.split(op).next().unwrap_or(s));

    // npm-style @version suffix; keep a leading @scope intact
    let spec = match language {
        Language::JavaScript | Language::TypeScript => {
            if let Some(rest) = spec.strip_prefix('@') {
                match rest.split_once('@') {
                    Some((name, _version)) => format!("@{name}"),
                    None => format!("@{rest}"),
                }
            } else {
                spec.split('@').next().unwrap_or(spec).to_string()
            }
        }
        _ => spec.split('@').next().unwrap_or(spec).to_string(),
    };

    spec.trim().to_string()
}
