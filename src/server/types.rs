//! Tool argument and response types.
//!
//! Arguments derive `JsonSchema` so the MCP layer can publish input
//! schemas; responses are plain serde structs rendered to JSON text in the
//! tool result.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditEvent, AuditStats};
use crate::cache::CacheStats;
use crate::pool::PoolStats;
use crate::runtime::{ExecMetrics, Language};
use crate::session::SessionSummary;

/// Arguments for `sandbox_execute`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExecuteArgs {
    /// Language to execute the code as
    pub language: Language,
    /// Source code to run
    pub code: String,
    /// Session name or id to run inside; omitted runs use a pooled container
    #[serde(default)]
    pub session: Option<String>,
    /// Execution timeout in milliseconds (default 30000)
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Run on the ML Python image (python only)
    #[serde(default)]
    pub ml: Option<bool>,
    /// Extra environment variables for this execution
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Standard input piped to the process
    #[serde(default)]
    pub stdin: Option<String>,
}

/// Result of `sandbox_execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i64,
    /// Wall-clock duration in milliseconds
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ExecMetrics>,
}

/// Session actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SessionAction {
    Create,
    List,
    Get,
    Pause,
    Resume,
    Destroy,
    Extend,
}

/// Arguments for `sandbox_session`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SessionArgs {
    pub action: SessionAction,
    /// Session name; required for every action except `list`
    #[serde(default)]
    pub name: Option<String>,
    /// Language for `create`
    #[serde(default)]
    pub language: Option<Language>,
    /// TTL in seconds; required for `create` and `extend`
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Use the ML Python image for `create`
    #[serde(default)]
    pub ml: Option<bool>,
    /// Request GPU pass-through for `create`
    #[serde(default)]
    pub gpu: Option<bool>,
}

/// Result of `sandbox_session`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl SessionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Arguments for `sandbox_install`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InstallArgs {
    /// Session name or id receiving the packages
    pub session: String,
    /// Package specs (version constraints are stripped)
    pub packages: Vec<String>,
}

/// Result of `sandbox_install`.
#[derive(Debug, Clone, Serialize)]
pub struct InstallResponse {
    pub success: bool,
    pub cached: bool,
    /// Install duration in milliseconds
    pub duration: u64,
    #[serde(rename = "installedPackages")]
    pub installed_packages: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// File operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Read,
    Write,
    List,
    Delete,
}

/// Arguments for `sandbox_file_ops`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct FileOpsArgs {
    /// Session name or id owning the filesystem
    pub session: String,
    pub operation: FileOperation,
    /// Path under /workspace
    pub path: String,
    /// Content for `write`
    #[serde(default)]
    pub content: Option<String>,
}

/// Result of `sandbox_file_ops`.
#[derive(Debug, Clone, Serialize)]
pub struct FileOpsResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,
}

/// Inspection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum InspectTarget {
    Pool,
    Cache,
    Sessions,
    Audit,
    All,
}

/// Arguments for `sandbox_inspect`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct InspectArgs {
    pub target: InspectTarget,
}

/// Result of `sandbox_inspect`; absent blocks were not requested.
#[derive(Debug, Clone, Serialize, Default)]
pub struct InspectResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<SessionSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_reachable: Option<bool>,
}

/// Security view actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SecurityAction {
    Events,
    Violations,
    Stats,
}

/// Arguments for `sandbox_security`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SecurityArgs {
    pub action: SecurityAction,
    /// Number of events to return (default 20)
    #[serde(default)]
    pub count: Option<usize>,
}

/// Result of `sandbox_security`.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<AuditEvent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AuditStats>,
}

/// Structured error payload carried in failed tool results.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", rename = "retryAfterMs")]
    pub retry_after_ms: Option<u64>,
}

impl From<&crate::error::SandboxError> for ErrorPayload {
    fn from(err: &crate::error::SandboxError) -> Self {
        let retry_after_ms = match err {
            crate::error::SandboxError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        };
        Self {
            error: ErrorBody {
                kind: err.kind(),
                message: err.to_string(),
                retry_after_ms,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_args_deserialization() {
        let args: ExecuteArgs = serde_json::from_str(
            r#"{"language": "python", "code": "print(2+2)", "timeout": 5000}"#,
        )
        .unwrap();
        assert_eq!(args.language, Language::Python);
        assert_eq!(args.timeout, Some(5000));
        assert!(args.session.is_none());
    }

    #[test]
    fn test_session_args_actions() {
        let args: SessionArgs =
            serde_json::from_str(r#"{"action": "create", "name": "dev", "language": "go", "ttl": 600}"#)
                .unwrap();
        assert_eq!(args.action, SessionAction::Create);
        assert_eq!(args.language, Some(Language::Go));
    }

    #[test]
    fn test_error_payload_shape() {
        let err = crate::error::SandboxError::RateLimited {
            retry_after_ms: 1200,
        };
        let payload = ErrorPayload::from(&err);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["error"]["kind"], "rate_limited");
        assert_eq!(json["error"]["retryAfterMs"], 1200);
    }

    #[test]
    fn test_execute_response_field_names() {
        let response = ExecuteResponse {
            stdout: "4\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration: 12,
            metrics: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["exitCode"], 0);
        assert_eq!(json["stdout"], "4\n");
        assert!(json.get("metrics").is_none());
    }
}
