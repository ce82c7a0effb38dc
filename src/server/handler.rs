//! MCP server handler.
//!
//! Thin shim between the MCP tool surface and [`SandboxService`]: each
//! tool deserializes its arguments, delegates, and renders the response
//! (or the structured error payload) as JSON text.

use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, ServiceExt,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
    transport::stdio,
};
use tracing::{debug, info};

use crate::error::SandboxError;
use crate::server::service::SandboxService;
use crate::server::types::*;

/// The MCP server for sandbox operations.
#[derive(Clone)]
pub struct SandboxServer {
    service: Arc<SandboxService>,
    tool_router: ToolRouter<Self>,
}

impl SandboxServer {
    pub fn new(service: Arc<SandboxService>) -> Self {
        Self {
            service,
            tool_router: Self::tool_router(),
        }
    }

    fn render<T: serde::Serialize>(result: Result<T, SandboxError>) -> Result<CallToolResult, McpError> {
        match result {
            Ok(response) => {
                let json = serde_json::to_string_pretty(&response)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::success(vec![Content::text(json)]))
            }
            Err(err) => {
                let payload = ErrorPayload::from(&err);
                let json = serde_json::to_string_pretty(&payload)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult::error(vec![Content::text(json)]))
            }
        }
    }
}

#[tool_router]
impl SandboxServer {
    /// Run a code snippet in a hardened container.
    #[tool(
        name = "sandbox_execute",
        description = "Execute code in a sandboxed container. Supports python, typescript, javascript, go, rust, and bash. Returns stdout, stderr, exit code, and duration."
    )]
    async fn sandbox_execute(
        &self,
        Parameters(args): Parameters<ExecuteArgs>,
    ) -> Result<CallToolResult, McpError> {
        debug!("sandbox_execute: {}", args.language);
        Self::render(self.service.execute(args).await)
    }

    /// Manage long-lived named sessions.
    #[tool(
        name = "sandbox_session",
        description = "Manage persistent sandbox sessions: create, list, get, pause, resume, destroy, extend. Sessions keep their container (and installed packages) alive between calls; create and extend require a ttl in seconds."
    )]
    async fn sandbox_session(
        &self,
        Parameters(args): Parameters<SessionArgs>,
    ) -> Result<CallToolResult, McpError> {
        Self::render(self.service.session(args).await)
    }

    /// Install packages into a session.
    #[tool(
        name = "sandbox_install",
        description = "Install packages into a session using the language's native package manager. Identical package sets are served from an image cache."
    )]
    async fn sandbox_install(
        &self,
        Parameters(args): Parameters<InstallArgs>,
    ) -> Result<CallToolResult, McpError> {
        Self::render(self.service.install(args).await)
    }

    /// Read, write, list, or delete files in a session workspace.
    #[tool(
        name = "sandbox_file_ops",
        description = "File operations inside a session's /workspace: read, write, list, delete. Paths are confined to the workspace."
    )]
    async fn sandbox_file_ops(
        &self,
        Parameters(args): Parameters<FileOpsArgs>,
    ) -> Result<CallToolResult, McpError> {
        Self::render(self.service.file_ops(args).await)
    }

    /// Inspect pool, cache, session, and audit state.
    #[tool(
        name = "sandbox_inspect",
        description = "Inspect sandbox internals: pool, cache, sessions, audit, or all."
    )]
    async fn sandbox_inspect(
        &self,
        Parameters(args): Parameters<InspectArgs>,
    ) -> Result<CallToolResult, McpError> {
        Self::render(self.service.inspect(args).await)
    }

    /// Query the security audit trail.
    #[tool(
        name = "sandbox_security",
        description = "Security views over the audit trail: recent security events, violations, or aggregate stats."
    )]
    async fn sandbox_security(
        &self,
        Parameters(args): Parameters<SecurityArgs>,
    ) -> Result<CallToolResult, McpError> {
        Self::render(self.service.security(args).await)
    }
}

#[tool_handler]
impl rmcp::ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Local code-execution sandbox. Code runs in hardened containers with \
                 no network access; use sandbox_session for stateful work and \
                 sandbox_install to add packages."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// Serve the MCP surface over stdio until the client disconnects, then
/// shut the service down.
///
/// # Errors
///
/// Returns error if the transport fails to initialize.
pub async fn run(service: Arc<SandboxService>) -> crate::error::Result<()> {
    info!("Starting MCP server on stdio");

    let server = SandboxServer::new(Arc::clone(&service));
    let running = server
        .serve(stdio())
        .await
        .map_err(|e| SandboxError::Container(format!("MCP server initialization failed: {e}")))?;

    info!("Server initialized, waiting for requests");

    if let Err(e) = running.waiting().await {
        tracing::warn!("Transport closed with error: {}", e);
    }

    service.shutdown().await;
    info!("Server shutdown complete");
    Ok(())
}
