//! MCP tool surface and the service facade behind it.

mod handler;
mod service;
mod types;

pub use handler::{SandboxServer, run};
pub use service::SandboxService;
pub use types::*;
