pub mod config;
pub mod error;
pub mod handlers;
pub mod mcp;

pub use error::McpError;
pub use mcp::McpManager;
