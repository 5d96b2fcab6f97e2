mod connection;
pub mod deadline;
mod manager;
pub mod monitor;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

pub use deadline::Deadline;
pub use manager::{ManagerSettings, McpManager, DEFAULT_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT};
pub use monitor::MonitorPolicy;
pub use session::Session;
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
pub use types::{
    ConnectionSnapshot, ConnectionStatus, HealthReport, McpConfig, McpPrompt, McpResource,
    McpTool, ProbeReport, ServerConfig, ServerDefinition, ServerIdentity, TransportKind,
};
