use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Which channel a server is reached over.
///
/// Unknown kinds are kept rather than rejected at parse time so that the
/// connect attempt can record them as an error on the server's record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransportKind {
    Process,
    EventStream,
    Request,
    Unsupported(String),
}

impl TransportKind {
    pub fn as_str(&self) -> &str {
        match self {
            TransportKind::Process => "process",
            TransportKind::EventStream => "event-stream",
            TransportKind::Request => "request",
            TransportKind::Unsupported(other) => other,
        }
    }
}

impl From<String> for TransportKind {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "process" | "stdio" => TransportKind::Process,
            "event-stream" | "sse" => TransportKind::EventStream,
            "request" | "http" | "streamable-http" => TransportKind::Request,
            _ => TransportKind::Unsupported(value),
        }
    }
}

impl From<TransportKind> for String {
    fn from(kind: TransportKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    // process
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,

    // event-stream / request
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-call operation timeout in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Advisory only; nothing reconnects automatically.
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub health_check_interval_ms: Option<u64>,
    /// `0` disables the monitoring ceiling for this server.
    #[serde(default)]
    pub health_check_lifetime_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "type")]
    pub transport: TransportKind,
    #[serde(default)]
    pub config: ServerConfig,
}

impl ServerDefinition {
    pub fn new(id: impl Into<String>, transport: TransportKind, config: ServerConfig) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            transport,
            config,
        }
    }

    pub fn process(id: impl Into<String>, command: &str, args: &[&str]) -> Self {
        Self::new(
            id,
            TransportKind::Process,
            ServerConfig {
                command: Some(command.to_string()),
                args: args.iter().map(|a| a.to_string()).collect(),
                ..ServerConfig::default()
            },
        )
    }

    pub fn event_stream(id: impl Into<String>, url: &str) -> Self {
        Self::new(
            id,
            TransportKind::EventStream,
            ServerConfig {
                url: Some(url.to_string()),
                ..ServerConfig::default()
            },
        )
    }

    pub fn request(id: impl Into<String>, url: &str) -> Self {
        Self::new(
            id,
            TransportKind::Request,
            ServerConfig {
                url: Some(url.to_string()),
                ..ServerConfig::default()
            },
        )
    }

    /// Per-call bound from the definition; `0` means use the manager default.
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.config
            .timeout
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Read-only view of a connection record handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: String,
    pub name: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<McpPromptArgument>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// What the server reported about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerIdentity {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    #[serde(default)]
    pub capabilities: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapabilityCounts {
    pub tools: usize,
    pub prompts: usize,
    pub resources: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub id: String,
    pub status: ConnectionStatus,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityCounts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub health_checks: Vec<HealthCheck>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new(health_checks: Vec<HealthCheck>) -> Self {
        let healthy = health_checks.iter().filter(|c| c.healthy).count();
        let summary = HealthSummary {
            total: health_checks.len(),
            healthy,
            unhealthy: health_checks.len() - healthy,
        };
        Self {
            health_checks,
            summary,
        }
    }
}

/// Result of exercising every capability query of one connected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub server_id: String,
    pub healthy: bool,
    pub server_info: Option<ServerIdentity>,
    pub tools: Option<Vec<McpTool>>,
    pub prompts: Option<Vec<McpPrompt>>,
    pub resources: Option<Vec<McpResource>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "type", default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default)]
    pub disabled: bool,
    #[serde(flatten)]
    pub config: ServerConfig,
}

fn default_transport() -> TransportKind {
    TransportKind::Process
}

/// The on-disk server catalogue, keyed by server id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, CatalogEntry>,
}

impl McpConfig {
    /// Enabled entries as definitions, sorted by id.
    pub fn definitions(&self) -> Vec<ServerDefinition> {
        let mut definitions: Vec<ServerDefinition> = self
            .mcp_servers
            .iter()
            .filter(|(_, entry)| !entry.disabled)
            .map(|(id, entry)| ServerDefinition {
                id: id.clone(),
                name: entry.name.clone().unwrap_or_else(|| id.clone()),
                transport: entry.transport.clone(),
                config: entry.config.clone(),
            })
            .collect();
        definitions.sort_by(|a, b| a.id.cmp(&b.id));
        definitions
    }
}
