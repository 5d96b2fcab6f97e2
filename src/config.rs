use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::mcp::{ManagerSettings, McpConfig, MonitorPolicy};

#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub servers_file: PathBuf,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub health_interval: Duration,
    /// `None` when `MCP_HEALTH_LIFETIME_SECS=0`.
    pub health_lifetime: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let health_lifetime = parse_var("MCP_HEALTH_LIFETIME_SECS", 300u64)?;
        Ok(Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            server_port: parse_var("SERVER_PORT", 3000)?,
            servers_file: env::var("MCP_SERVERS_FILE")
                .unwrap_or_else(|_| "mcp_servers.json".to_string())
                .into(),
            connect_timeout: Duration::from_secs(parse_var("MCP_CONNECT_TIMEOUT_SECS", 30)?),
            operation_timeout: Duration::from_secs(parse_var("MCP_OPERATION_TIMEOUT_SECS", 60)?),
            health_interval: Duration::from_secs(parse_var("MCP_HEALTH_INTERVAL_SECS", 30)?),
            health_lifetime: (health_lifetime > 0).then(|| Duration::from_secs(health_lifetime)),
        })
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            connect_timeout: self.connect_timeout,
            operation_timeout: self.operation_timeout,
            monitor: MonitorPolicy {
                interval: self.health_interval,
                lifetime: self.health_lifetime,
            },
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", name, raw)),
        Err(_) => Ok(default),
    }
}

/// Reads the server catalogue, expanding `${VAR}` references first.
pub fn load_catalog<P: AsRef<Path>>(path: P) -> Result<McpConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let content = expand_env_vars(&content)?;
    let catalog: McpConfig = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(catalog)
}

/// Unset variables expand to an empty string.
fn expand_env_vars(content: &str) -> Result<String> {
    let re = Regex::new(r"\$\{(\w+)\}")?;
    let expanded = re.replace_all(content, |cap: &Captures| {
        env::var(&cap[1]).unwrap_or_default()
    });
    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::TransportKind;
    use std::io::Write;

    #[test]
    fn expands_known_and_blanks_unknown_vars() {
        env::set_var("MCP_HUB_TEST_TOKEN", "s3cret");
        let out = expand_env_vars(r#"{"a": "${MCP_HUB_TEST_TOKEN}", "b": "${MCP_HUB_TEST_UNSET}"}"#)
            .unwrap();
        assert_eq!(out, r#"{"a": "s3cret", "b": ""}"#);
    }

    #[test]
    fn loads_catalogue_from_file() {
        env::set_var("MCP_HUB_TEST_URL", "http://127.0.0.1:9000/mcp");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{
                "remote": {{"type": "http", "url": "${{MCP_HUB_TEST_URL}}", "timeout": 2000}},
                "local": {{"name": "Local", "command": "mcp-echo-server"}}
            }}}}"#
        )
        .unwrap();

        let definitions = load_catalog(file.path()).unwrap().definitions();
        assert_eq!(definitions.len(), 2);
        assert_eq!(definitions[0].id, "local");
        assert_eq!(definitions[0].name, "Local");
        assert_eq!(definitions[0].transport, TransportKind::Process);
        assert_eq!(definitions[1].transport, TransportKind::Request);
        assert_eq!(
            definitions[1].config.url.as_deref(),
            Some("http://127.0.0.1:9000/mcp")
        );
        assert_eq!(
            definitions[1].operation_timeout(),
            Some(Duration::from_millis(2000))
        );
    }

    #[test]
    fn missing_catalogue_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_catalog(dir.path().join("absent.json")).is_err());
    }
}
