use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use weavecore::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Local subprocess speaking line-delimited JSON-RPC.
    Stdio,
    /// Stateless HTTP POST per request.
    #[serde(alias = "http")]
    StreamableHttp,
    /// Long-lived server-sent-events stream.
    Sse,
}

impl TransportKind {
    pub fn is_http(self) -> bool {
        matches!(self, TransportKind::StreamableHttp | TransportKind::Sse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stdio => "stdio",
            TransportKind::StreamableHttp => "streamable_http",
            TransportKind::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionParams {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

impl ConnectionParams {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::Stdio {
            command: command.into(),
            args,
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }
}

/// Static registry entry for one federated server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(alias = "id")]
    pub server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "transport_type")]
    pub transport: TransportKind,
    #[serde(alias = "connection_config")]
    pub connection: ConnectionParams,
    /// `None` means the server needs no authorization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_type: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

impl ServerConfig {
    pub fn new(
        server_id: impl Into<String>,
        transport: TransportKind,
        connection: ConnectionParams,
    ) -> Self {
        let server_id = server_id.into();
        Self {
            name: server_id.clone(),
            server_id,
            transport,
            connection,
            credential_type: None,
            tools: Vec::new(),
            enabled: true,
            max_connections: None,
        }
    }

    pub fn with_credential(mut self, credential_type: impl Into<String>) -> Self {
        self.credential_type = Some(credential_type.into());
        self
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = Some(limit);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// A transport kind whose connection params don't match is rejected here
    /// rather than at connect time.
    pub fn validate(&self) -> Result<(), String> {
        if self.server_id.is_empty() {
            return Err("server_id must not be empty".to_string());
        }
        match (&self.connection, self.transport) {
            (ConnectionParams::Stdio { command, .. }, TransportKind::Stdio) if !command.is_empty() => {
                Ok(())
            }
            (ConnectionParams::Http { url, .. }, kind) if kind.is_http() => {
                if url.starts_with("http://") || url.starts_with("https://") {
                    Ok(())
                } else {
                    Err(format!("server '{}' has non-http url '{url}'", self.server_id))
                }
            }
            _ => Err(format!(
                "server '{}' connection params do not match transport '{}'",
                self.server_id, self.transport
            )),
        }
    }
}

/// What happens when a pool key is at its connection limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Wait in FIFO order, bounded both in queue length and in wait time.
    Queue {
        max_waiters: usize,
        wait_timeout_ms: u64,
    },
    /// Fail immediately with `PoolExhausted`.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_connections_per_server: usize,
    pub idle_timeout_ms: u64,
    pub on_exhausted: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_server: 4,
            idle_timeout_ms: 300_000,
            on_exhausted: ExhaustionPolicy::Queue {
                max_waiters: 32,
                wait_timeout_ms: 10_000,
            },
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub pool: PoolConfig,
    pub call_timeout_ms: u64,
    /// Applied to retryable transport errors inside `send`.
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            call_timeout_ms: 30_000,
            retry: RetryPolicy::new(3, 500)
                .with_multiplier(2.0)
                .with_max_delay_ms(10_000),
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_registry_entries() {
        let stdio: ServerConfig = serde_json::from_value(json!({
            "id": "notion",
            "name": "Notion",
            "transport": "stdio",
            "connection": {"command": "npx", "args": ["-y", "@notionhq/notion-mcp-server"]},
            "credential_type": "notion_oauth"
        }))
        .unwrap();
        assert_eq!(stdio.server_id, "notion");
        assert!(stdio.enabled);
        assert!(stdio.validate().is_ok());

        let http: ServerConfig = serde_json::from_value(json!({
            "server_id": "github",
            "transport": "http",
            "connection": {"url": "https://gitmcp.io/api"}
        }))
        .unwrap();
        assert_eq!(http.transport, TransportKind::StreamableHttp);
        assert!(http.credential_type.is_none());
    }

    #[test]
    fn rejects_mismatched_connection_params() {
        let cfg = ServerConfig::new("x", TransportKind::Sse, ConnectionParams::stdio("cat", vec![]));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn gateway_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.pool.max_connections_per_server, 4);
        assert_eq!(cfg.call_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.delay_for(0), Duration::from_millis(500));
    }
}
