use crate::config::{ConnectionParams, ServerConfig, TransportKind};
use crate::error::{GatewayError, Result};
use std::collections::BTreeMap;
use std::path::Path;

/// Static, validated set of federated servers, keyed by server id.
#[derive(Debug, Clone, Default)]
pub struct ServerRegistry {
    servers: BTreeMap<String, ServerConfig>,
}

impl ServerRegistry {
    pub fn new(servers: Vec<ServerConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for server in servers {
            server.validate().map_err(GatewayError::InvalidConfig)?;
            if map.contains_key(&server.server_id) {
                return Err(GatewayError::InvalidConfig(format!(
                    "duplicate server id '{}'",
                    server.server_id
                )));
            }
            tracing::debug!(server_id = %server.server_id, transport = %server.transport, "Registered federated server");
            map.insert(server.server_id.clone(), server);
        }
        Ok(Self { servers: map })
    }

    /// The built-in catalogue.
    pub fn defaults() -> Self {
        let servers = vec![
            ServerConfig::new(
                "slack",
                TransportKind::StreamableHttp,
                ConnectionParams::http("https://mcp.slack.com/v1"),
            )
            .with_credential("slack_oauth")
            .with_tools(&["send_message", "list_channels", "get_channel_history"]),
            ServerConfig::new(
                "github",
                TransportKind::StreamableHttp,
                ConnectionParams::http("https://gitmcp.io/api"),
            )
            .with_credential("github_token")
            .with_tools(&["create_issue", "list_repos", "get_file_contents"]),
            ServerConfig::new(
                "filesystem",
                TransportKind::Stdio,
                ConnectionParams::stdio("npx", vec!["-y".into(), "@anthropic/mcp-filesystem".into()]),
            )
            .with_tools(&["read_file", "write_file", "list_directory"]),
            ServerConfig::new(
                "google_drive",
                TransportKind::StreamableHttp,
                ConnectionParams::http("https://mcp.googleapis.com/drive/v1"),
            )
            .with_credential("google_oauth")
            .with_tools(&["list_files", "read_file"])
            .disabled(),
            ServerConfig::new(
                "notion",
                TransportKind::Stdio,
                ConnectionParams::stdio("npx", vec!["-y".into(), "@notionhq/notion-mcp-server".into()]),
            )
            .with_credential("notion_oauth")
            .with_tools(&["search", "create_page", "update_page"]),
        ];
        let servers = servers
            .into_iter()
            .map(|mut s| {
                s.name = title_case(&s.server_id);
                (s.server_id.clone(), s)
            })
            .collect();
        Self { servers }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let servers: Vec<ServerConfig> =
            serde_json::from_str(raw).map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        Self::new(servers)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Enabled server by id.
    pub fn get(&self, server_id: &str) -> Result<&ServerConfig> {
        match self.servers.get(server_id) {
            Some(server) if server.enabled => Ok(server),
            Some(_) => Err(GatewayError::ServerDisabled(server_id.to_string())),
            None => Err(GatewayError::UnknownServer(server_id.to_string())),
        }
    }

    pub fn list_all(&self) -> Vec<&ServerConfig> {
        self.servers.values().collect()
    }

    pub fn list_enabled(&self) -> Vec<&ServerConfig> {
        self.servers.values().filter(|s| s.enabled).collect()
    }

    /// Enabled servers the caller can use with the given credential types.
    pub fn list_available(&self, credential_types: &[&str]) -> Vec<&ServerConfig> {
        self.servers
            .values()
            .filter(|s| s.enabled)
            .filter(|s| match s.credential_type.as_deref() {
                None => true,
                Some(ty) => credential_types.contains(&ty),
            })
            .collect()
    }

    pub fn list_by_transport(&self, kind: TransportKind) -> Vec<&ServerConfig> {
        self.servers
            .values()
            .filter(|s| s.enabled && s.transport == kind)
            .collect()
    }
}

fn title_case(id: &str) -> String {
    id.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
