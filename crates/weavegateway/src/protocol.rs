//! JSON-RPC 2.0 framing for MCP servers.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;
use weavecore::TransportError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "weave";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Uuid::new_v4().to_string()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn initialize() -> Self {
        Self::new(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION")},
            }),
        )
    }

    pub fn initialized() -> Self {
        Self::notification("notifications/initialized", Value::Null)
    }

    pub fn list_tools() -> Self {
        Self::new("tools/list", json!({}))
    }

    pub fn call_tool(name: &str, arguments: Value) -> Self {
        Self::new("tools/call", json!({"name": name, "arguments": arguments}))
    }

    /// A copy with a fresh id, used when a request is re-sent on a new connection.
    pub fn reissue(&self) -> Self {
        let mut copy = self.clone();
        if copy.id.is_some() {
            copy.id = Some(Uuid::new_v4().to_string());
        }
        copy
    }

    pub fn to_line(&self) -> Result<String, TransportError> {
        serde_json::to_string(self).map_err(|e| TransportError::protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        serde_json::from_str(raw)
            .map_err(|e| TransportError::protocol(format!("undecodable response: {e}")))
    }

    /// Whether this message answers the request with `id`. Servers may echo
    /// string ids back as numbers only when they were numeric to begin with.
    pub fn answers(&self, id: &str) -> bool {
        match &self.id {
            Some(Value::String(s)) => s == id,
            Some(Value::Number(n)) => n.to_string() == id,
            _ => false,
        }
    }

    /// Messages with a method and no result are server-initiated notifications.
    pub fn is_response(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }

    pub fn into_result(self) -> Result<Value, TransportError> {
        match (self.error, self.result) {
            (Some(err), _) => Err(TransportError::protocol(format!(
                "server returned error {}: {}",
                err.code, err.message
            ))),
            (None, Some(result)) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_have_no_id() {
        let line = RpcRequest::initialized().to_line().unwrap();
        assert!(!line.contains("\"id\""));
        assert!(line.contains("notifications/initialized"));
    }

    #[test]
    fn error_objects_become_protocol_errors() {
        let resp = RpcResponse::parse(
            r#"{"jsonrpc":"2.0","id":"1","error":{"code":-32601,"message":"no such method"}}"#,
        )
        .unwrap();
        assert!(resp.answers("1"));
        let err = resp.into_result().unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "PROTOCOL_ERROR");
    }
}
