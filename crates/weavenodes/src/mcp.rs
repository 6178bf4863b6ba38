use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use weavecore::{JsonMap, Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};
use weavegateway::FederatedGateway;

#[derive(Debug, Deserialize)]
pub struct McpToolInput {
    pub server_id: String,
    pub tool: String,
    #[serde(default)]
    pub arguments: JsonMap,
}

#[derive(Debug, Serialize)]
pub struct McpToolOutput {
    pub server_id: String,
    pub tool: String,
    pub content: Vec<Value>,
    /// The text items of `content`, newline-joined.
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
}

/// Calls one tool on a federated server with the executing user's credential.
pub struct McpToolNode {
    gateway: Arc<FederatedGateway>,
}

impl McpToolNode {
    pub fn new(gateway: Arc<FederatedGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl Node for McpToolNode {
    type Input = McpToolInput;
    type Output = McpToolOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("mcp.tool", NodeKind::Federated)
            .describe("mcp", "Call a tool on a federated MCP server")
            .input(PortDefinition::required("server_id", "Registered server id"))
            .input(PortDefinition::required("tool", "Tool name"))
            .input(PortDefinition::optional("arguments", "Tool arguments"))
            .output(PortDefinition::required("content", "Content items returned by the tool"))
            .output(PortDefinition::required("text", "Text content, joined"))
            .output(PortDefinition::optional("structured", "Structured content, when provided"))
    }

    async fn execute(&self, input: McpToolInput, ctx: &NodeContext) -> Result<McpToolOutput, NodeError> {
        let server = self.gateway.server(&input.server_id)?;
        if !server.tools.is_empty() && !server.tools.iter().any(|t| t == &input.tool) {
            return Err(NodeError::validation(
                "tool",
                format!("server '{}' does not offer tool '{}'", input.server_id, input.tool),
            ));
        }
        let credential = match server.credential_type.as_deref() {
            Some(credential_type) => Some(ctx.credential_for_server(&input.server_id, credential_type)?),
            None => None,
        };

        let mut session = self
            .gateway
            .connect(&ctx.user_id, &input.server_id, credential.as_ref(), &ctx.cancellation)
            .await?;
        ctx.events.info(format!("Calling {}/{}", input.server_id, input.tool));
        let result = self
            .gateway
            .call_tool(&mut session, &input.tool, Value::Object(input.arguments), &ctx.cancellation)
            .await?;
        drop(session);

        let content = result
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let text = content
            .iter()
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = if text.is_empty() {
                format!("tool '{}' reported an error", input.tool)
            } else {
                text
            };
            return Err(NodeError::failed("TOOL_ERROR", message));
        }

        Ok(McpToolOutput {
            server_id: input.server_id,
            tool: input.tool,
            structured: result.get("structuredContent").cloned(),
            content,
            text,
        })
    }
}
