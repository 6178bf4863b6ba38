use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weavecore::{JsonMap, Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};

#[derive(Debug, Deserialize)]
pub struct DebugInput {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(flatten)]
    pub rest: JsonMap,
}

#[derive(Debug, Serialize)]
pub struct DebugOutput {
    pub message: String,
}

/// Simple debug node that logs its inputs
pub struct DebugNode;

#[async_trait]
impl Node for DebugNode {
    type Input = DebugInput;
    type Output = DebugOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("debug.log", NodeKind::Tool)
            .describe("debug", "Logs input values for debugging")
            .input(PortDefinition::optional("message", "Text to log"))
            .output(PortDefinition::required("message", "The logged text"))
    }

    async fn execute(&self, input: DebugInput, ctx: &NodeContext) -> Result<DebugOutput, NodeError> {
        let message = input.message.unwrap_or_else(|| "(no message)".to_string());
        tracing::info!(node_id = %ctx.node_id, "DEBUG: {}", message);
        ctx.events.info(format!("DEBUG: {message}"));

        for (key, value) in &input.rest {
            ctx.events.info(format!("  {key}: {value}"));
        }

        Ok(DebugOutput { message })
    }
}
