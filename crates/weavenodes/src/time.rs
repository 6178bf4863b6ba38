use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use weavecore::{JsonMap, Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};

fn default_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
pub struct DelayInput {
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Passed through untouched.
    #[serde(flatten)]
    pub rest: JsonMap,
}

/// Delay execution for a specified duration
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    type Input = DelayInput;
    type Output = JsonMap;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("time.delay", NodeKind::Tool)
            .describe("time", "Delay execution for specified milliseconds")
            .input(PortDefinition::optional("delay_ms", "Milliseconds to wait (default 1000)"))
    }

    async fn execute(&self, input: DelayInput, ctx: &NodeContext) -> Result<JsonMap, NodeError> {
        ctx.events.info(format!("Delaying for {}ms", input.delay_ms));

        tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
            _ = sleep(Duration::from_millis(input.delay_ms)) => {}
        }

        Ok(input.rest)
    }
}
