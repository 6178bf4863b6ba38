//! Standard node library
//!
//! Built-in nodes for the three authorization tiers: tools that need no
//! credentials, API nodes that attach a static key, and federated nodes
//! that go through the gateway.

mod debug;
mod http;
mod math;
mod mcp;
mod text;
mod time;
mod transform;

pub use debug::DebugNode;
pub use http::HttpRequestNode;
pub use math::{evaluate, CalcError, CalculateNode};
pub use mcp::McpToolNode;
pub use text::{TextOperation, TextProcessNode};
pub use time::DelayNode;
pub use transform::{extract, JsonExtractNode, JsonParseNode, JsonStringifyNode};

use std::sync::Arc;
use weavecore::WorkflowError;
use weavegateway::FederatedGateway;
use weaveruntime::NodeRegistryBuilder;

/// Register all standard nodes with a registry
pub fn register_all(
    builder: &mut NodeRegistryBuilder,
    gateway: Arc<FederatedGateway>,
) -> Result<(), WorkflowError> {
    builder
        .register(DebugNode)?
        .register(DelayNode)?
        .register(TextProcessNode)?
        .register(CalculateNode)?
        .register(JsonParseNode)?
        .register(JsonStringifyNode)?
        .register(JsonExtractNode)?
        .register(HttpRequestNode::new(gateway.injector().clone()))?
        .register(McpToolNode::new(gateway))?;
    Ok(())
}
