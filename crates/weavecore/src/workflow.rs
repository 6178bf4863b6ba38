use crate::JsonMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

pub type WorkflowId = Uuid;
pub type NodeId = String;

/// Frozen workflow description. Shared behind an `Arc` once an execution binds it;
/// changes go through a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default = "Uuid::new_v4")]
    pub id: WorkflowId,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub config: WorkflowConfig,
}

fn default_version() -> u32 {
    1
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            name: Some(name.into()),
            nodes: Vec::new(),
            edges: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    /// Add a whole-output edge: the target receives every key of the source output.
    pub fn connect(&mut self, source: impl Into<String>, target: impl Into<String>) {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        });
    }

    /// Add an edge that routes one output key into one input key.
    pub fn connect_ports(
        &mut self,
        source: impl Into<String>,
        source_handle: impl Into<String>,
        target: impl Into<String>,
        target_handle: impl Into<String>,
    ) {
        self.edges.push(EdgeSpec {
            source: source.into(),
            target: target.into(),
            source_handle: Some(source_handle.into()),
            target_handle: Some(target_handle.into()),
        });
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn incoming_edges<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a EdgeSpec> + 'a {
        self.edges.iter().filter(move |e| e.target == id)
    }
}

/// Node specification in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: JsonMap,
    /// Layout metadata from the editor; never read by the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// A failing non-critical node skips its descendants but does not fail the execution.
    #[serde(default = "default_critical")]
    pub critical: bool,
}

fn default_critical() -> bool {
    true
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: JsonMap::new(),
            position: None,
            retry: None,
            timeout_ms: None,
            critical: true,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }
}

/// Edge between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(rename = "sourceHandle", default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(rename = "targetHandle", default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

/// Bounded retry with exponential backoff.
///
/// The n-th retry (0-based) waits `delay_ms * backoff_multiplier^n`, capped at
/// `max_delay_ms`. `max_retries` counts retries, so a node runs at most
/// `max_retries + 1` times.
/// Fields missing from a serialized policy take their `Default` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            delay_ms,
            ..Self::default()
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 0,
            backoff_multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let millis = self.delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(retry as i32);
        Duration::from_millis((millis as u64).min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Global workflow settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub max_concurrency: usize,
    pub node_timeout_ms: Option<u64>,
    pub on_error: ErrorHandling,
    /// Applied to nodes that carry no policy of their own.
    pub retry: RetryPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            node_timeout_ms: Some(30_000),
            on_error: ErrorHandling::StopWorkflow,
            retry: RetryPolicy::none(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Stop dispatching after the first critical failure.
    StopWorkflow,
    /// Keep running branches that do not depend on the failed node.
    ContinueOnError,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn parses_editor_json() {
        let graph: WorkflowGraph = serde_json::from_value(json!({
            "version": 2,
            "nodes": [
                {"id": "fetch", "type": "http.request", "config": {"url": "https://example.com"}, "position": {"x": 10, "y": 20}},
                {"id": "shout", "type": "text.process", "config": {"operation": "uppercase"}}
            ],
            "edges": [
                {"source": "fetch", "target": "shout", "sourceHandle": "body", "targetHandle": "text"}
            ],
            "config": {"max_concurrency": 2}
        }))
        .unwrap();

        assert_eq!(graph.version, 2);
        assert_eq!(graph.nodes[0].node_type, "http.request");
        assert!(graph.nodes[1].critical);
        assert_eq!(
            graph.edges[0],
            EdgeSpec {
                source: "fetch".into(),
                target: "shout".into(),
                source_handle: Some("body".into()),
                target_handle: Some("text".into()),
            }
        );
        assert_eq!(graph.config.max_concurrency, 2);
        assert_eq!(graph.config.on_error, ErrorHandling::StopWorkflow);
        assert_eq!(graph.config.retry.max_retries, 0);
    }

    #[test]
    fn partial_retry_policy_fills_in_defaults() {
        let node: NodeSpec = serde_json::from_value(json!({
            "id": "fetch",
            "type": "http.request",
            "retry": {"max_retries": 3, "delay_ms": 100}
        }))
        .unwrap();

        let retry = node.retry.unwrap();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.delay_ms, 100);
        assert_eq!(retry.backoff_multiplier, 2.0);
        assert_eq!(retry.max_delay_ms, 30_000);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::new(5, 100).with_multiplier(2.0).with_max_delay_ms(500);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }
}
