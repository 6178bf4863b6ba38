use std::collections::BTreeMap;
use std::sync::Arc;
use weavecore::{NodeDefinition, NodeExecutor, WorkflowError, WorkflowGraph};

/// Collects node implementations at startup.
#[derive(Default)]
pub struct NodeRegistryBuilder {
    executors: BTreeMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<N: NodeExecutor + 'static>(&mut self, node: N) -> Result<&mut Self, WorkflowError> {
        self.register_arc(Arc::new(node))
    }

    pub fn register_arc(&mut self, node: Arc<dyn NodeExecutor>) -> Result<&mut Self, WorkflowError> {
        let node_type = node.definition().node_type;
        if self.executors.contains_key(&node_type) {
            return Err(WorkflowError::DuplicateNodeType(node_type));
        }
        tracing::info!("Registering node type: {}", node_type);
        self.executors.insert(node_type, node);
        Ok(self)
    }

    pub fn build(self) -> NodeRegistry {
        NodeRegistry {
            executors: self.executors,
        }
    }
}

/// Read-only lookup from node type to its implementation.
pub struct NodeRegistry {
    executors: BTreeMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::new()
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>, WorkflowError> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownNodeType {
                node_type: node_type.to_string(),
            })
    }

    /// Sorted.
    pub fn list_node_types(&self) -> Vec<&str> {
        self.executors.keys().map(String::as_str).collect()
    }

    pub fn definition(&self, node_type: &str) -> Option<NodeDefinition> {
        self.executors.get(node_type).map(|n| n.definition())
    }

    pub fn definitions(&self) -> Vec<NodeDefinition> {
        self.executors.values().map(|n| n.definition()).collect()
    }

    /// Fail on the first node whose type is not registered.
    pub fn validate_types(&self, workflow: &WorkflowGraph) -> Result<(), WorkflowError> {
        for node in &workflow.nodes {
            self.get(&node.node_type)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_types", &self.list_node_types())
            .finish()
    }
}
