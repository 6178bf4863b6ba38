use crate::{
    events::{EventEmitter, ExecutionId},
    CredentialVault, DecryptedCredential, NodeError,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Where a node sources its authorization material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// No authorization at all.
    Tool,
    /// A static key taken from the user's credentials.
    Api,
    /// Per-user OAuth/token credentials routed through the federated gateway.
    Federated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

impl PortDefinition {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required: false,
        }
    }
}

/// Static description of a node type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub node_type: String,
    pub kind: NodeKind,
    pub description: String,
    pub category: String,
    pub credential_type: Option<String>,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
}

impl NodeDefinition {
    pub fn new(node_type: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            node_type: node_type.into(),
            kind,
            description: String::new(),
            category: "general".to_string(),
            credential_type: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn describe(mut self, category: impl Into<String>, description: impl Into<String>) -> Self {
        self.category = category.into();
        self.description = description.into();
        self
    }

    pub fn with_credential(mut self, credential_type: impl Into<String>) -> Self {
        self.credential_type = Some(credential_type.into());
        self
    }

    pub fn input(mut self, port: PortDefinition) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortDefinition) -> Self {
        self.outputs.push(port);
        self
    }
}

/// Execution context passed to each node call.
///
/// Everything in here is read-only; results travel back through the return value.
#[derive(Clone)]
pub struct NodeContext {
    pub user_id: String,
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub trace_id: String,

    /// The user's encrypted credential set
    pub credentials: Arc<CredentialVault>,

    /// Execution-wide variables supplied by the caller
    pub variables: Arc<crate::JsonMap>,

    /// Event emitter for progress updates
    pub events: EventEmitter,

    /// Cancellation token for the execution this call belongs to
    pub cancellation: CancellationToken,
}

impl NodeContext {
    pub fn credential(&self, credential_type: &str) -> Result<DecryptedCredential, NodeError> {
        Ok(self.credentials.resolve(credential_type)?)
    }

    pub fn credential_for_server(
        &self,
        server_id: &str,
        credential_type: &str,
    ) -> Result<DecryptedCredential, NodeError> {
        Ok(self.credentials.resolve_for_server(server_id, credential_type)?)
    }

    pub fn variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// How a node call ended, handed to [`Node::post_execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl<T> From<&Result<T, NodeError>> for Outcome {
    fn from(result: &Result<T, NodeError>) -> Self {
        match result {
            Ok(_) => Outcome::Succeeded,
            Err(NodeError::Cancelled) => Outcome::Cancelled,
            Err(_) => Outcome::Failed,
        }
    }
}

/// The execution contract every node type implements.
///
/// Tool, API and federated nodes share this one shape; they only differ in
/// where `execute` finds its authorization material.
#[async_trait]
pub trait Node: Send + Sync + 'static {
    type Input: DeserializeOwned + Send;
    type Output: Serialize + Send;

    fn definition(&self) -> NodeDefinition;

    fn validate_input(&self, raw: crate::JsonMap) -> Result<Self::Input, NodeError> {
        serde_json::from_value(serde_json::Value::Object(raw)).map_err(|e| NodeError::Validation {
            field: None,
            message: e.to_string(),
        })
    }

    /// Acquire per-call resources. When this succeeds, `post_execute` is
    /// guaranteed to run, whatever happens to `execute`.
    async fn pre_execute(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        Ok(())
    }

    async fn execute(&self, input: Self::Input, ctx: &NodeContext) -> Result<Self::Output, NodeError>;

    async fn post_execute(&self, _ctx: &NodeContext, _outcome: Outcome) {}

    /// Turn the typed output into the JSON object handed to the engine.
    /// Non-object outputs are wrapped as `{"result": ...}`.
    fn validate_output(&self, output: Self::Output) -> Result<crate::JsonMap, NodeError> {
        match serde_json::to_value(output) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(other) => {
                let mut map = crate::JsonMap::new();
                map.insert("result".to_string(), other);
                Ok(map)
            }
            Err(e) => Err(NodeError::InvalidOutput(e.to_string())),
        }
    }
}

/// Type-erased form of [`Node`] stored in the registry.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn definition(&self) -> NodeDefinition;

    /// Run the full lifecycle: validate input, pre-execute, execute (bounded by
    /// `timeout` and the context's cancellation), post-execute, validate output.
    async fn run(
        &self,
        raw: crate::JsonMap,
        ctx: &NodeContext,
        timeout: Option<Duration>,
    ) -> Result<crate::JsonMap, NodeError>;
}

#[async_trait]
impl<N: Node> NodeExecutor for N {
    fn definition(&self) -> NodeDefinition {
        Node::definition(self)
    }

    async fn run(
        &self,
        raw: crate::JsonMap,
        ctx: &NodeContext,
        timeout: Option<Duration>,
    ) -> Result<crate::JsonMap, NodeError> {
        let input = self.validate_input(raw)?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Cancellation and the deadline bound the pre hook as well as the body.
        let mut acquired = false;
        let work = async {
            match self.pre_execute(ctx).await {
                Ok(()) => {
                    acquired = true;
                    self.execute(input, ctx).await
                }
                Err(err) => Err(err),
            }
        };

        let result = tokio::select! {
            biased;
            _ = ctx.cancellation.cancelled() => Err(NodeError::Cancelled),
            _ = deadline => Err(NodeError::Timeout {
                ms: timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            }),
            result = work => result,
        };

        if acquired {
            self.post_execute(ctx, Outcome::from(&result)).await;
        }
        result.and_then(|output| self.validate_output(output))
    }
}
