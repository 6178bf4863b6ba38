use crate::events::ExecutionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeaveError {
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Node {node_id} failed (execution {execution_id}, trace {trace_id}): {source}")]
    Node {
        execution_id: ExecutionId,
        node_id: String,
        trace_id: String,
        #[source]
        source: NodeError,
    },

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structural problems with a workflow graph. Always raised before any node runs.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Cyclic dependency detected between nodes: {}", nodes.join(", "))]
    CyclicDependency { nodes: Vec<String> },

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge {source_id} -> {target_id} references unknown node '{missing}'")]
    DanglingEdge {
        source_id: String,
        target_id: String,
        missing: String,
    },

    #[error("Unknown node type '{node_type}'")]
    UnknownNodeType { node_type: String },

    #[error("Node type '{0}' is already registered")]
    DuplicateNodeType(String),

    #[error("Workflow {id} version {version} is not newer than registered version {current}")]
    VersionConflict { id: String, version: u32, current: u32 },
}

/// Failure of a single node call.
#[derive(Error, Debug, Clone)]
pub enum NodeError {
    #[error("Invalid input{}: {message}", field.as_deref().map(|f| format!(" '{f}'")).unwrap_or_default())]
    Validation {
        field: Option<String>,
        message: String,
    },

    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("[{code}] {message}")]
    Execution {
        code: String,
        message: String,
        retryable: bool,
    },

    #[error("Timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<NodeError> },
}

impl NodeError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// A permanent failure reported by the node itself.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// A failure that a retry policy is allowed to absorb.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Execution { retryable, .. } => *retryable,
            NodeError::Timeout { .. } => true,
            NodeError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            NodeError::Validation { .. } => "VALIDATION_ERROR",
            NodeError::InvalidOutput(_) => "OUTPUT_ERROR",
            NodeError::Configuration(_) => "CONFIGURATION_ERROR",
            NodeError::Execution { code, .. } => code,
            NodeError::Timeout { .. } => "TIMEOUT",
            NodeError::Cancelled => "CANCELLED",
            NodeError::Credential(e) => e.code(),
            NodeError::Transport(e) => e.code(),
            NodeError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
        }
    }

    pub fn info(&self) -> NodeErrorInfo {
        NodeErrorInfo {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

/// Failures of the transport layer between the gateway and a federated server.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("Connection pool for server '{server_id}' exhausted (limit {limit})")]
    PoolExhausted { server_id: String, limit: usize },

    #[error("Call cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Connection { .. }
                | TransportError::Timeout { .. }
                | TransportError::PoolExhausted { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Spawn { .. } => "SPAWN_ERROR",
            TransportError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            TransportError::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CredentialError {
    #[error("No credential of type '{credential_type}' available")]
    Missing { credential_type: String },

    #[error("Credential type '{credential_type}' is not supported for transport '{transport}'")]
    Unsupported {
        credential_type: String,
        transport: String,
    },

    #[error("Credential of type '{credential_type}' is missing field '{field}'")]
    MissingField {
        credential_type: String,
        field: String,
    },

    #[error("Failed to decrypt credential: {0}")]
    Decryption(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Malformed credential payload: {0}")]
    Malformed(String),
}

impl CredentialError {
    pub fn code(&self) -> &'static str {
        match self {
            CredentialError::Missing { .. } => "MISSING_CREDENTIAL",
            CredentialError::Unsupported { .. } => "UNSUPPORTED_CREDENTIAL_TYPE",
            CredentialError::MissingField { .. } => "MISSING_CREDENTIAL_FIELD",
            CredentialError::Decryption(_) => "DECRYPTION_ERROR",
            CredentialError::Encryption(_) => "ENCRYPTION_ERROR",
            CredentialError::Malformed(_) => "MALFORMED_CREDENTIAL",
        }
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No checkpoint found for execution {0}")]
    NotFound(ExecutionId),

    #[error("Corrupt checkpoint log: {0}")]
    Corrupt(String),
}

/// Serializable summary of a node error, stored in node state and checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeErrorInfo {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// A node error together with the coordinates every surfaced error carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub execution_id: ExecutionId,
    pub node_id: String,
    pub trace_id: String,
    pub error: NodeErrorInfo,
}
