//! Core abstractions for the weave execution engine
//!
//! This crate provides the data model, the error taxonomy, the node
//! execution contract, credential handling and the event stream that the
//! gateway, runtime and node crates build on. It performs no scheduling
//! and no network I/O of its own.

mod cipher;
mod credential;
mod error;
pub mod events;
mod node;
mod workflow;

pub use cipher::{CredentialCipher, XChaChaCipher};
pub use credential::{Credential, CredentialVault, DecryptedCredential, SECRET_FIELDS};
pub use error::{
    CheckpointError, CredentialError, NodeError, NodeErrorInfo, NodeFailure, TransportError,
    WeaveError, WorkflowError,
};
pub use events::*;
pub use node::{
    JsonMap, Node, NodeContext, NodeDefinition, NodeExecutor, NodeKind, Outcome, PortDefinition,
};
pub use workflow::{
    EdgeSpec, ErrorHandling, NodeId, NodeSpec, RetryPolicy, WorkflowConfig, WorkflowGraph,
    WorkflowId,
};

/// Result type for weave operations
pub type Result<T> = std::result::Result<T, WeaveError>;
