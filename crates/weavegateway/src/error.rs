use thiserror::Error;
use weavecore::{CredentialError, NodeError, TransportError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Unknown federated server '{0}'")]
    UnknownServer(String),

    #[error("Federated server '{0}' is disabled")]
    ServerDisabled(String),

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<GatewayError> for NodeError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::Transport(e) => NodeError::Transport(e),
            GatewayError::Credential(e) => NodeError::Credential(e),
            other => NodeError::Configuration(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
