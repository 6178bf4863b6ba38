//! Federated gateway: reaches external MCP servers over stdio, streamable
//! HTTP or SSE, with per-user credential injection and pooled sessions.

pub mod config;
pub mod error;
pub mod gateway;
pub mod injector;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use config::{
    ConnectionParams, ExhaustionPolicy, GatewayConfig, PoolConfig, ServerConfig, TransportKind,
};
pub use error::GatewayError;
pub use gateway::FederatedGateway;
pub use injector::{CredentialInjector, CredentialStrategy, InjectionMaterial, InjectionMethod};
pub use pool::{PoolKey, PoolStats, PooledSession};
pub use protocol::{RpcRequest, RpcResponse, PROTOCOL_VERSION};
pub use registry::ServerRegistry;
pub use transport::{Connector, DefaultConnector, Transport};
