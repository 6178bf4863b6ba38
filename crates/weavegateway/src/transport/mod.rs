//! Connection mechanics per transport kind. Every adapter speaks JSON-RPC and
//! reports failures as [`TransportError`] so the gateway can apply one retry
//! policy regardless of how the bytes travel.

mod http;
mod sse;
mod stdio;

pub use http::HttpTransport;
pub use sse::{SseDecoder, SseEvent, SseOptions, SseTransport};
pub use stdio::StdioTransport;

use crate::config::{ServerConfig, TransportKind};
use crate::injector::InjectionMaterial;
use crate::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use weavecore::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Send a request and wait for the response carrying the same id.
    async fn send(
        &self,
        request: &RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse, TransportError>;

    /// Fire-and-forget message without an id.
    async fn notify(&self, request: &RpcRequest) -> Result<(), TransportError>;

    async fn disconnect(&self);

    /// False once the underlying connection is known to be broken.
    fn is_connected(&self) -> bool;
}

/// Opens transports. The gateway only talks to this seam, which lets tests
/// substitute scripted transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &ServerConfig,
        material: &InjectionMaterial,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Picks the adapter matching the server's transport kind.
#[derive(Clone)]
pub struct DefaultConnector {
    client: reqwest::Client,
    sse: SseOptions,
}

impl DefaultConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            sse: SseOptions::default(),
        }
    }

    pub fn with_sse_options(mut self, options: SseOptions) -> Self {
        self.sse = options;
        self
    }
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        server: &ServerConfig,
        material: &InjectionMaterial,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match server.transport {
            TransportKind::Stdio => Ok(Box::new(StdioTransport::spawn(server, material)?)),
            TransportKind::StreamableHttp => Ok(Box::new(HttpTransport::new(
                self.client.clone(),
                server,
                material,
            )?)),
            TransportKind::Sse => Ok(Box::new(
                SseTransport::connect(self.client.clone(), server, material, self.sse.clone()).await?,
            )),
        }
    }
}
