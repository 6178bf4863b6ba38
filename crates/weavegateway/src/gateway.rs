use crate::config::{GatewayConfig, ServerConfig};
use crate::error::{GatewayError, Result};
use crate::injector::{CredentialInjector, InjectionMaterial};
use crate::pool::{PoolKey, PoolStats, PooledSession, SessionPool};
use crate::protocol::RpcRequest;
use crate::registry::ServerRegistry;
use crate::transport::{Connector, DefaultConnector, Transport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use weavecore::{CredentialVault, DecryptedCredential, TransportError};

/// Routes federated calls through pooled, credential-injected sessions.
pub struct FederatedGateway {
    registry: ServerRegistry,
    injector: CredentialInjector,
    config: GatewayConfig,
    pool: SessionPool,
    connector: Arc<dyn Connector>,
}

impl FederatedGateway {
    pub fn new(registry: ServerRegistry, config: GatewayConfig) -> Self {
        Self {
            registry,
            injector: CredentialInjector::default(),
            pool: SessionPool::new(config.pool.clone()),
            config,
            connector: Arc::new(DefaultConnector::new()),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_injector(mut self, injector: CredentialInjector) -> Self {
        self.injector = injector;
        self
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn injector(&self) -> &CredentialInjector {
        &self.injector
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn server(&self, server_id: &str) -> Result<&ServerConfig> {
        self.registry.get(server_id)
    }

    /// Enabled servers this user can reach with the credentials they hold.
    pub fn list_available(&self, credentials: &CredentialVault) -> Vec<&ServerConfig> {
        self.registry.list_available(&credentials.credential_types())
    }

    /// Check out an initialized session for `(user_id, server_id)`.
    pub async fn connect(
        &self,
        user_id: &str,
        server_id: &str,
        credential: Option<&DecryptedCredential>,
        cancel: &CancellationToken,
    ) -> Result<PooledSession> {
        let server = self.registry.get(server_id)?;
        let material = self.injector.prepare(server, credential)?;
        let key = PoolKey::new(user_id, server_id);

        let mut checkout = self
            .pool
            .acquire(&key, server.max_connections, &material, cancel)
            .await?;

        let transport = match checkout.reused.take() {
            Some(transport) if transport.is_connected() => {
                tracing::debug!(user_id, server_id, "Reusing pooled session");
                transport
            }
            stale => {
                if let Some(stale) = stale {
                    stale.disconnect().await;
                }
                self.open(server, &material, cancel).await?
            }
        };
        Ok(PooledSession::new(key, material, transport, checkout))
    }

    /// Open and initialize a fresh transport, retrying transient failures.
    async fn open(
        &self,
        server: &ServerConfig,
        material: &InjectionMaterial,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn Transport>, TransportError> {
        let policy = &self.config.retry;
        let mut retry = 0;
        loop {
            match self.open_once(server, material, cancel).await {
                Ok(transport) => return Ok(transport),
                Err(e) if e.is_retryable() && retry < policy.max_retries => {
                    tracing::warn!(server_id = %server.server_id, retry, "Connect failed, retrying: {e}");
                    self.backoff(retry, cancel).await?;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn open_once(
        &self,
        server: &ServerConfig,
        material: &InjectionMaterial,
        cancel: &CancellationToken,
    ) -> std::result::Result<Box<dyn Transport>, TransportError> {
        let transport = self.connector.connect(server, material).await?;
        let handshake = async {
            self.call_once(transport.as_ref(), &RpcRequest::initialize(), cancel)
                .await?;
            transport.notify(&RpcRequest::initialized()).await
        };
        match handshake.await {
            Ok(()) => {
                tracing::info!(server_id = %server.server_id, transport = %server.transport, "Federated session initialized");
                Ok(transport)
            }
            Err(e) => {
                transport.disconnect().await;
                Err(e)
            }
        }
    }

    async fn call_once(
        &self,
        transport: &dyn Transport,
        request: &RpcRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<Value, TransportError> {
        let timeout = self.config.call_timeout();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            response = tokio::time::timeout(timeout, transport.send(request, cancel)) => response,
        };
        match response {
            Ok(result) => result?.into_result(),
            Err(_) => Err(TransportError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn backoff(
        &self,
        retry: u32,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        let delay: Duration = self.config.retry.delay_for(retry);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Swap a broken transport for a fresh one carrying the same material.
    async fn reconnect(
        &self,
        session: &mut PooledSession,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), TransportError> {
        if let Some(old) = session.transport.take() {
            old.disconnect().await;
        }
        let server = self
            .registry
            .get(session.server_id())
            .map_err(|e| TransportError::connection(e.to_string()))?;
        tracing::debug!(server_id = %server.server_id, "Reconnecting federated session");
        let transport = self.open_once(server, session.material(), cancel).await?;
        session.transport = Some(transport);
        Ok(())
    }

    /// Send one request with the per-call timeout, retrying retryable
    /// transport errors. Protocol errors are returned on first sight.
    pub async fn send(
        &self,
        session: &mut PooledSession,
        request: RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let policy = &self.config.retry;
        let mut retry = 0;
        let mut current = request;
        loop {
            let attempt = async {
                if !session.is_healthy() {
                    self.reconnect(session, cancel).await?;
                }
                self.call_once(session.transport()?, &current, cancel).await
            };
            match attempt.await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < policy.max_retries => {
                    tracing::warn!(
                        server_id = %session.server_id(),
                        method = %current.method,
                        retry,
                        code = e.code(),
                        "Federated call failed, retrying: {e}"
                    );
                    self.backoff(retry, cancel).await?;
                    retry += 1;
                    current = current.reissue();
                }
                Err(e) => {
                    tracing::debug!(server_id = %session.server_id(), code = e.code(), "Federated call failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    pub async fn call_tool(
        &self,
        session: &mut PooledSession,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.send(session, RpcRequest::call_tool(tool, arguments), cancel)
            .await
    }

    pub async fn list_tools(
        &self,
        session: &mut PooledSession,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let result = self.send(session, RpcRequest::list_tools(), cancel).await?;
        match result.get("tools") {
            Some(Value::Array(tools)) => Ok(tools.clone()),
            _ => Err(GatewayError::Transport(TransportError::protocol(
                "tools/list result has no tools array",
            ))),
        }
    }

    pub fn pool_stats(&self, user_id: &str, server_id: &str) -> Option<PoolStats> {
        self.pool.stats(&PoolKey::new(user_id, server_id))
    }

    pub async fn evict_idle(&self) -> usize {
        self.pool.evict_idle().await
    }

    pub async fn shutdown(&self) {
        self.pool.close_all().await;
    }
}
