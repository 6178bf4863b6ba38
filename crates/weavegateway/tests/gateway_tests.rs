use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use weavecore::{CredentialError, DecryptedCredential, RetryPolicy, TransportError};
use weavegateway::{
    ConnectionParams, Connector, FederatedGateway, GatewayConfig, GatewayError, InjectionMaterial,
    RpcRequest, RpcResponse, ServerConfig, ServerRegistry, Transport, TransportKind,
};

/// Scripted outcomes for `tools/call`, shared by every transport the connector opens.
#[derive(Default)]
struct Script {
    outcomes: Mutex<VecDeque<Result<Value, TransportError>>>,
    calls: AtomicUsize,
    connects: AtomicUsize,
    last_material: Mutex<Option<InjectionMaterial>>,
}

struct ScriptedTransport {
    script: Arc<Script>,
    connected: AtomicBool,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn send(
        &self,
        request: &RpcRequest,
        _cancel: &CancellationToken,
    ) -> Result<RpcResponse, TransportError> {
        let result = if request.method == "initialize" {
            Ok(json!({"protocolVersion": "2024-11-05"}))
        } else {
            self.script.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({"content": []})))
        };
        match result {
            Ok(value) => Ok(RpcResponse {
                jsonrpc: "2.0".into(),
                id: request.id.clone().map(Value::String),
                result: Some(value),
                error: None,
            }),
            Err(e) => {
                if matches!(e, TransportError::Connection { .. }) {
                    self.connected.store(false, Ordering::SeqCst);
                }
                Err(e)
            }
        }
    }

    async fn notify(&self, _request: &RpcRequest) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct ScriptedConnector(Arc<Script>);

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        _server: &ServerConfig,
        material: &InjectionMaterial,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        *self.0.last_material.lock().unwrap() = Some(material.clone());
        Ok(Box::new(ScriptedTransport {
            script: self.0.clone(),
            connected: AtomicBool::new(true),
        }))
    }
}

fn gateway(script: Arc<Script>) -> FederatedGateway {
    let registry = ServerRegistry::new(vec![
        ServerConfig::new(
            "search",
            TransportKind::StreamableHttp,
            ConnectionParams::http("https://search.example.com/mcp"),
        )
        .with_credential("generic_api_key"),
        ServerConfig::new(
            "clock",
            TransportKind::StreamableHttp,
            ConnectionParams::http("https://clock.example.com/mcp"),
        ),
    ])
    .unwrap();
    let config = GatewayConfig {
        retry: RetryPolicy::new(3, 1).with_multiplier(2.0),
        ..GatewayConfig::default()
    };
    FederatedGateway::new(registry, config).with_connector(Arc::new(ScriptedConnector(script)))
}

fn api_key(value: &str) -> DecryptedCredential {
    DecryptedCredential::new(
        "generic_api_key",
        json!({"api_key": value}).as_object().cloned().unwrap(),
    )
}

#[tokio::test]
async fn retries_connection_errors_and_reconnects() {
    let script = Arc::new(Script::default());
    script.outcomes.lock().unwrap().extend([
        Err(TransportError::connection("reset")),
        Err(TransportError::connection("reset")),
        Ok(json!({"content": [{"type": "text", "text": "hi"}]})),
    ]);
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();

    let mut session = gw
        .connect("alice", "search", Some(&api_key("k-1")), &cancel)
        .await
        .unwrap();
    let result = gw
        .call_tool(&mut session, "search", json!({"q": "rust"}), &cancel)
        .await
        .unwrap();

    assert_eq!(result["content"][0]["text"], "hi");
    assert_eq!(script.calls.load(Ordering::SeqCst), 3);
    assert_eq!(script.connects.load(Ordering::SeqCst), 3);
    let material = script.last_material.lock().unwrap().clone().unwrap();
    assert_eq!(material.headers.get("X-API-Key").map(String::as_str), Some("k-1"));
}

#[tokio::test]
async fn protocol_errors_are_not_retried() {
    let script = Arc::new(Script::default());
    script
        .outcomes
        .lock()
        .unwrap()
        .push_back(Err(TransportError::protocol("bad frame")));
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();

    let mut session = gw.connect("alice", "clock", None, &cancel).await.unwrap();
    let err = gw
        .call_tool(&mut session, "now", json!({}), &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Transport(TransportError::Protocol { .. })));
    assert_eq!(script.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gives_up_after_configured_retries() {
    let script = Arc::new(Script::default());
    script
        .outcomes
        .lock()
        .unwrap()
        .extend((0..10).map(|_| Err(TransportError::Timeout { ms: 5 })));
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();

    let mut session = gw.connect("alice", "clock", None, &cancel).await.unwrap();
    let err = gw
        .call_tool(&mut session, "now", json!({}), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(script.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn healthy_sessions_are_reused() {
    let script = Arc::new(Script::default());
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();

    let session = gw.connect("alice", "clock", None, &cancel).await.unwrap();
    drop(session);
    assert_eq!(gw.pool_stats("alice", "clock").unwrap().idle, 1);

    let _again = gw.connect("alice", "clock", None, &cancel).await.unwrap();
    assert_eq!(script.connects.load(Ordering::SeqCst), 1);

    // A different user never shares the session.
    let _bob = gw.connect("bob", "clock", None, &cancel).await.unwrap();
    assert_eq!(script.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn missing_credentials_fail_before_connecting() {
    let script = Arc::new(Script::default());
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();

    let err = gw.connect("alice", "search", None, &cancel).await.err().unwrap();
    assert!(matches!(
        err,
        GatewayError::Credential(CredentialError::Missing { .. })
    ));
    assert_eq!(script.connects.load(Ordering::SeqCst), 0);

    let err = gw.connect("alice", "nowhere", None, &cancel).await.err().unwrap();
    assert_eq!(err, GatewayError::UnknownServer("nowhere".into()));
}

#[tokio::test]
async fn cancelled_calls_return_promptly() {
    let script = Arc::new(Script::default());
    let gw = gateway(script.clone());
    let cancel = CancellationToken::new();
    let mut session = gw.connect("alice", "clock", None, &cancel).await.unwrap();

    cancel.cancel();
    let err = gw
        .call_tool(&mut session, "now", json!({}), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Transport(TransportError::Cancelled));
}
