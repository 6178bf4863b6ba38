use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weavecore::{DecryptedCredential, RetryPolicy, TransportError};
use weavegateway::{
    ConnectionParams, DefaultConnector, FederatedGateway, GatewayConfig, GatewayError,
    ServerConfig, ServerRegistry, TransportKind,
};

// Extracts the string id of a request line; empty for notifications.
const EXTRACT_ID: &str = r#"id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')"#;

fn sh_server(id: &str, body: &str) -> ServerConfig {
    let script = format!(
        "while IFS= read -r line; do\n  {EXTRACT_ID}\n  [ -z \"$id\" ] && continue\n{body}\ndone"
    );
    ServerConfig::new(
        id,
        TransportKind::Stdio,
        ConnectionParams::stdio("sh", vec!["-c".into(), script]),
    )
}

fn gateway(servers: Vec<ServerConfig>) -> FederatedGateway {
    let config = GatewayConfig {
        retry: RetryPolicy::new(3, 5),
        ..GatewayConfig::default()
    };
    FederatedGateway::new(ServerRegistry::new(servers).unwrap(), config)
        .with_connector(Arc::new(DefaultConnector::new()))
}

#[tokio::test]
async fn calls_tools_over_a_child_process() {
    let echo = sh_server(
        "echo",
        r#"  printf '{"jsonrpc":"2.0","id":"%s","result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id""#,
    );
    let gw = gateway(vec![echo]);
    let cancel = CancellationToken::new();

    let mut session = gw.connect("alice", "echo", None, &cancel).await.unwrap();
    let result = gw
        .call_tool(&mut session, "ping", json!({}), &cancel)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "pong");
    session.close().await;
}

#[tokio::test]
async fn injects_credentials_as_environment() {
    let env_echo = sh_server(
        "secure",
        r#"  printf '{"jsonrpc":"2.0","id":"%s","result":{"token":"%s"}}\n' "$id" "$MCP_TOKEN""#,
    )
    .with_credential("generic_api_key");
    let gw = gateway(vec![env_echo]);
    let cancel = CancellationToken::new();
    let credential = DecryptedCredential::new(
        "generic_api_key",
        json!({"api_key": "stdio-secret"}).as_object().cloned().unwrap(),
    );

    let mut session = gw
        .connect("alice", "secure", Some(&credential), &cancel)
        .await
        .unwrap();
    let result = gw
        .call_tool(&mut session, "whoami", json!({}), &cancel)
        .await
        .unwrap();
    assert_eq!(result["token"], "stdio-secret");
}

#[tokio::test]
async fn process_exit_mid_call_is_a_retryable_connection_error() {
    // Answers the handshake, then exits on the first tool call.
    let flaky = sh_server(
        "flaky",
        r#"  n=$((${n:-0}+1))
  [ "$n" -gt 1 ] && exit 0
  printf '{"jsonrpc":"2.0","id":"%s","result":{}}\n' "$id""#,
    );
    let gw = gateway(vec![flaky]);
    let cancel = CancellationToken::new();

    let mut session = gw.connect("alice", "flaky", None, &cancel).await.unwrap();
    let err = gw
        .call_tool(&mut session, "anything", json!({}), &cancel)
        .await
        .unwrap_err();

    match err {
        GatewayError::Transport(e @ TransportError::Connection { .. }) => assert!(e.is_retryable()),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!session.is_healthy());
}

#[tokio::test]
async fn missing_commands_fail_to_spawn() {
    let server = ServerConfig::new(
        "ghost",
        TransportKind::Stdio,
        ConnectionParams::stdio("definitely-not-a-real-binary-weave", vec![]),
    );
    let gw = gateway(vec![server]);
    let err = gw
        .connect("alice", "ghost", None, &CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(
        err,
        GatewayError::Transport(TransportError::Spawn { .. })
    ));
}
