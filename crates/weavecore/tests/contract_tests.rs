use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weavecore::{
    Credential, CredentialCipher, CredentialVault, EventStream, JsonMap, Node, NodeContext,
    NodeDefinition, NodeError, NodeExecutor, NodeKind, Outcome, Redactor, XChaChaCipher,
};

#[derive(Default)]
struct Hooks {
    acquired: Mutex<u32>,
    released: Mutex<Vec<Outcome>>,
}

#[derive(Deserialize)]
struct GuardedInput {
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    fail: bool,
}

/// Holds a "resource" between pre and post execute.
struct Guarded(Arc<Hooks>);

#[async_trait]
impl Node for Guarded {
    type Input = GuardedInput;
    type Output = Value;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("test.guarded", NodeKind::Tool)
    }

    async fn pre_execute(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        *self.0.acquired.lock().unwrap() += 1;
        Ok(())
    }

    async fn execute(&self, input: GuardedInput, _ctx: &NodeContext) -> Result<Value, NodeError> {
        tokio::time::sleep(Duration::from_millis(input.sleep_ms)).await;
        if input.fail {
            return Err(NodeError::failed("BOOM", "asked to fail"));
        }
        Ok(json!("done"))
    }

    async fn post_execute(&self, _ctx: &NodeContext, outcome: Outcome) {
        self.0.released.lock().unwrap().push(outcome);
    }
}

/// Its pre hook waits on capacity that never frees up.
struct Starved(Arc<Hooks>);

#[async_trait]
impl Node for Starved {
    type Input = Value;
    type Output = Value;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("test.starved", NodeKind::Tool)
    }

    async fn pre_execute(&self, _ctx: &NodeContext) -> Result<(), NodeError> {
        std::future::pending::<()>().await;
        *self.0.acquired.lock().unwrap() += 1;
        Ok(())
    }

    async fn execute(&self, _input: Value, _ctx: &NodeContext) -> Result<Value, NodeError> {
        Ok(json!("unreachable"))
    }

    async fn post_execute(&self, _ctx: &NodeContext, outcome: Outcome) {
        self.0.released.lock().unwrap().push(outcome);
    }
}

fn context(stream: &EventStream, vault: CredentialVault) -> NodeContext {
    let publisher = stream.publisher(
        Uuid::new_v4(),
        "trace-7",
        Redactor::new(vault.secret_values()),
    );
    NodeContext {
        user_id: vault.user_id().to_string(),
        execution_id: publisher.execution_id(),
        node_id: "guarded".into(),
        trace_id: publisher.trace_id().to_string(),
        credentials: Arc::new(vault),
        variables: Arc::new(JsonMap::new()),
        events: publisher.emitter("guarded"),
        cancellation: CancellationToken::new(),
    }
}

fn input(value: Value) -> JsonMap {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn hooks_release_on_every_exit_path() {
    let hooks = Arc::new(Hooks::default());
    let node = Guarded(hooks.clone());
    let stream = EventStream::new(16);

    let ctx = context(&stream, CredentialVault::empty("u"));
    let output = node.run(input(json!({})), &ctx, None).await.unwrap();
    assert_eq!(output, input(json!({"result": "done"})));

    let err = node.run(input(json!({"fail": true})), &ctx, None).await.unwrap_err();
    assert_eq!(err.code(), "BOOM");

    let err = node
        .run(input(json!({"sleep_ms": 5_000})), &ctx, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");
    assert!(err.is_retryable());

    let cancelled = context(&stream, CredentialVault::empty("u"));
    let token = cancelled.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = node
        .run(input(json!({"sleep_ms": 5_000})), &cancelled, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CANCELLED");

    assert_eq!(*hooks.acquired.lock().unwrap(), 4);
    assert_eq!(
        *hooks.released.lock().unwrap(),
        vec![Outcome::Succeeded, Outcome::Failed, Outcome::Failed, Outcome::Cancelled]
    );
}

#[tokio::test]
async fn blocked_pre_hook_honours_timeout_and_cancellation() {
    let hooks = Arc::new(Hooks::default());
    let node = Starved(hooks.clone());
    let stream = EventStream::new(16);

    let ctx = context(&stream, CredentialVault::empty("u"));
    let err = node
        .run(JsonMap::new(), &ctx, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TIMEOUT");

    let cancelled = context(&stream, CredentialVault::empty("u"));
    let token = cancelled.cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });
    let err = node.run(JsonMap::new(), &cancelled, None).await.unwrap_err();
    assert_eq!(err.code(), "CANCELLED");

    assert_eq!(*hooks.acquired.lock().unwrap(), 0);
    assert!(hooks.released.lock().unwrap().is_empty());
}

#[tokio::test]
async fn invalid_input_never_acquires() {
    let hooks = Arc::new(Hooks::default());
    let node = Guarded(hooks.clone());
    let stream = EventStream::new(16);
    let ctx = context(&stream, CredentialVault::empty("u"));

    let err = node
        .run(input(json!({"sleep_ms": "soon"})), &ctx, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(!err.is_retryable());
    assert_eq!(*hooks.acquired.lock().unwrap(), 0);
    assert!(hooks.released.lock().unwrap().is_empty());
}

#[tokio::test]
async fn node_events_are_redacted_on_the_wire() {
    let cipher = Arc::new(XChaChaCipher::from_base64(&XChaChaCipher::generate_key()).unwrap());
    let record = Credential {
        id: "c1".into(),
        user_id: "alice".into(),
        credential_type: "github_token".into(),
        encrypted_payload: cipher.encrypt(br#"{"token":"ghp_live_123"}"#).unwrap(),
        mcp_server_id: None,
    };
    let vault = CredentialVault::new("alice", vec![record], cipher);

    let stream = EventStream::new(16);
    let mut events = stream.subscribe();
    let ctx = context(&stream, vault);
    let token = ctx.credential("github_token").unwrap();
    ctx.events.info(format!("Authorization: Bearer {}", token.field("token").unwrap()));

    let event = events.recv().await.unwrap();
    let wire = serde_json::to_value(&event).unwrap();
    assert_eq!(wire["type"], json!("update"));
    assert_eq!(wire["node_id"], json!("guarded"));
    assert_eq!(wire["trace_id"], json!("trace-7"));
    assert_eq!(wire["sequence"], json!(0));
    assert_eq!(wire["data"]["message"], json!("Authorization: Bearer [REDACTED]"));
    assert!(!wire.to_string().contains("ghp_live_123"));
}

#[test]
fn retries_exhausted_is_final() {
    let err = NodeError::RetriesExhausted {
        attempts: 3,
        last: Box::new(NodeError::transient("FLAKY", "try again")),
    };
    let info = err.info();
    assert_eq!(info.code, "RETRIES_EXHAUSTED");
    assert!(!info.retryable);
    assert!(info.message.contains("try again"));
}
