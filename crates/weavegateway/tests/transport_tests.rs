use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use weavecore::RetryPolicy;
use weavegateway::transport::{HttpTransport, SseOptions, SseTransport};
use weavegateway::{
    ConnectionParams, InjectionMaterial, RpcRequest, ServerConfig, Transport, TransportKind,
};

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, format!("http://{addr}"))
}

/// Read one HTTP request (head plus content-length body) off the socket.
async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

/// JSON-RPC id of the request body.
fn rpc_id(request: &str) -> Value {
    let body = request.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default();
    let parsed: Value = serde_json::from_str(body).unwrap();
    parsed["id"].clone()
}

fn answer(id: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

async fn reply(socket: &mut TcpStream, status_line: &str, content_type: &str, body: &str) {
    let response = format!(
        "{status_line}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await.unwrap();
    let _ = socket.shutdown().await;
}

/// Response head for a body that stays open until the socket closes.
async fn open_event_stream(socket: &mut TcpStream) {
    socket
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\n\r\n")
        .await
        .unwrap();
}

async fn send_event(socket: &mut TcpStream, event: &str) {
    socket.write_all(event.as_bytes()).await.unwrap();
    socket.flush().await.unwrap();
}

fn server(id: &str, kind: TransportKind, url: String) -> ServerConfig {
    ServerConfig::new(id, kind, ConnectionParams::http(url))
}

fn api_key_material() -> InjectionMaterial {
    InjectionMaterial {
        headers: BTreeMap::from([("X-API-Key".to_string(), "k-123".to_string())]),
        query: vec![("appid".to_string(), "q-456".to_string())],
        ..InjectionMaterial::default()
    }
}

fn sse_options() -> SseOptions {
    SseOptions {
        endpoint_wait: Duration::from_secs(1),
        reconnect: RetryPolicy::new(3, 10),
        ..SseOptions::default()
    }
}

#[tokio::test]
async fn http_inline_answer_with_credentials_on_the_wire() {
    let (listener, base) = listen().await;
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        let body = answer(&rpc_id(&request), json!({"tools": []}));
        reply(&mut socket, "HTTP/1.1 200 OK", "application/json", &body).await;
        request
    });

    let config = server("search", TransportKind::StreamableHttp, format!("{base}/mcp"));
    let transport = HttpTransport::new(reqwest::Client::new(), &config, &api_key_material()).unwrap();
    let response = transport
        .send(&RpcRequest::list_tools(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.result, Some(json!({"tools": []})));

    let request = handle.await.unwrap();
    let head = request.lines().next().unwrap_or_default();
    assert!(head.starts_with("POST /mcp?appid=q-456 "), "request line was {head}");
    assert!(request.to_lowercase().contains("x-api-key: k-123"));
}

#[tokio::test]
async fn http_event_stream_answer_returns_while_the_stream_stays_open() {
    let (listener, base) = listen().await;
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_request(&mut socket).await;
        open_event_stream(&mut socket).await;
        send_event(
            &mut socket,
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
        )
        .await;
        let body = answer(&rpc_id(&request), json!({"content": []}));
        send_event(&mut socket, &format!("data: {body}\n\n")).await;
        // Hold the stream open well past the caller's patience.
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let config = server("stream", TransportKind::StreamableHttp, format!("{base}/mcp"));
    let transport =
        HttpTransport::new(reqwest::Client::new(), &config, &InjectionMaterial::default()).unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        transport.send(&RpcRequest::call_tool("search", json!({})), &CancellationToken::new()),
    )
    .await
    .expect("answer should arrive before the stream closes")
    .unwrap();
    assert_eq!(response.result, Some(json!({"content": []})));
}

#[tokio::test]
async fn sse_posts_to_announced_endpoint_and_resumes_with_last_event_id() {
    let (listener, base) = listen().await;
    let handle = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let opened = read_request(&mut stream).await;
        open_event_stream(&mut stream).await;
        send_event(&mut stream, "event: endpoint\ndata: /messages?session=1\n\n").await;

        let (mut post, _) = listener.accept().await.unwrap();
        let posted = read_request(&mut post).await;
        reply(&mut post, "HTTP/1.1 202 Accepted", "text/plain", "").await;
        let body = answer(&rpc_id(&posted), json!({"tools": [{"name": "search"}]}));
        send_event(&mut stream, &format!("id: 41\ndata: {body}\n\n")).await;
        let _ = stream.shutdown().await;
        drop(stream);

        let (mut reopened, _) = listener.accept().await.unwrap();
        let resumed = read_request(&mut reopened).await;
        open_event_stream(&mut reopened).await;
        (opened, posted, resumed, reopened)
    });

    let config = server("events", TransportKind::Sse, format!("{base}/sse"));
    let material = InjectionMaterial {
        headers: BTreeMap::from([("Authorization".to_string(), "Bearer tok-789".to_string())]),
        ..InjectionMaterial::default()
    };
    let transport = SseTransport::connect(reqwest::Client::new(), &config, &material, sse_options())
        .await
        .unwrap();
    let response = transport
        .send(&RpcRequest::list_tools(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(response.result, Some(json!({"tools": [{"name": "search"}]})));

    let (opened, posted, resumed, _reopened) =
        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    assert!(opened.starts_with("GET /sse "));
    assert!(opened.to_lowercase().contains("authorization: bearer tok-789"));
    assert!(posted.starts_with("POST /messages?session=1 "));
    assert!(posted.to_lowercase().contains("authorization: bearer tok-789"));
    assert!(resumed.starts_with("GET /sse "));
    assert!(resumed.to_lowercase().contains("last-event-id: 41"));
    assert_eq!(transport.gaps(), 0);
    assert!(transport.is_connected());
}

#[tokio::test]
async fn sse_accepts_inline_json_answers() {
    let (listener, base) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        open_event_stream(&mut stream).await;
        send_event(&mut stream, "event: endpoint\ndata: /messages\n\n").await;

        let (mut post, _) = listener.accept().await.unwrap();
        let posted = read_request(&mut post).await;
        let body = answer(&rpc_id(&posted), json!({"inline": true}));
        reply(&mut post, "HTTP/1.1 200 OK", "application/json", &body).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(stream);
    });

    let config = server("inline", TransportKind::Sse, format!("{base}/sse"));
    let transport = SseTransport::connect(
        reqwest::Client::new(),
        &config,
        &InjectionMaterial::default(),
        sse_options(),
    )
    .await
    .unwrap();
    let response = tokio::time::timeout(
        Duration::from_secs(2),
        transport.send(&RpcRequest::list_tools(), &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(response.result, Some(json!({"inline": true})));
}

#[tokio::test]
async fn sse_drop_without_event_id_counts_a_gap_and_fails_pending_calls() {
    let (listener, base) = listen().await;
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_request(&mut stream).await;
        open_event_stream(&mut stream).await;
        send_event(&mut stream, "event: endpoint\ndata: /messages\n\n").await;

        let (mut post, _) = listener.accept().await.unwrap();
        read_request(&mut post).await;
        reply(&mut post, "HTTP/1.1 202 Accepted", "text/plain", "").await;
        // The answer never comes: the stream goes away instead.
        let _ = stream.shutdown().await;
        drop(stream);

        let (mut reopened, _) = listener.accept().await.unwrap();
        read_request(&mut reopened).await;
        open_event_stream(&mut reopened).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(reopened);
    });

    let config = server("lossy", TransportKind::Sse, format!("{base}/sse"));
    let transport = SseTransport::connect(
        reqwest::Client::new(),
        &config,
        &InjectionMaterial::default(),
        sse_options(),
    )
    .await
    .unwrap();
    let err = tokio::time::timeout(
        Duration::from_secs(2),
        transport.send(&RpcRequest::list_tools(), &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(transport.gaps(), 1);
}
