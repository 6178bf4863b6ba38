use super::http::{check_status, header_map, request_error};
use super::Transport;
use crate::config::{ConnectionParams, ServerConfig, TransportKind};
use crate::injector::InjectionMaterial;
use crate::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weavecore::{RetryPolicy, TransportError};

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder. Chunks may split events, lines or
/// UTF-8 sequences anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_block(&String::from_utf8_lossy(&block)) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let block = std::mem::take(&mut self.buffer);
        parse_block(&String::from_utf8_lossy(&block))
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut event = SseEvent::default();
    let mut data: Vec<&str> = Vec::new();
    let mut seen = false;
    for line in block.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        seen = true;
        match field {
            "data" => data.push(value),
            "event" => event.event = value.to_string(),
            "id" => event.id = Some(value.to_string()),
            _ => {}
        }
    }
    if !seen {
        return None;
    }
    if event.event.is_empty() {
        event.event = "message".to_string();
    }
    event.data = data.join("\n");
    Some(event)
}

#[derive(Debug, Clone)]
pub struct SseOptions {
    /// How long to wait for the server's `endpoint` announcement before
    /// falling back to POSTing to the stream URL.
    pub endpoint_wait: Duration,
    pub reconnect: RetryPolicy,
    pub subscriber_capacity: usize,
}

impl Default for SseOptions {
    fn default() -> Self {
        Self {
            endpoint_wait: Duration::from_secs(2),
            reconnect: RetryPolicy::new(5, 250)
                .with_multiplier(2.0)
                .with_max_delay_ms(5_000),
            subscriber_capacity: 256,
        }
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<RpcResponse>>>>;

struct StreamShared {
    server_id: String,
    base_url: reqwest::Url,
    pending: Pending,
    endpoint: watch::Sender<Option<reqwest::Url>>,
    pushed: broadcast::Sender<Value>,
    last_event_id: Mutex<Option<String>>,
    gaps: AtomicU64,
    connected: AtomicBool,
}

impl StreamShared {
    fn dispatch(&self, event: SseEvent) {
        if let Some(id) = &event.id {
            if let Ok(mut last) = self.last_event_id.lock() {
                *last = Some(id.clone());
            }
        }
        match event.event.as_str() {
            "endpoint" => match self.base_url.join(event.data.trim()) {
                Ok(url) => {
                    self.endpoint.send_replace(Some(url));
                }
                Err(e) => tracing::warn!(server_id = %self.server_id, "Ignoring bad endpoint event: {e}"),
            },
            _ => {
                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    tracing::debug!(server_id = %self.server_id, "Ignoring non-JSON event");
                    return;
                };
                if let Ok(message) = serde_json::from_value::<RpcResponse>(value.clone()) {
                    if message.is_response() {
                        let key = match &message.id {
                            Some(Value::String(s)) => Some(s.clone()),
                            Some(other) => Some(other.to_string()),
                            None => None,
                        };
                        let waiter = key.and_then(|k| self.pending.lock().ok()?.remove(&k));
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(message);
                        }
                        return;
                    }
                }
                let _ = self.pushed.send(value);
            }
        }
    }

    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            // Dropping the senders wakes every waiter with a closed channel.
            pending.clear();
        }
    }
}

/// Long-lived event-stream transport with automatic reconnection.
pub struct SseTransport {
    client: reqwest::Client,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    shared: Arc<StreamShared>,
    endpoint: watch::Receiver<Option<reqwest::Url>>,
    endpoint_wait: Duration,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(
        client: reqwest::Client,
        server: &ServerConfig,
        material: &InjectionMaterial,
        options: SseOptions,
    ) -> Result<Self, TransportError> {
        let ConnectionParams::Http { url, headers } = &server.connection else {
            return Err(TransportError::protocol(format!(
                "server '{}' has no sse url",
                server.server_id
            )));
        };
        let base_url = reqwest::Url::parse(url)
            .map_err(|e| TransportError::protocol(format!("invalid sse url: {e}")))?;
        let headers = header_map(headers.iter().chain(material.headers.iter()))?;
        let query = material.query.clone();

        let (endpoint_tx, endpoint_rx) = watch::channel(None);
        let (pushed, _) = broadcast::channel(options.subscriber_capacity.max(1));
        let shared = Arc::new(StreamShared {
            server_id: server.server_id.clone(),
            base_url,
            pending: Arc::new(Mutex::new(HashMap::new())),
            endpoint: endpoint_tx,
            pushed,
            last_event_id: Mutex::new(None),
            gaps: AtomicU64::new(0),
            connected: AtomicBool::new(true),
        });

        // The first connection is made here so a dead server fails `connect`.
        let first = open_stream(&client, &shared, &headers, &query, None).await?;
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            client.clone(),
            shared.clone(),
            headers.clone(),
            query.clone(),
            first,
            options.reconnect.clone(),
            shutdown.clone(),
        ));

        Ok(Self {
            client,
            headers,
            query,
            shared,
            endpoint: endpoint_rx,
            endpoint_wait: options.endpoint_wait,
            shutdown,
            reader,
        })
    }

    /// Server-pushed messages that are not responses to our requests.
    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.shared.pushed.subscribe()
    }

    /// Reconnects that could not resume from a last event id.
    pub fn gaps(&self) -> u64 {
        self.shared.gaps.load(Ordering::SeqCst)
    }

    async fn post_url(&self) -> reqwest::Url {
        let mut endpoint = self.endpoint.clone();
        let announced = tokio::time::timeout(self.endpoint_wait, endpoint.wait_for(|e| e.is_some())).await;
        match announced {
            Ok(Ok(url)) => url.clone().unwrap_or_else(|| self.shared.base_url.clone()),
            _ => self.shared.base_url.clone(),
        }
    }

    async fn post(&self, request: &RpcRequest) -> Result<reqwest::Response, TransportError> {
        let mut builder = self
            .client
            .post(self.post_url().await)
            .headers(self.headers.clone())
            .json(request);
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        let response = builder.send().await.map_err(request_error)?;
        check_status(response.status())?;
        Ok(response)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn send(
        &self,
        request: &RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::connection("event stream is closed"));
        }
        let id = request
            .id
            .clone()
            .ok_or_else(|| TransportError::protocol("request without id"))?;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id.clone(), tx);
        }
        let forget = || {
            if let Ok(mut pending) = self.shared.pending.lock() {
                pending.remove(&id);
            }
        };

        let exchange = async {
            let response = self.post(request).await?;
            // Some servers answer inline instead of over the stream.
            let inline = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.starts_with("application/json"));
            if inline {
                let body = response.text().await.map_err(request_error)?;
                if let Ok(message) = RpcResponse::parse(&body) {
                    if message.is_response() && message.answers(&id) {
                        return Ok(message);
                    }
                }
            }
            rx.await
                .map_err(|_| TransportError::connection("event stream dropped before the response arrived"))
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            result = exchange => result,
        };
        forget();
        result
    }

    async fn notify(&self, request: &RpcRequest) -> Result<(), TransportError> {
        self.post(request).await.map(|_| ())
    }

    async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        self.shared.fail_pending();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.reader.abort();
    }
}

async fn open_stream(
    client: &reqwest::Client,
    shared: &StreamShared,
    headers: &HeaderMap,
    query: &[(String, String)],
    last_event_id: Option<&str>,
) -> Result<reqwest::Response, TransportError> {
    let mut builder = client
        .get(shared.base_url.clone())
        .headers(headers.clone())
        .header(ACCEPT, "text/event-stream");
    if !query.is_empty() {
        builder = builder.query(query);
    }
    if let Some(id) = last_event_id {
        builder = builder.header("Last-Event-ID", id);
    }
    let response = builder.send().await.map_err(request_error)?;
    check_status(response.status())?;
    Ok(response)
}

async fn read_loop(
    client: reqwest::Client,
    shared: Arc<StreamShared>,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    first: reqwest::Response,
    reconnect: RetryPolicy,
    shutdown: CancellationToken,
) {
    let mut response = first;
    loop {
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => return,
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => decoder.feed(&bytes).into_iter().for_each(|e| shared.dispatch(e)),
                Some(Err(e)) => {
                    tracing::warn!(server_id = %shared.server_id, "Event stream read failed: {}", request_error(e));
                    break;
                }
                None => break,
            }
        }
        if let Some(event) = decoder.finish() {
            shared.dispatch(event);
        }

        let resume_from = shared.last_event_id.lock().ok().and_then(|id| id.clone());
        if resume_from.is_none() {
            // Nothing to resume from: anything sent while we were away is lost,
            // including responses to in-flight requests.
            let gaps = shared.gaps.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(server_id = %shared.server_id, gaps, "Event stream dropped without resumable id, events may be missed");
            shared.fail_pending();
        }

        let mut reopened = None;
        for retry in 0..reconnect.max_retries {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(reconnect.delay_for(retry)) => {}
            }
            match open_stream(&client, &shared, &headers, &query, resume_from.as_deref()).await {
                Ok(next) => {
                    tracing::debug!(server_id = %shared.server_id, retry, resumed = resume_from.is_some(), "Event stream reconnected");
                    reopened = Some(next);
                    break;
                }
                Err(e) => tracing::warn!(server_id = %shared.server_id, retry, "Event stream reconnect failed: {e}"),
            }
        }
        match reopened {
            Some(next) => response = next,
            None => {
                shared.connected.store(false, Ordering::SeqCst);
                shared.fail_pending();
                return;
            }
        }
    }
}
