use super::{SseDecoder, SseEvent, Transport};
use crate::config::{ConnectionParams, ServerConfig, TransportKind};
use crate::injector::InjectionMaterial;
use crate::protocol::{RpcRequest, RpcResponse};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use weavecore::TransportError;

const SESSION_HEADER: &str = "mcp-session-id";

/// Stateless request/response transport. Credentials ride along on every call.
pub struct HttpTransport {
    client: reqwest::Client,
    server_id: String,
    url: String,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    session_id: Mutex<Option<String>>,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(
        client: reqwest::Client,
        server: &ServerConfig,
        material: &InjectionMaterial,
    ) -> Result<Self, TransportError> {
        let ConnectionParams::Http { url, headers } = &server.connection else {
            return Err(TransportError::protocol(format!(
                "server '{}' has no http url",
                server.server_id
            )));
        };
        Ok(Self {
            client,
            server_id: server.server_id.clone(),
            url: url.clone(),
            headers: header_map(headers.iter().chain(material.headers.iter()))?,
            query: material.query.clone(),
            session_id: Mutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    fn post(&self, request: &RpcRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(request);
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        if let Ok(guard) = self.session_id.lock() {
            if let Some(session) = guard.as_deref() {
                builder = builder.header(SESSION_HEADER, session);
            }
        }
        builder
    }

    async fn exchange(&self, request: &RpcRequest, id: &str) -> Result<RpcResponse, TransportError> {
        let response = self.post(request).send().await.map_err(request_error)?;
        check_status(response.status())?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut guard) = self.session_id.lock() {
                *guard = Some(session.to_string());
            }
        }

        let streamed = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        if streamed {
            // The server may hold the stream open after answering.
            let mut decoder = SseDecoder::default();
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(request_error)?;
                if let Some(message) = answer(decoder.feed(&chunk), id) {
                    return Ok(message);
                }
            }
            answer(decoder.finish(), id)
                .ok_or_else(|| TransportError::protocol("event stream ended without a response"))
        } else {
            let body = response.bytes().await.map_err(request_error)?;
            let text = std::str::from_utf8(&body)
                .map_err(|e| TransportError::protocol(format!("response is not utf-8: {e}")))?;
            RpcResponse::parse(text)
        }
    }
}

fn answer(events: impl IntoIterator<Item = SseEvent>, id: &str) -> Option<RpcResponse> {
    events
        .into_iter()
        .filter_map(|event| RpcResponse::parse(&event.data).ok())
        .find(|message| message.is_response() && message.answers(id))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttp
    }

    async fn send(
        &self,
        request: &RpcRequest,
        cancel: &CancellationToken,
    ) -> Result<RpcResponse, TransportError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| TransportError::protocol("request without id"))?;
        tracing::debug!(server_id = %self.server_id, method = %request.method, "POST json-rpc request");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            response = self.exchange(request, &id) => response,
        }
    }

    async fn notify(&self, request: &RpcRequest) -> Result<(), TransportError> {
        let response = self.post(request).send().await.map_err(request_error)?;
        check_status(response.status())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub(super) fn header_map<'a>(
    pairs: impl Iterator<Item = (&'a String, &'a String)>,
) -> Result<HeaderMap, TransportError> {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::protocol(format!("invalid header name '{name}'")))?;
        // The value may be a secret; keep it out of the error text.
        let mut value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::protocol(format!("invalid value for header '{name}'")))?;
        value.set_sensitive(true);
        map.insert(name, value);
    }
    Ok(map)
}

pub(super) fn request_error(err: reqwest::Error) -> TransportError {
    // reqwest errors can embed the URL, and with it any query-string credential.
    let err = err.without_url();
    if err.is_decode() {
        TransportError::protocol(err.to_string())
    } else {
        TransportError::connection(err.to_string())
    }
}

pub(super) fn check_status(status: StatusCode) -> Result<(), TransportError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(TransportError::connection(format!("server responded {status}")))
    } else {
        Err(TransportError::protocol(format!("server responded {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(check_status(StatusCode::OK).is_ok());
        assert!(check_status(StatusCode::BAD_GATEWAY).unwrap_err().is_retryable());
        assert!(check_status(StatusCode::TOO_MANY_REQUESTS).unwrap_err().is_retryable());
        assert!(!check_status(StatusCode::UNAUTHORIZED).unwrap_err().is_retryable());
    }
}
