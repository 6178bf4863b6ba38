use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use weavecore::{Node, NodeContext, NodeDefinition, NodeError, NodeKind, PortDefinition};
use weavegateway::{CredentialInjector, InjectionMaterial, TransportKind};

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Deserialize)]
pub struct HttpRequestInput {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Strings are sent as-is, anything else as a JSON body.
    #[serde(default)]
    pub body: Option<Value>,
    /// Attach the caller's credential of this type the way the injector
    /// does for HTTP servers.
    #[serde(default)]
    pub credential_type: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HttpRequestOutput {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON when the body is JSON, otherwise the raw text.
    pub body: Value,
}

/// HTTP request node
pub struct HttpRequestNode {
    client: reqwest::Client,
    injector: CredentialInjector,
}

impl HttpRequestNode {
    pub fn new(injector: CredentialInjector) -> Self {
        Self {
            client: reqwest::Client::new(),
            injector,
        }
    }

    fn material(&self, input: &HttpRequestInput, ctx: &NodeContext) -> Result<InjectionMaterial, NodeError> {
        match input.credential_type.as_deref() {
            Some(credential_type) => {
                let credential = ctx.credential(credential_type)?;
                Ok(self
                    .injector
                    .material_for(&credential, TransportKind::StreamableHttp)?)
            }
            None => Ok(InjectionMaterial::default()),
        }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new(CredentialInjector::default())
    }
}

fn header(name: &str, value: &str, sensitive: bool) -> Result<(HeaderName, HeaderValue), NodeError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| NodeError::Configuration(format!("invalid header name '{name}': {e}")))?;
    let mut value = HeaderValue::from_str(value)
        .map_err(|_| NodeError::Configuration(format!("invalid value for header '{name}'")))?;
    value.set_sensitive(sensitive);
    Ok((name, value))
}

fn request_error(err: reqwest::Error) -> NodeError {
    let err = err.without_url();
    if err.is_builder() {
        NodeError::Configuration(format!("HTTP request is invalid: {err}"))
    } else {
        NodeError::transient("NETWORK_ERROR", format!("HTTP request failed: {err}"))
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    type Input = HttpRequestInput;
    type Output = HttpRequestOutput;

    fn definition(&self) -> NodeDefinition {
        NodeDefinition::new("http.request", NodeKind::Api)
            .describe("http", "Make HTTP requests")
            .input(PortDefinition::required("url", "Target URL"))
            .input(PortDefinition::optional("method", "GET, POST, PUT, PATCH or DELETE"))
            .input(PortDefinition::optional("headers", "Extra request headers"))
            .input(PortDefinition::optional("query", "Query parameters"))
            .input(PortDefinition::optional("body", "Request body"))
            .input(PortDefinition::optional("credential_type", "Credential to attach"))
            .output(PortDefinition::required("status", "HTTP status code"))
            .output(PortDefinition::required("headers", "Response headers"))
            .output(PortDefinition::required("body", "Response body"))
    }

    async fn execute(&self, input: HttpRequestInput, ctx: &NodeContext) -> Result<HttpRequestOutput, NodeError> {
        let method = reqwest::Method::from_bytes(input.method.to_uppercase().as_bytes())
            .map_err(|_| NodeError::Configuration(format!("Unsupported method: {}", input.method)))?;
        let material = self.material(&input, ctx)?;

        ctx.events.info(format!("{} {}", method, input.url));

        let mut request = self
            .client
            .request(method, &input.url)
            .query(&input.query)
            .query(&material.query);
        for (name, value) in &input.headers {
            let (name, value) = header(name, value, false)?;
            request = request.header(name, value);
        }
        for (name, value) in &material.headers {
            let (name, value) = header(name, value, true)?;
            request = request.header(name, value);
        }
        request = match input.body {
            Some(Value::String(text)) => request.body(text),
            Some(json) => request.json(&json),
            None => request,
        };

        let response = request.send().await.map_err(request_error)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let text = response.text().await.map_err(request_error)?;

        ctx.events.info(format!("Response status: {}", status.as_u16()));

        if !status.is_success() {
            let code = format!("HTTP_{}", status.as_u16());
            let message = format!("{} responded {}: {}", input.url, status, text.chars().take(200).collect::<String>());
            return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                NodeError::transient(code, message)
            } else {
                NodeError::failed(code, message)
            });
        }

        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(HttpRequestOutput {
            status: status.as_u16(),
            headers,
            body,
        })
    }
}
