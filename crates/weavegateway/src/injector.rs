//! Turns a decrypted credential plus a target transport into call-ready
//! auth material (headers, query params or environment variables).

use crate::config::{ServerConfig, TransportKind};
use crate::error::GatewayError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use weavecore::{CredentialError, DecryptedCredential, JsonMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectionMethod {
    /// `Authorization: Bearer <token>`
    BearerHeader,
    CustomHeader { name: String },
    QueryParam { name: String },
    EnvVar { name: String },
}

impl InjectionMethod {
    fn fits(&self, kind: TransportKind) -> bool {
        match self {
            InjectionMethod::EnvVar { .. } => kind == TransportKind::Stdio,
            _ => kind.is_http(),
        }
    }
}

/// How one credential type is attached, per transport family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialStrategy {
    /// Payload field holding the secret, e.g. `access_token`.
    pub token_field: String,
    pub http: Option<InjectionMethod>,
    pub stdio: Option<InjectionMethod>,
    /// Fields that must be present for the credential to be usable.
    pub required_fields: Vec<String>,
}

impl CredentialStrategy {
    fn bearer(field: &str, env: &str) -> Self {
        Self {
            token_field: field.to_string(),
            http: Some(InjectionMethod::BearerHeader),
            stdio: Some(InjectionMethod::EnvVar { name: env.to_string() }),
            required_fields: vec![field.to_string()],
        }
    }

    fn header(name: &str, field: &str, env: &str) -> Self {
        Self {
            token_field: field.to_string(),
            http: Some(InjectionMethod::CustomHeader { name: name.to_string() }),
            stdio: Some(InjectionMethod::EnvVar { name: env.to_string() }),
            required_fields: vec![field.to_string()],
        }
    }

    fn oauth(env: &str) -> Self {
        let mut strategy = Self::bearer("access_token", env);
        strategy.required_fields.push("refresh_token".to_string());
        strategy
    }

    fn method_for(&self, kind: TransportKind) -> Option<&InjectionMethod> {
        match kind {
            TransportKind::Stdio => self.stdio.as_ref(),
            _ => self.http.as_ref(),
        }
    }
}

/// Auth material for exactly one outbound connection or call.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct InjectionMaterial {
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
}

impl InjectionMaterial {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query.is_empty() && self.env.is_empty()
    }

    pub fn secret_values(&self) -> Vec<String> {
        self.headers
            .values()
            .chain(self.query.iter().map(|(_, v)| v))
            .chain(self.env.values())
            .cloned()
            .collect()
    }
}

impl fmt::Debug for InjectionMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionMaterial")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("query", &self.query.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Strategy table keyed by credential type.
#[derive(Debug, Clone)]
pub struct CredentialInjector {
    strategies: HashMap<String, CredentialStrategy>,
}

impl CredentialInjector {
    /// Build from an explicit table. Each method must fit its transport family.
    pub fn new(strategies: HashMap<String, CredentialStrategy>) -> Result<Self, GatewayError> {
        for (credential_type, strategy) in &strategies {
            if let Some(method) = &strategy.http {
                if !method.fits(TransportKind::StreamableHttp) {
                    return Err(GatewayError::InvalidConfig(format!(
                        "'{credential_type}' uses {method:?} for HTTP transports"
                    )));
                }
            }
            if let Some(method) = &strategy.stdio {
                if !method.fits(TransportKind::Stdio) {
                    return Err(GatewayError::InvalidConfig(format!(
                        "'{credential_type}' uses {method:?} for stdio transports"
                    )));
                }
            }
        }
        Ok(Self { strategies })
    }

    pub fn strategy(&self, credential_type: &str) -> Option<&CredentialStrategy> {
        self.strategies.get(credential_type)
    }

    pub fn supports(&self, credential_type: &str, kind: TransportKind) -> bool {
        self.strategies
            .get(credential_type)
            .and_then(|s| s.method_for(kind))
            .is_some()
    }

    /// Material for connecting to `server`. Servers that need no credential
    /// get empty material.
    pub fn prepare(
        &self,
        server: &ServerConfig,
        credential: Option<&DecryptedCredential>,
    ) -> Result<InjectionMaterial, CredentialError> {
        let Some(required) = server.credential_type.as_deref() else {
            return Ok(InjectionMaterial::default());
        };
        let credential = credential.ok_or_else(|| CredentialError::Missing {
            credential_type: required.to_string(),
        })?;
        self.material_for(credential, server.transport)
    }

    pub fn material_for(
        &self,
        credential: &DecryptedCredential,
        kind: TransportKind,
    ) -> Result<InjectionMaterial, CredentialError> {
        let unsupported = || CredentialError::Unsupported {
            credential_type: credential.credential_type.clone(),
            transport: kind.to_string(),
        };
        let strategy = self
            .strategies
            .get(&credential.credential_type)
            .ok_or_else(unsupported)?;
        let method = strategy.method_for(kind).ok_or_else(unsupported)?;

        let token = credential
            .field(&strategy.token_field)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CredentialError::MissingField {
                credential_type: credential.credential_type.clone(),
                field: strategy.token_field.clone(),
            })?;

        let mut material = InjectionMaterial::default();
        match method {
            InjectionMethod::BearerHeader => {
                material
                    .headers
                    .insert("Authorization".to_string(), format!("Bearer {token}"));
            }
            InjectionMethod::CustomHeader { name } => {
                material.headers.insert(name.clone(), token.to_string());
            }
            InjectionMethod::QueryParam { name } => {
                material.query.push((name.clone(), token.to_string()));
            }
            InjectionMethod::EnvVar { name } => {
                material.env.insert(name.clone(), token.to_string());
            }
        }
        Ok(material)
    }

    /// Fields the payload lacks for its type to be usable. Unknown types need
    /// nothing beyond being present.
    pub fn validate_credential(&self, credential_type: &str, data: &JsonMap) -> Vec<String> {
        let Some(strategy) = self.strategies.get(credential_type) else {
            return Vec::new();
        };
        strategy
            .required_fields
            .iter()
            .filter(|field| {
                !data
                    .get(field.as_str())
                    .and_then(|v| v.as_str())
                    .is_some_and(|v| !v.is_empty())
            })
            .cloned()
            .collect()
    }
}

impl Default for CredentialInjector {
    fn default() -> Self {
        let mut table = HashMap::new();
        table.insert("slack_oauth".to_string(), CredentialStrategy::oauth("SLACK_TOKEN"));
        table.insert("google_oauth".to_string(), CredentialStrategy::oauth("GOOGLE_TOKEN"));
        table.insert("notion_oauth".to_string(), CredentialStrategy::oauth("NOTION_TOKEN"));
        table.insert("github_token".to_string(), CredentialStrategy::bearer("token", "GITHUB_TOKEN"));
        table.insert("notion_token".to_string(), CredentialStrategy::bearer("token", "NOTION_TOKEN"));
        table.insert("openai_api_key".to_string(), CredentialStrategy::bearer("api_key", "OPENAI_API_KEY"));
        table.insert(
            "anthropic_api_key".to_string(),
            CredentialStrategy::header("x-api-key", "api_key", "ANTHROPIC_API_KEY"),
        );
        table.insert(
            "generic_api_key".to_string(),
            CredentialStrategy::header("X-API-Key", "api_key", "MCP_TOKEN"),
        );
        // Query-string auth only makes sense over HTTP.
        table.insert(
            "weather_api_key".to_string(),
            CredentialStrategy {
                token_field: "api_key".to_string(),
                http: Some(InjectionMethod::QueryParam { name: "appid".to_string() }),
                stdio: None,
                required_fields: vec!["api_key".to_string()],
            },
        );
        Self { strategies: table }
    }
}
