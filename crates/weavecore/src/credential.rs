use crate::{CredentialCipher, CredentialError, JsonMap};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stored credential record. The payload is opaque to everything except the cipher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub user_id: String,
    pub credential_type: String,
    #[serde(rename = "encrypted_data", alias = "encrypted_payload")]
    pub encrypted_payload: String,
    #[serde(default)]
    pub mcp_server_id: Option<String>,
}

/// A credential after decryption. Lives only for the duration of a call.
#[derive(Clone)]
pub struct DecryptedCredential {
    pub credential_type: String,
    data: JsonMap,
}

impl DecryptedCredential {
    pub fn new(credential_type: impl Into<String>, data: JsonMap) -> Self {
        Self {
            credential_type: credential_type.into(),
            data,
        }
    }

    /// String value of a payload field, e.g. `access_token`.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(|v| v.as_str())
    }

    pub fn data(&self) -> &JsonMap {
        &self.data
    }

    /// String values of the payload's secret fields. Descriptive fields
    /// such as `token_type` or `scope` are left out.
    pub fn secret_values(&self) -> Vec<String> {
        let mut out = Vec::new();
        for name in SECRET_FIELDS {
            if let Some(value) = self.data.get(*name) {
                collect_strings(value, &mut out);
            }
        }
        out
    }
}

/// Payload fields that carry secret material for any supported credential type.
pub const SECRET_FIELDS: &[&str] = &[
    "access_token",
    "refresh_token",
    "token",
    "api_key",
    "client_secret",
    "password",
];

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

impl fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedCredential")
            .field("credential_type", &self.credential_type)
            .field("fields", &self.data.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The credential set one user brings to an execution.
///
/// Holds only encrypted records; decryption happens on demand through the
/// injected cipher, so nothing in the vault is plaintext at rest.
#[derive(Clone)]
pub struct CredentialVault {
    user_id: String,
    credentials: Vec<Credential>,
    cipher: Option<Arc<dyn CredentialCipher>>,
}

impl CredentialVault {
    pub fn new(
        user_id: impl Into<String>,
        credentials: Vec<Credential>,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        let user_id = user_id.into();
        // Records belonging to someone else are never usable by this user.
        let credentials = credentials
            .into_iter()
            .filter(|c| c.user_id == user_id)
            .collect();
        Self {
            user_id,
            credentials,
            cipher: Some(cipher),
        }
    }

    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credentials: Vec::new(),
            cipher: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn credential_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self
            .credentials
            .iter()
            .map(|c| c.credential_type.as_str())
            .collect();
        types.sort_unstable();
        types.dedup();
        types
    }

    pub fn has(&self, credential_type: &str) -> bool {
        self.credentials
            .iter()
            .any(|c| c.credential_type == credential_type)
    }

    /// Decrypt the first credential of the given type.
    pub fn resolve(&self, credential_type: &str) -> Result<DecryptedCredential, CredentialError> {
        let record = self
            .credentials
            .iter()
            .find(|c| c.credential_type == credential_type)
            .ok_or_else(|| CredentialError::Missing {
                credential_type: credential_type.to_string(),
            })?;
        self.decrypt(record)
    }

    /// Like [`resolve`](Self::resolve), preferring a record bound to `server_id`.
    pub fn resolve_for_server(
        &self,
        server_id: &str,
        credential_type: &str,
    ) -> Result<DecryptedCredential, CredentialError> {
        let bound = self.credentials.iter().find(|c| {
            c.credential_type == credential_type && c.mcp_server_id.as_deref() == Some(server_id)
        });
        match bound {
            Some(record) => self.decrypt(record),
            None => self.resolve(credential_type),
        }
    }

    /// Secret field values of every decryptable credential, used to seed event redaction.
    pub fn secret_values(&self) -> Vec<String> {
        self.credentials
            .iter()
            .filter_map(|record| self.decrypt(record).ok())
            .flat_map(|c| c.secret_values())
            .collect()
    }

    fn decrypt(&self, record: &Credential) -> Result<DecryptedCredential, CredentialError> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| CredentialError::Decryption("no cipher configured".to_string()))?;
        let plaintext = cipher.decrypt(&record.encrypted_payload)?;
        let data: JsonMap = serde_json::from_slice(&plaintext)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        Ok(DecryptedCredential::new(record.credential_type.clone(), data))
    }
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault")
            .field("user_id", &self.user_id)
            .field("credential_types", &self.credential_types())
            .finish()
    }
}
