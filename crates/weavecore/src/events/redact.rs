use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

/// Values shorter than this are never treated as secrets; replacing them
/// would mangle ordinary words in the payload.
pub const MIN_SECRET_LEN: usize = 6;

/// Scrubs known secret values out of event payloads.
///
/// Any string in the payload containing a secret has every occurrence
/// replaced, so partial embeddings such as `"Bearer <token>"` are caught too.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .filter(|s| s.len() >= MIN_SECRET_LEN)
            .collect();
        // Longest first so a secret that contains another is replaced whole.
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, value: &mut Value) {
        if self.secrets.is_empty() {
            return;
        }
        match value {
            Value::String(s) => self.redact_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.redact(v)),
            Value::Object(map) => {
                let tainted_keys: Vec<String> = map
                    .keys()
                    .filter(|k| self.secrets.iter().any(|s| k.contains(s.as_str())))
                    .cloned()
                    .collect();
                for key in tainted_keys {
                    if let Some(v) = map.remove(&key) {
                        let mut clean = key;
                        self.redact_str(&mut clean);
                        map.insert(clean, v);
                    }
                }
                map.values_mut().for_each(|v| self.redact(v));
            }
            _ => {}
        }
    }

    fn redact_str(&self, s: &mut String) {
        for secret in &self.secrets {
            if s.contains(secret.as_str()) {
                *s = s.replace(secret.as_str(), REDACTED);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn scrubs_nested_values_and_keys() {
        let redactor = Redactor::new(vec!["sk-live-123".to_string(), String::new()]);
        let mut payload = json!({
            "headers": {"Authorization": "Bearer sk-live-123"},
            "list": ["ok", "sk-live-123"],
            "sk-live-123": 1,
            "count": 3
        });
        redactor.redact(&mut payload);

        assert_eq!(
            payload,
            json!({
                "headers": {"Authorization": "Bearer [REDACTED]"},
                "list": ["ok", "[REDACTED]"],
                "[REDACTED]": 1,
                "count": 3
            })
        );
    }

    #[test]
    fn short_values_leave_ordinary_payloads_intact() {
        let redactor = Redactor::new(vec!["xoxb-1".to_string(), "e".to_string()]);
        let mut payload = json!({
            "status": "completed",
            "output": {"message": "hello", "auth": "xoxb-1"}
        });
        redactor.redact(&mut payload);

        assert_eq!(
            payload,
            json!({
                "status": "completed",
                "output": {"message": "hello", "auth": "[REDACTED]"}
            })
        );
    }
}
