//! Secret resolution.
//!
//! A secret is a JSON object stored under a name (an ARN or a friendly name)
//! in a secret store. `SecretResolver` fetches the payload through a
//! [`SecretStore`] backend and decodes it into a flat key/value [`Secret`].
//!
//! Secret values never appear in `Debug` output, error messages or logs;
//! use [`Secret::redacted`] when a view of the payload has to be logged.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ConfigError, Result};

/// Placeholder printed in place of sensitive values.
pub const REDACTED: &str = "********";

const SENSITIVE_KEY_MARKERS: &[&str] = &["password", "secret", "token", "credential", "key"];

/// Returns `true` if a key name looks like it holds a credential.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m))
}

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

/// Backend that returns the raw payload of a named secret.
///
/// Implementations return `SecretNotFound` when the name does not exist and
/// `SecretStoreUnavailable` for transient or permission failures. They must
/// not retry internally; the caller decides.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    name: String,
    values: BTreeMap<String, String>,
}

impl Secret {
    /// Decode a JSON object payload. Scalar values are stringified; nested
    /// objects and arrays are rejected.
    pub fn decode(name: &str, payload: &str) -> Result<Self> {
        let decode_err = |reason: String| ConfigError::SecretDecode {
            name: name.to_string(),
            reason,
        };
        // serde_json errors can quote the offending input; keep only the position.
        let value: serde_json::Value = serde_json::from_str(payload).map_err(|e| {
            decode_err(format!(
                "payload is not valid JSON (line {}, column {})",
                e.line(),
                e.column()
            ))
        })?;
        let object = match value {
            serde_json::Value::Object(map) => map,
            other => {
                return Err(decode_err(format!(
                    "expected a JSON object, got {}",
                    json_type_name(&other)
                )))
            }
        };

        let mut values = BTreeMap::new();
        for (key, value) in object {
            let text = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                serde_json::Value::Null => String::new(),
                other => {
                    return Err(decode_err(format!(
                        "field '{key}' is a nested {}",
                        json_type_name(&other)
                    )))
                }
            };
            values.insert(key, text);
        }
        Ok(Self {
            name: name.to_string(),
            values,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Look up a required field, failing with `SecretDecode` if absent or empty.
    pub fn require(&self, key: &str) -> Result<&str> {
        match self.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(ConfigError::SecretDecode {
                name: self.name.clone(),
                reason: format!("missing required field '{key}'"),
            }),
        }
    }

    pub fn password(&self) -> Result<&str> {
        self.require("password")
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Key/value view with credential-looking values masked.
    pub fn redacted(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| {
                let shown = if is_sensitive_key(k) {
                    REDACTED.to_string()
                } else {
                    v.clone()
                };
                (k.clone(), shown)
            })
            .collect()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("values", &self.redacted())
            .finish()
    }
}

fn json_type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// SecretResolver
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SecretResolver {
    store: Arc<dyn SecretStore>,
}

impl SecretResolver {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Fetch and decode the latest value of `name`.
    pub async fn resolve(&self, name: &str) -> Result<Secret> {
        let payload = self.store.get_secret(name).await?;
        let secret = Secret::decode(name, &payload)?;
        tracing::debug!(secret = %name, keys = ?secret.keys().collect::<Vec<_>>(), "secret resolved");
        Ok(secret)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
