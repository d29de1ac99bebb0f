use crate::errors::GatewayError;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, RwLock};
use tracing::{error, info, warn};

/// Marker substituted for literal secret values in audit text.
pub const REDACTED: &str = "[REDACTED]";

static SECRET_TEMPLATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{secret:([A-Za-z0-9_]+)\}\}").expect("secret template regex"));

/// Secrets loaded from a `.env`-format file.
///
/// Values never cross the boundary: callers can list key names and counts,
/// resolve `{{secret:KEY}}` templates immediately before a tool call, and
/// mask literal values out of audit text. A reload replaces the whole
/// mapping atomically — readers see the old map or the new one, never a mix.
pub struct SecretStore {
    secrets_file: PathBuf,
    secrets: RwLock<HashMap<String, String>>,
}

fn parse_env_file(path: &Path) -> HashMap<String, String> {
    let mut secrets = HashMap::new();
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read secrets file");
            return secrets;
        }
    };

    for (lineno, raw_line) in raw.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!(path = %path.display(), line = lineno + 1, "skipping malformed secrets line");
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        // Strip optional surrounding quotes from the value.
        if value.len() >= 2 {
            let bytes = value.as_bytes();
            if (bytes[0] == b'"' || bytes[0] == b'\'') && bytes[bytes.len() - 1] == bytes[0] {
                value = &value[1..value.len() - 1];
            }
        }
        if !key.is_empty() {
            secrets.insert(key.to_string(), value.to_string());
        }
    }
    secrets
}

impl SecretStore {
    /// Load secrets from `secrets_file`. A missing file is not an error —
    /// the store starts empty and can be populated by a later reload.
    pub fn new(secrets_file: impl Into<PathBuf>) -> Self {
        let secrets_file = secrets_file.into();
        let secrets = if secrets_file.exists() {
            let loaded = parse_env_file(&secrets_file);
            info!(count = loaded.len(), path = %secrets_file.display(), "secrets loaded");
            loaded
        } else {
            warn!(path = %secrets_file.display(), "secrets file not found");
            HashMap::new()
        };
        Self {
            secrets_file,
            secrets: RwLock::new(secrets),
        }
    }

    /// Sorted key names. Values are never returned.
    pub fn list_keys(&self) -> Vec<String> {
        let guard = self.secrets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn count(&self) -> usize {
        self.secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Re-read the secrets file, replacing the mapping wholesale.
    /// Returns the new key count.
    pub fn reload(&self) -> usize {
        let loaded = if self.secrets_file.exists() {
            parse_env_file(&self.secrets_file)
        } else {
            warn!(path = %self.secrets_file.display(), "secrets file not found");
            HashMap::new()
        };
        let count = loaded.len();
        *self
            .secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = loaded;
        info!(count, path = %self.secrets_file.display(), "secrets reloaded");
        count
    }

    /// Resolve every `{{secret:KEY}}` occurrence in a single string.
    pub fn resolve_value(&self, value: &str) -> Result<String, GatewayError> {
        let guard = self.secrets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut missing: Option<String> = None;
        let resolved = SECRET_TEMPLATE_RE.replace_all(value, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match guard.get(key) {
                Some(secret) => secret.clone(),
                None => {
                    if missing.is_none() {
                        missing = Some(key.to_string());
                    }
                    String::new()
                }
            }
        });
        if let Some(key) = missing {
            drop(guard);
            return Err(GatewayError::SecretNotFound {
                key,
                available: self.list_keys(),
            });
        }
        Ok(resolved.into_owned())
    }

    /// Recursively resolve templates in a params tree, returning a deep copy
    /// so the templated original stays available for audit.
    pub fn resolve_params(&self, params: &Value) -> Result<Value, GatewayError> {
        match params {
            Value::String(s) => Ok(Value::String(self.resolve_value(s)?)),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.resolve_params(v)?);
                }
                Ok(Value::Object(out))
            }
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.resolve_params(item)?);
                }
                Ok(Value::Array(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Replace any literal secret value in `text` with [`REDACTED`].
    pub fn mask_text(&self, text: &str) -> String {
        let guard = self.secrets.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut result = text.to_string();
        for secret in guard.values() {
            if !secret.is_empty() && result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), REDACTED);
            }
        }
        result
    }

    /// Deep-copy a params tree with every string leaf masked.
    pub fn mask_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.mask_text(s)),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.mask_value(v)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Fast check whether any string leaf contains a secret template.
    pub fn has_templates(value: &Value) -> bool {
        match value {
            Value::String(s) => SECRET_TEMPLATE_RE.is_match(s),
            Value::Object(map) => map.values().any(Self::has_templates),
            Value::Array(items) => items.iter().any(Self::has_templates),
            _ => false,
        }
    }
}
