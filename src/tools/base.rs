use crate::errors::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Context passed to every tool invocation: which protocol carried the call
/// and, when known, who the caller is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationContext {
    pub protocol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Free-form extras (e.g. plan and task ids for plan-driven dispatches).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl InvocationContext {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            client_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
    }
}

/// The capability every executable tool implements.
///
/// A tool receives fully resolved params (secret templates already
/// substituted) and returns a JSON-serialisable result, or one of the typed
/// gateway errors.
#[async_trait]
pub trait Tool: Send + Sync {
    fn category(&self) -> &str;
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the accepted params object.
    fn parameters(&self) -> Value;

    async fn invoke(&self, params: Value, ctx: &InvocationContext)
    -> Result<Value, GatewayError>;

    fn to_schema(&self) -> Value {
        serde_json::json!({
            "category": self.category(),
            "name": self.name(),
            "description": self.description(),
            "parameters": self.parameters(),
        })
    }
}

/// Fetch a required string param or fail with `invalid_parameter`.
pub fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, GatewayError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParameter(format!("Missing '{}' parameter", key)))
}

/// Optional string param, treating `null` as absent.
pub fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}
