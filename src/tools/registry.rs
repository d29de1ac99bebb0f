use crate::errors::GatewayError;
use crate::tools::base::Tool;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Maps `(category, name)` to a tool implementation. Populated once at
/// startup; its content is the catalog both protocols expose.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<(String, String), Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let key = (tool.category().to_string(), tool.name().to_string());
        if key.0.is_empty() || key.1.is_empty() {
            warn!("tool registry: rejecting tool with empty category or name");
            return;
        }
        if self.tools.contains_key(&key) {
            warn!(
                "tool registry: overwriting duplicate tool '{}_{}'",
                key.0, key.1
            );
        }
        self.tools.insert(key, tool);
    }

    pub fn get(&self, category: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(&(category.to_string(), name.to_string()))
            .cloned()
    }

    pub fn lookup(&self, category: &str, name: &str) -> Result<Arc<dyn Tool>, GatewayError> {
        self.get(category, name).ok_or_else(|| {
            GatewayError::not_found(format!("Tool '{}_{}' not found", category, name))
        })
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted `(category, name)` pairs of every registered tool.
    pub fn tool_names(&self) -> Vec<(String, String)> {
        let mut names: Vec<(String, String)> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// The full catalog as JSON schemas, sorted by category then name.
    pub fn catalog(&self) -> Vec<Value> {
        let mut entries: Vec<(&(String, String), &Arc<dyn Tool>)> = self.tools.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, tool)| tool.to_schema()).collect()
    }
}
