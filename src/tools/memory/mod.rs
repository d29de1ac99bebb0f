use crate::errors::GatewayError;
use crate::memory::{KnowledgeGraph, RelationSpec, SearchMode};
use crate::tools::base::{InvocationContext, Tool, optional_str, require_str};
use crate::tools::registry::ToolRegistry;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

const DEFAULT_MAX_RESULTS: usize = 10;
const DEFAULT_MAX_DEPTH: u32 = 10;

/// The knowledge graph operations exposed through the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryOp {
    Store,
    Get,
    Search,
    Update,
    Delete,
    Link,
    Children,
    Ancestors,
    Roots,
    Related,
    Subtree,
    Stats,
}

impl MemoryOp {
    pub const ALL: &'static [MemoryOp] = &[
        Self::Store,
        Self::Get,
        Self::Search,
        Self::Update,
        Self::Delete,
        Self::Link,
        Self::Children,
        Self::Ancestors,
        Self::Roots,
        Self::Related,
        Self::Subtree,
        Self::Stats,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Get => "get",
            Self::Search => "search",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Link => "link",
            Self::Children => "children",
            Self::Ancestors => "ancestors",
            Self::Roots => "roots",
            Self::Related => "related",
            Self::Subtree => "subtree",
            Self::Stats => "stats",
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Store => "Store a knowledge node, optionally linking it to existing nodes.",
            Self::Get => "Fetch a node by id with its incident relationships.",
            Self::Search => "Search the knowledge graph by full text, tags, or both.",
            Self::Update => "Patch a node's content, name, tags, or metadata.",
            Self::Delete => "Delete a node and its edges, reporting orphaned children.",
            Self::Link => "Create or update a typed edge between two nodes.",
            Self::Children => "Immediate children of a node via parent_of edges.",
            Self::Ancestors => "All ancestors of a node via parent_of edges, depth-bounded.",
            Self::Roots => "Nodes with no incoming parent_of edge.",
            Self::Related => "Neighbours of a node, optionally filtered by relation.",
            Self::Subtree => "All descendants of a node via parent_of edges, depth-bounded.",
            Self::Stats => "Aggregate statistics over the knowledge graph.",
        }
    }

    fn parameters(self) -> Value {
        match self {
            Self::Store => json!({
                "type": "object",
                "properties": {
                    "content": {"type": "string"},
                    "name": {"type": "string"},
                    "entity_type": {"type": "string", "default": "note"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "metadata": {"type": "object"},
                    "source": {"type": "string"},
                    "relations": {"type": "array", "items": {
                        "type": "object",
                        "properties": {
                            "target_id": {"type": "string"},
                            "relation": {"type": "string"},
                            "weight": {"type": "number", "default": 1.0}
                        },
                        "required": ["target_id", "relation"]
                    }}
                },
                "required": ["content"]
            }),
            Self::Get => json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "include_relations": {"type": "boolean", "default": true}
                },
                "required": ["id"]
            }),
            Self::Search => json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "search_mode": {"type": "string", "enum": ["fulltext", "tags", "hybrid"], "default": "hybrid"},
                    "entity_type": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "max_results": {"type": "integer", "default": DEFAULT_MAX_RESULTS},
                    "temporal_filter": {"type": "string", "description": "Only nodes created at or before this timestamp"}
                },
                "required": ["query"]
            }),
            Self::Update => json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "content": {"type": "string"},
                    "name": {"type": "string"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "metadata": {"type": "object"}
                },
                "required": ["id"]
            }),
            Self::Delete => json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "cascade": {"type": "boolean", "default": false}
                },
                "required": ["id"]
            }),
            Self::Link => json!({
                "type": "object",
                "properties": {
                    "source_id": {"type": "string"},
                    "target_id": {"type": "string"},
                    "relation": {"type": "string", "default": "related_to"},
                    "weight": {"type": "number", "default": 1.0},
                    "bidirectional": {"type": "boolean", "default": false},
                    "metadata": {"type": "object"},
                    "valid_from": {"type": "string"},
                    "valid_until": {"type": "string"}
                },
                "required": ["source_id", "target_id"]
            }),
            Self::Children | Self::Related => json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "relation": {"type": "string"}
                },
                "required": ["id"]
            }),
            Self::Ancestors | Self::Subtree => json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "max_depth": {"type": "integer", "default": DEFAULT_MAX_DEPTH}
                },
                "required": ["id"]
            }),
            Self::Roots | Self::Stats => json!({"type": "object", "properties": {}}),
        }
    }
}

fn to_value<T: Serialize>(response: &T) -> Result<Value, GatewayError> {
    serde_json::to_value(response)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serialize response: {}", e)))
}

fn string_vec(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// One registry entry per knowledge graph operation, all delegating to the
/// shared engine.
pub struct MemoryTool {
    graph: Arc<KnowledgeGraph>,
    op: MemoryOp,
}

impl MemoryTool {
    pub fn new(graph: Arc<KnowledgeGraph>, op: MemoryOp) -> Self {
        Self { graph, op }
    }

    /// Register every memory operation on `registry`.
    pub fn register_all(registry: &mut ToolRegistry, graph: &Arc<KnowledgeGraph>) {
        for op in MemoryOp::ALL {
            registry.register(Arc::new(Self::new(Arc::clone(graph), *op)));
        }
    }
}

#[async_trait]
impl Tool for MemoryTool {
    fn category(&self) -> &str {
        "memory"
    }

    fn name(&self) -> &str {
        self.op.name()
    }

    fn description(&self) -> &str {
        self.op.description()
    }

    fn parameters(&self) -> Value {
        self.op.parameters()
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        match self.op {
            MemoryOp::Store => {
                let content = require_str(&params, "content")?;
                let relations: Vec<RelationSpec> = match params.get("relations") {
                    Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
                        GatewayError::InvalidParameter(format!("Invalid relations: {}", e))
                    })?,
                    None => Vec::new(),
                };
                let response = self.graph.store(
                    content,
                    optional_str(&params, "name"),
                    optional_str(&params, "entity_type").unwrap_or("note"),
                    &string_vec(&params, "tags"),
                    params.get("metadata").unwrap_or(&json!({})),
                    optional_str(&params, "source"),
                    &relations,
                )?;
                to_value(&response)
            }
            MemoryOp::Get => {
                let id = require_str(&params, "id")?;
                let include_relations = params
                    .get("include_relations")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                to_value(&self.graph.get(id, include_relations)?)
            }
            MemoryOp::Search => {
                let query = require_str(&params, "query")?;
                let mode: SearchMode = match optional_str(&params, "search_mode") {
                    Some(raw) => serde_json::from_value(Value::String(raw.to_string()))
                        .map_err(|_| {
                            GatewayError::InvalidParameter(format!(
                                "Invalid search_mode '{}'. Must be one of: fulltext, tags, hybrid",
                                raw
                            ))
                        })?,
                    None => SearchMode::Hybrid,
                };
                let max_results = params
                    .get("max_results")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_MAX_RESULTS, |n| n as usize);
                let response = self.graph.search(
                    query,
                    mode,
                    optional_str(&params, "entity_type"),
                    &string_vec(&params, "tags"),
                    max_results,
                    optional_str(&params, "temporal_filter"),
                )?;
                to_value(&response)
            }
            MemoryOp::Update => {
                let id = require_str(&params, "id")?;
                let tags = params.get("tags").and_then(Value::as_array).map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<String>>()
                });
                let response = self.graph.update(
                    id,
                    optional_str(&params, "content"),
                    optional_str(&params, "name"),
                    tags.as_deref(),
                    params.get("metadata"),
                )?;
                to_value(&response)
            }
            MemoryOp::Delete => {
                let id = require_str(&params, "id")?;
                let cascade = params
                    .get("cascade")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                to_value(&self.graph.delete(id, cascade)?)
            }
            MemoryOp::Link => {
                let source_id = require_str(&params, "source_id")?;
                let target_id = require_str(&params, "target_id")?;
                let weight = params
                    .get("weight")
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0);
                let bidirectional = params
                    .get("bidirectional")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let response = self.graph.link(
                    source_id,
                    target_id,
                    optional_str(&params, "relation").unwrap_or("related_to"),
                    weight,
                    bidirectional,
                    params.get("metadata"),
                    optional_str(&params, "valid_from"),
                    optional_str(&params, "valid_until"),
                )?;
                to_value(&response)
            }
            MemoryOp::Children => {
                to_value(&self.graph.children(require_str(&params, "id")?)?)
            }
            MemoryOp::Ancestors => {
                let id = require_str(&params, "id")?;
                let max_depth = params
                    .get("max_depth")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_MAX_DEPTH, |n| n as u32);
                to_value(&self.graph.ancestors(id, max_depth)?)
            }
            MemoryOp::Roots => to_value(&self.graph.roots()?),
            MemoryOp::Related => {
                let id = require_str(&params, "id")?;
                to_value(&self.graph.related(id, optional_str(&params, "relation"))?)
            }
            MemoryOp::Subtree => {
                let id = require_str(&params, "id")?;
                let max_depth = params
                    .get("max_depth")
                    .and_then(Value::as_u64)
                    .map_or(DEFAULT_MAX_DEPTH, |n| n as u32);
                to_value(&self.graph.subtree(id, max_depth)?)
            }
            MemoryOp::Stats => to_value(&self.graph.stats()?),
        }
    }
}

#[cfg(test)]
mod tests;
