use crate::audit::now_iso;
use crate::db::Database;
use crate::errors::GatewayError;
use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Default name length taken from content when no name is supplied.
const NAME_FROM_CONTENT_CHARS: usize = 60;
/// Neighbour content preview length in relation listings.
const PREVIEW_CHARS: usize = 120;

static NON_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\s]").expect("fts token regex"));

#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeNode {
    pub id: String,
    pub name: String,
    pub content: String,
    pub entity_type: String,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub source: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NeighborSummary {
    pub id: String,
    pub name: String,
    pub entity_type: String,
    pub content_preview: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EdgeRelation {
    pub edge_id: String,
    pub direction: String,
    pub relation: String,
    pub weight: f64,
    pub neighbor: NeighborSummary,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationSpec {
    pub target_id: String,
    pub relation: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreResponse {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub relations_created: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    pub node: KnowledgeNode,
    pub relations: Vec<EdgeRelation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Fulltext,
    Tags,
    Hybrid,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub node: KnowledgeNode,
    pub relevance_score: f64,
    pub matched_field: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total_matches: usize,
    pub search_time_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateResponse {
    pub id: String,
    pub name: String,
    pub updated_at: String,
    pub previous_content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub deleted_node: NodeRef,
    pub deleted_edges: i64,
    pub orphaned_children: Vec<NodeRef>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkResponse {
    pub edge_id: String,
    pub source_id: String,
    pub target_id: String,
    pub relation: String,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodesResponse {
    pub nodes: Vec<KnowledgeNode>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectedNode {
    pub id: String,
    pub name: String,
    pub edge_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub total_nodes: i64,
    pub total_edges: i64,
    pub nodes_by_type: HashMap<String, i64>,
    pub edges_by_relation: HashMap<String, i64>,
    pub most_connected_nodes: Vec<ConnectedNode>,
    pub orphaned_nodes: i64,
    pub created_last_24h: i64,
    pub tags_frequency: HashMap<String, i64>,
}

fn parse_json_field(raw: &str, default: Value) -> Value {
    serde_json::from_str(raw).unwrap_or(default)
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeNode> {
    let tags_raw: String = row.get("tags")?;
    let metadata_raw: String = row.get("metadata")?;
    let tags = serde_json::from_str::<Vec<String>>(&tags_raw).unwrap_or_default();
    Ok(KnowledgeNode {
        id: row.get("id")?,
        name: row.get("name")?,
        content: row.get("content")?,
        entity_type: row.get("entity_type")?,
        tags,
        metadata: parse_json_field(&metadata_raw, Value::Object(serde_json::Map::new())),
        source: row.get("source")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Sanitise a free-form query into an FTS5 expression: strip everything that
/// is not a word character, AND-join the remaining tokens. Quoting the whole
/// query would force phrase search, which fails for multi-word queries whose
/// words are not consecutive.
fn fts_expression(query: &str) -> String {
    let cleaned = NON_WORD_RE.replace_all(query, " ");
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    if tokens.is_empty() {
        query.trim().to_string()
    } else {
        tokens.join(" ")
    }
}

/// Graph-based knowledge store: typed nodes and edges over SQLite with an
/// FTS5 index kept consistent by triggers.
pub struct KnowledgeGraph {
    db: Arc<Database>,
}

impl KnowledgeGraph {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        {
            let conn = db.conn()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS memory_nodes (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    entity_type TEXT NOT NULL DEFAULT 'note',
                    tags TEXT NOT NULL DEFAULT '[]',
                    metadata TEXT NOT NULL DEFAULT '{}',
                    source TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS memory_edges (
                    id TEXT PRIMARY KEY,
                    source_id TEXT NOT NULL REFERENCES memory_nodes(id) ON DELETE CASCADE,
                    target_id TEXT NOT NULL REFERENCES memory_nodes(id) ON DELETE CASCADE,
                    relation TEXT NOT NULL,
                    weight REAL NOT NULL DEFAULT 1.0,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    valid_from TEXT,
                    valid_until TEXT,
                    UNIQUE(source_id, target_id, relation)
                );
                CREATE INDEX IF NOT EXISTS idx_edges_source ON memory_edges(source_id);
                CREATE INDEX IF NOT EXISTS idx_edges_target ON memory_edges(target_id);
                CREATE INDEX IF NOT EXISTS idx_edges_relation ON memory_edges(relation);
                CREATE VIRTUAL TABLE IF NOT EXISTS memory_nodes_fts USING fts5(
                    name, content, tags,
                    content='memory_nodes',
                    content_rowid='rowid'
                );
                CREATE TRIGGER IF NOT EXISTS memory_nodes_ai AFTER INSERT ON memory_nodes BEGIN
                    INSERT INTO memory_nodes_fts(rowid, name, content, tags)
                    VALUES (new.rowid, new.name, new.content, new.tags);
                END;
                CREATE TRIGGER IF NOT EXISTS memory_nodes_ad AFTER DELETE ON memory_nodes BEGIN
                    INSERT INTO memory_nodes_fts(memory_nodes_fts, rowid, name, content, tags)
                    VALUES ('delete', old.rowid, old.name, old.content, old.tags);
                END;
                CREATE TRIGGER IF NOT EXISTS memory_nodes_au AFTER UPDATE ON memory_nodes BEGIN
                    INSERT INTO memory_nodes_fts(memory_nodes_fts, rowid, name, content, tags)
                    VALUES ('delete', old.rowid, old.name, old.content, old.tags);
                    INSERT INTO memory_nodes_fts(rowid, name, content, tags)
                    VALUES (new.rowid, new.name, new.content, new.tags);
                END;",
            )?;
        }
        Ok(Self { db })
    }

    fn assert_exists(conn: &Connection, node_id: &str) -> Result<(), GatewayError> {
        let found: Option<String> = conn
            .query_row(
                "SELECT id FROM memory_nodes WHERE id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(anyhow::Error::from(other)),
            })
            .map_err(GatewayError::Internal)?;
        if found.is_none() {
            return Err(GatewayError::not_found_with_suggestion(
                format!("Node '{}' not found", node_id),
                "memory_search",
            ));
        }
        Ok(())
    }

    /// Store a new node, optionally creating edges to existing nodes in the
    /// same transaction. Fails without side effects if any relation target
    /// is missing.
    #[allow(clippy::too_many_arguments)]
    pub fn store(
        &self,
        content: &str,
        name: Option<&str>,
        entity_type: &str,
        tags: &[String],
        metadata: &Value,
        source: Option<&str>,
        relations: &[RelationSpec],
    ) -> Result<StoreResponse, GatewayError> {
        let node_id = Uuid::new_v4().to_string();
        let now = now_iso();
        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => truncate_chars(content, NAME_FROM_CONTENT_CHARS),
        };

        let mut conn = self.db.conn().map_err(GatewayError::Internal)?;
        let tx = conn
            .transaction()
            .map_err(|e| GatewayError::Internal(e.into()))?;

        for rel in relations {
            Self::assert_exists(&tx, &rel.target_id)?;
        }

        tx.execute(
            "INSERT INTO memory_nodes
                (id, name, content, entity_type, tags, metadata, source, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                node_id,
                name,
                content,
                entity_type,
                serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string()),
                metadata.to_string(),
                source,
                now,
                now,
            ],
        )
        .map_err(|e| GatewayError::Internal(e.into()))?;

        let mut relations_created = 0;
        for rel in relations {
            tx.execute(
                "INSERT INTO memory_edges
                    (id, source_id, target_id, relation, weight, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, '{}', ?6)
                 ON CONFLICT(source_id, target_id, relation) DO UPDATE
                    SET weight = excluded.weight",
                params![
                    Uuid::new_v4().to_string(),
                    node_id,
                    rel.target_id,
                    rel.relation,
                    rel.weight,
                    now,
                ],
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
            relations_created += 1;
        }

        tx.commit().map_err(|e| GatewayError::Internal(e.into()))?;
        info!(node_id = %node_id, entity_type, "memory store");

        Ok(StoreResponse {
            id: node_id,
            name,
            created_at: now,
            relations_created,
        })
    }

    /// Fetch a node, optionally with every incident edge and a neighbour
    /// summary per edge.
    pub fn get(&self, node_id: &str, include_relations: bool) -> Result<GetResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let node = conn
            .query_row(
                "SELECT * FROM memory_nodes WHERE id = ?1",
                params![node_id],
                row_to_node,
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Err(GatewayError::not_found_with_suggestion(
                    format!("Node '{}' not found", node_id),
                    "memory_search",
                )),
                other => Err(GatewayError::Internal(other.into())),
            })?;

        let mut relations = Vec::new();
        if include_relations {
            for (sql, direction) in [
                (
                    "SELECT e.id, e.relation, e.weight, n.id, n.name, n.entity_type,
                            SUBSTR(n.content, 1, ?2)
                     FROM memory_edges e
                     JOIN memory_nodes n ON n.id = e.target_id
                     WHERE e.source_id = ?1",
                    "outgoing",
                ),
                (
                    "SELECT e.id, e.relation, e.weight, n.id, n.name, n.entity_type,
                            SUBSTR(n.content, 1, ?2)
                     FROM memory_edges e
                     JOIN memory_nodes n ON n.id = e.source_id
                     WHERE e.target_id = ?1",
                    "incoming",
                ),
            ] {
                let mut stmt = conn.prepare(sql).map_err(|e| GatewayError::Internal(e.into()))?;
                let rows = stmt
                    .query_map(params![node_id, PREVIEW_CHARS as i64], |row| {
                        Ok(EdgeRelation {
                            edge_id: row.get(0)?,
                            direction: direction.to_string(),
                            relation: row.get(1)?,
                            weight: row.get(2)?,
                            neighbor: NeighborSummary {
                                id: row.get(3)?,
                                name: row.get(4)?,
                                entity_type: row.get(5)?,
                                content_preview: row.get(6)?,
                            },
                        })
                    })
                    .map_err(|e| GatewayError::Internal(e.into()))?;
                for row in rows {
                    relations.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
                }
            }
        }

        Ok(GetResponse { node, relations })
    }

    /// Search the graph by full text, tags, or both.
    pub fn search(
        &self,
        query: &str,
        mode: SearchMode,
        entity_type: Option<&str>,
        tags: &[String],
        max_results: usize,
        temporal_filter: Option<&str>,
    ) -> Result<SearchResponse, GatewayError> {
        let started = std::time::Instant::now();
        let mut results: Vec<SearchResult> = Vec::new();

        if matches!(mode, SearchMode::Fulltext | SearchMode::Hybrid) {
            results = self
                .fulltext_branch(query, entity_type, tags, max_results, temporal_filter)
                .map_err(GatewayError::Internal)?;
        }

        let tags_branch_wanted = mode == SearchMode::Tags
            || (mode == SearchMode::Hybrid && results.is_empty() && !tags.is_empty());
        if tags_branch_wanted && !tags.is_empty() {
            let existing: Vec<String> = results.iter().map(|r| r.node.id.clone()).collect();
            let tag_results = self
                .tags_branch(entity_type, tags, max_results, temporal_filter)
                .map_err(GatewayError::Internal)?;
            for result in tag_results {
                if !existing.contains(&result.node.id) {
                    results.push(result);
                }
            }
        }

        results.truncate(max_results);
        let total_matches = results.len();
        Ok(SearchResponse {
            results,
            total_matches,
            search_time_ms: started.elapsed().as_millis() as i64,
        })
    }

    fn fulltext_branch(
        &self,
        query: &str,
        entity_type: Option<&str>,
        tags: &[String],
        max_results: usize,
        temporal_filter: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let expression = fts_expression(query);
        if expression.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT n.*, -bm25(memory_nodes_fts) AS score
             FROM memory_nodes_fts
             JOIN memory_nodes n ON memory_nodes_fts.rowid = n.rowid
             WHERE memory_nodes_fts MATCH ?",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(expression)];

        if let Some(entity_type) = entity_type {
            sql.push_str(" AND n.entity_type = ?");
            args.push(Box::new(entity_type.to_string()));
        }
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(n.tags) WHERE value = ?)");
            args.push(Box::new(tag.clone()));
        }
        if let Some(cutoff) = temporal_filter {
            sql.push_str(" AND n.created_at <= ?");
            args.push(Box::new(cutoff.to_string()));
        }
        sql.push_str(" ORDER BY score DESC LIMIT ?");
        args.push(Box::new(max_results as i64));

        let conn = self.db.conn()?;
        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                // An FTS5 syntax error must degrade to "no results", not fail
                // the whole search.
                warn!(error = %e, "fts query preparation failed");
                return Ok(Vec::new());
            }
        };
        let mapped = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                let node = row_to_node(row)?;
                let score: f64 = row.get("score")?;
                Ok(SearchResult {
                    node,
                    relevance_score: score,
                    matched_field: "content".to_string(),
                })
            },
        );
        let rows = match mapped {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "fts query failed");
                return Ok(Vec::new());
            }
        };

        let mut results = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for row in rows {
            match row {
                Ok(result) => {
                    if seen.insert(result.node.id.clone()) {
                        results.push(result);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "fts row failed");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(results)
    }

    fn tags_branch(
        &self,
        entity_type: Option<&str>,
        tags: &[String],
        max_results: usize,
        temporal_filter: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        let mut sql = String::from("SELECT DISTINCT n.* FROM memory_nodes n WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        for tag in tags {
            sql.push_str(" AND EXISTS (SELECT 1 FROM json_each(n.tags) WHERE value = ?)");
            args.push(Box::new(tag.clone()));
        }
        if let Some(entity_type) = entity_type {
            sql.push_str(" AND n.entity_type = ?");
            args.push(Box::new(entity_type.to_string()));
        }
        if let Some(cutoff) = temporal_filter {
            sql.push_str(" AND n.created_at <= ?");
            args.push(Box::new(cutoff.to_string()));
        }
        sql.push_str(" LIMIT ?");
        args.push(Box::new(max_results as i64));

        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                let node = row_to_node(row)?;
                Ok(SearchResult {
                    node,
                    relevance_score: 1.0,
                    matched_field: "tags".to_string(),
                })
            },
        )?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    /// Patch a node. `content`, `name` and `tags` replace wholesale;
    /// `metadata` merges key by key. Returns the previous content for audit.
    pub fn update(
        &self,
        node_id: &str,
        content: Option<&str>,
        name: Option<&str>,
        tags: Option<&[String]>,
        metadata: Option<&Value>,
    ) -> Result<UpdateResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let existing = conn
            .query_row(
                "SELECT * FROM memory_nodes WHERE id = ?1",
                params![node_id],
                row_to_node,
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Err(GatewayError::not_found_with_suggestion(
                    format!("Node '{}' not found", node_id),
                    "memory_search",
                )),
                other => Err(GatewayError::Internal(other.into())),
            })?;

        let now = now_iso();
        let new_content = content.unwrap_or(&existing.content);
        let new_name = name.unwrap_or(&existing.name);
        let new_tags = match tags {
            Some(tags) => serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string()),
            None => serde_json::to_string(&existing.tags).unwrap_or_else(|_| "[]".to_string()),
        };
        let new_metadata = match metadata {
            Some(Value::Object(patch)) => {
                let mut merged = match &existing.metadata {
                    Value::Object(map) => map.clone(),
                    _ => serde_json::Map::new(),
                };
                for (k, v) in patch {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged).to_string()
            }
            Some(other) => other.to_string(),
            None => existing.metadata.to_string(),
        };

        conn.execute(
            "UPDATE memory_nodes
             SET content = ?1, name = ?2, tags = ?3, metadata = ?4, updated_at = ?5
             WHERE id = ?6",
            params![new_content, new_name, new_tags, new_metadata, now, node_id],
        )
        .map_err(|e| GatewayError::Internal(e.into()))?;
        info!(node_id, "memory update");

        Ok(UpdateResponse {
            id: node_id.to_string(),
            name: new_name.to_string(),
            updated_at: now,
            previous_content: existing.content,
        })
    }

    /// Delete a node; incident edges cascade. Reports children orphaned by
    /// the removal (nodes whose only `parent_of` source was this node); with
    /// `cascade` those orphans are deleted too.
    pub fn delete(&self, node_id: &str, cascade: bool) -> Result<DeleteResponse, GatewayError> {
        let mut conn = self.db.conn().map_err(GatewayError::Internal)?;
        let tx = conn
            .transaction()
            .map_err(|e| GatewayError::Internal(e.into()))?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, name FROM memory_nodes WHERE id = ?1",
                params![node_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(GatewayError::Internal(other.into())),
            })?;
        let Some((id, name)) = existing else {
            return Err(GatewayError::not_found_with_suggestion(
                format!("Node '{}' not found", node_id),
                "memory_search",
            ));
        };

        let deleted_edges: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM memory_edges WHERE source_id = ?1 OR target_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;

        let mut orphaned_children = Vec::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT n.id, n.name FROM memory_nodes n
                     WHERE EXISTS (
                        SELECT 1 FROM memory_edges e
                        WHERE e.source_id = ?1 AND e.target_id = n.id AND e.relation = 'parent_of'
                     )
                     AND NOT EXISTS (
                        SELECT 1 FROM memory_edges e2
                        WHERE e2.source_id != ?1 AND e2.target_id = n.id AND e2.relation = 'parent_of'
                     )",
                )
                .map_err(|e| GatewayError::Internal(e.into()))?;
            let rows = stmt
                .query_map(params![node_id], |row| {
                    Ok(NodeRef {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                })
                .map_err(|e| GatewayError::Internal(e.into()))?;
            for row in rows {
                orphaned_children.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
            }
        }

        if cascade {
            for child in &orphaned_children {
                tx.execute("DELETE FROM memory_nodes WHERE id = ?1", params![child.id])
                    .map_err(|e| GatewayError::Internal(e.into()))?;
            }
        }

        tx.execute("DELETE FROM memory_nodes WHERE id = ?1", params![node_id])
            .map_err(|e| GatewayError::Internal(e.into()))?;
        tx.commit().map_err(|e| GatewayError::Internal(e.into()))?;
        info!(node_id, cascade, "memory delete");

        Ok(DeleteResponse {
            deleted_node: NodeRef { id, name },
            deleted_edges,
            orphaned_children: if cascade { Vec::new() } else { orphaned_children },
        })
    }

    /// Create or update an edge by `(source, target, relation)`; optionally
    /// mirror it. Returns whether the forward edge was newly created.
    #[allow(clippy::too_many_arguments)]
    pub fn link(
        &self,
        source_id: &str,
        target_id: &str,
        relation: &str,
        weight: f64,
        bidirectional: bool,
        metadata: Option<&Value>,
        valid_from: Option<&str>,
        valid_until: Option<&str>,
    ) -> Result<LinkResponse, GatewayError> {
        let mut conn = self.db.conn().map_err(GatewayError::Internal)?;
        let tx = conn
            .transaction()
            .map_err(|e| GatewayError::Internal(e.into()))?;

        Self::assert_exists(&tx, source_id)?;
        Self::assert_exists(&tx, target_id)?;

        let now = now_iso();
        let metadata_json = metadata
            .map_or_else(|| "{}".to_string(), std::string::ToString::to_string);

        let existing_id: Option<String> = tx
            .query_row(
                "SELECT id FROM memory_edges
                 WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3",
                params![source_id, target_id, relation],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(GatewayError::Internal(other.into())),
            })?;
        let created = existing_id.is_none();
        let edge_id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let upsert = "INSERT INTO memory_edges
                (id, source_id, target_id, relation, weight, metadata, created_at, valid_from, valid_until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(source_id, target_id, relation) DO UPDATE
                SET weight = excluded.weight,
                    metadata = excluded.metadata,
                    valid_from = excluded.valid_from,
                    valid_until = excluded.valid_until";
        tx.execute(
            upsert,
            params![
                edge_id,
                source_id,
                target_id,
                relation,
                weight,
                metadata_json,
                now,
                valid_from,
                valid_until,
            ],
        )
        .map_err(|e| GatewayError::Internal(e.into()))?;

        if bidirectional {
            let reverse_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM memory_edges
                     WHERE source_id = ?1 AND target_id = ?2 AND relation = ?3",
                    params![target_id, source_id, relation],
                    |row| row.get(0),
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(GatewayError::Internal(other.into())),
                })?;
            tx.execute(
                upsert,
                params![
                    reverse_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                    target_id,
                    source_id,
                    relation,
                    weight,
                    metadata_json,
                    now,
                    valid_from,
                    valid_until,
                ],
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
        }

        tx.commit().map_err(|e| GatewayError::Internal(e.into()))?;
        info!(source = source_id, target = target_id, relation, "memory link");

        Ok(LinkResponse {
            edge_id,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relation: relation.to_string(),
            created,
        })
    }

    /// Immediate `parent_of` children, ordered by creation time.
    pub fn children(&self, node_id: &str) -> Result<NodesResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        Self::assert_exists(&conn, node_id)?;
        self.collect_nodes(
            &conn,
            "SELECT n.* FROM memory_nodes n
             JOIN memory_edges e ON e.target_id = n.id
             WHERE e.source_id = ?1 AND e.relation = 'parent_of'
             ORDER BY n.created_at, n.rowid",
            params![node_id],
        )
    }

    /// All ancestors reachable via `parent_of`, bounded by `max_depth`.
    pub fn ancestors(&self, node_id: &str, max_depth: u32) -> Result<NodesResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        Self::assert_exists(&conn, node_id)?;
        self.collect_nodes(
            &conn,
            "WITH RECURSIVE ancestors(id, depth) AS (
                SELECT e.source_id, 1
                FROM memory_edges e
                WHERE e.target_id = ?1 AND e.relation = 'parent_of'
                UNION
                SELECT e.source_id, a.depth + 1
                FROM memory_edges e
                JOIN ancestors a ON e.target_id = a.id
                WHERE e.relation = 'parent_of' AND a.depth < ?2
             )
             SELECT DISTINCT n.* FROM memory_nodes n
             JOIN ancestors a ON n.id = a.id
             ORDER BY n.created_at, n.rowid",
            params![node_id, i64::from(max_depth)],
        )
    }

    /// Nodes with no incoming `parent_of` edge.
    pub fn roots(&self) -> Result<NodesResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        self.collect_nodes(
            &conn,
            "SELECT n.* FROM memory_nodes n
             WHERE NOT EXISTS (
                SELECT 1 FROM memory_edges e
                WHERE e.target_id = n.id AND e.relation = 'parent_of'
             )
             ORDER BY n.created_at, n.rowid",
            params![],
        )
    }

    /// Neighbours in either direction, optionally filtered to one relation.
    pub fn related(
        &self,
        node_id: &str,
        relation: Option<&str>,
    ) -> Result<NodesResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        Self::assert_exists(&conn, node_id)?;
        match relation {
            Some(relation) => self.collect_nodes(
                &conn,
                "SELECT DISTINCT n.* FROM memory_nodes n
                 WHERE n.id IN (
                    SELECT target_id FROM memory_edges WHERE source_id = ?1 AND relation = ?2
                    UNION
                    SELECT source_id FROM memory_edges WHERE target_id = ?1 AND relation = ?2
                 )
                 ORDER BY n.name",
                params![node_id, relation],
            ),
            None => self.collect_nodes(
                &conn,
                "SELECT DISTINCT n.* FROM memory_nodes n
                 WHERE n.id IN (
                    SELECT target_id FROM memory_edges WHERE source_id = ?1
                    UNION
                    SELECT source_id FROM memory_edges WHERE target_id = ?1
                 )
                 ORDER BY n.name",
                params![node_id],
            ),
        }
    }

    /// All descendants via `parent_of`, excluding the root, bounded by depth.
    pub fn subtree(&self, node_id: &str, max_depth: u32) -> Result<NodesResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        Self::assert_exists(&conn, node_id)?;
        self.collect_nodes(
            &conn,
            "WITH RECURSIVE subtree(id, depth) AS (
                SELECT e.target_id, 1
                FROM memory_edges e
                WHERE e.source_id = ?1 AND e.relation = 'parent_of'
                UNION
                SELECT e.target_id, s.depth + 1
                FROM memory_edges e
                JOIN subtree s ON e.source_id = s.id
                WHERE e.relation = 'parent_of' AND s.depth < ?2
             )
             SELECT DISTINCT n.* FROM memory_nodes n
             JOIN subtree s ON n.id = s.id
             ORDER BY n.created_at, n.rowid",
            params![node_id, i64::from(max_depth)],
        )
    }

    /// Aggregate statistics over the whole graph.
    pub fn stats(&self) -> Result<StatsResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let inner = || -> Result<StatsResponse> {
            let total_nodes: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_nodes", [], |row| row.get(0))?;
            let total_edges: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_edges", [], |row| row.get(0))?;

            let mut nodes_by_type = HashMap::new();
            let mut stmt = conn
                .prepare("SELECT entity_type, COUNT(*) FROM memory_nodes GROUP BY entity_type")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (entity_type, count) = row?;
                nodes_by_type.insert(entity_type, count);
            }

            let mut edges_by_relation = HashMap::new();
            let mut stmt =
                conn.prepare("SELECT relation, COUNT(*) FROM memory_edges GROUP BY relation")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (relation, count) = row?;
                edges_by_relation.insert(relation, count);
            }

            let mut most_connected_nodes = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT n.id, n.name,
                        (SELECT COUNT(*) FROM memory_edges e
                         WHERE e.source_id = n.id OR e.target_id = n.id) AS edge_count
                 FROM memory_nodes n
                 ORDER BY edge_count DESC
                 LIMIT 10",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ConnectedNode {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    edge_count: row.get(2)?,
                })
            })?;
            for row in rows {
                most_connected_nodes.push(row?);
            }

            let orphaned_nodes: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_nodes n
                 WHERE NOT EXISTS (
                    SELECT 1 FROM memory_edges e
                    WHERE e.source_id = n.id OR e.target_id = n.id
                 )",
                [],
                |row| row.get(0),
            )?;

            let cutoff = (Utc::now() - chrono::Duration::hours(24))
                .format(crate::audit::TS_FORMAT)
                .to_string();
            let created_last_24h: i64 = conn.query_row(
                "SELECT COUNT(*) FROM memory_nodes WHERE created_at >= ?1",
                params![cutoff],
                |row| row.get(0),
            )?;

            let mut tags_frequency = HashMap::new();
            let mut stmt = conn.prepare(
                "SELECT jt.value, COUNT(*) AS cnt
                 FROM memory_nodes n, json_each(n.tags) jt
                 GROUP BY jt.value
                 ORDER BY cnt DESC
                 LIMIT 50",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (tag, count) = row?;
                tags_frequency.insert(tag, count);
            }

            Ok(StatsResponse {
                total_nodes,
                total_edges,
                nodes_by_type,
                edges_by_relation,
                most_connected_nodes,
                orphaned_nodes,
                created_last_24h,
                tags_frequency,
            })
        };
        inner().map_err(GatewayError::Internal)
    }

    fn collect_nodes(
        &self,
        conn: &Connection,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> Result<NodesResponse, GatewayError> {
        let mut stmt = conn.prepare(sql).map_err(|e| GatewayError::Internal(e.into()))?;
        let rows = stmt
            .query_map(args, row_to_node)
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
        }
        let total = nodes.len();
        Ok(NodesResponse { nodes, total })
    }
}
