use crate::db::Database;
use crate::secrets::SecretStore;
use anyhow::Result;
use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Persisted timestamp format used across all stores.
pub const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

pub fn now_iso() -> String {
    Utc::now().format(TS_FORMAT).to_string()
}

/// Outcome of one dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Error,
    Blocked,
    HitlApproved,
    HitlRejected,
    HitlExpired,
}

impl AuditStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Blocked => "blocked",
            Self::HitlApproved => "hitl_approved",
            Self::HitlRejected => "hitl_rejected",
            Self::HitlExpired => "hitl_expired",
        }
    }
}

/// One dispatch attempt to record. Params must be the templated (pre-secret
/// -resolution) form; masking of literal values happens inside the store.
pub struct AuditEntry {
    pub category: String,
    pub name: String,
    pub protocol: String,
    pub params: Value,
    pub response: Option<Value>,
    pub status: AuditStatus,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub hitl_request_id: Option<String>,
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: String,
    pub category: String,
    pub name: String,
    pub protocol: String,
    pub status: String,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub hitl_request_id: Option<String>,
}

/// Cap on serialized params/response text per row.
const MAX_FIELD_CHARS: usize = 100_000;

fn serialize_capped(value: &Value) -> String {
    let mut text = value.to_string();
    if text.chars().count() > MAX_FIELD_CHARS {
        let truncated: String = text.chars().take(MAX_FIELD_CHARS).collect();
        text = serde_json::json!({
            "truncated": true,
            "preview": truncated,
        })
        .to_string();
    }
    text
}

/// Append-only log of every dispatch attempt and outcome.
///
/// This is the single authoritative redaction point: every text field is
/// masked against the current secret mapping before it is written.
pub struct AuditLog {
    db: Arc<Database>,
    secrets: Arc<SecretStore>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>, secrets: Arc<SecretStore>) -> Result<Self> {
        {
            let conn = db.conn()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS audit_log (
                    id TEXT PRIMARY KEY,
                    timestamp TEXT NOT NULL,
                    tool_category TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    protocol TEXT NOT NULL,
                    request_params TEXT NOT NULL,
                    response_body TEXT,
                    status TEXT NOT NULL,
                    duration_ms INTEGER,
                    error_message TEXT,
                    hitl_request_id TEXT,
                    workspace_dir TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp DESC);
                CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_log(tool_category, tool_name);
                CREATE INDEX IF NOT EXISTS idx_audit_status ON audit_log(status);",
            )?;
        }
        Ok(Self { db, secrets })
    }

    /// Write one audit row. Returns the record id.
    pub fn log(&self, entry: &AuditEntry) -> Result<String> {
        let record_id = Uuid::new_v4().to_string();
        let timestamp = now_iso();

        let params_json = self
            .secrets
            .mask_text(&serialize_capped(&entry.params));
        let response_json = entry
            .response
            .as_ref()
            .map(|r| self.secrets.mask_text(&serialize_capped(r)));
        let error_message = entry.error.as_deref().map(|e| self.secrets.mask_text(e));

        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO audit_log (
                id, timestamp, tool_category, tool_name, protocol,
                request_params, response_body, status, duration_ms,
                error_message, hitl_request_id, workspace_dir
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                record_id,
                timestamp,
                entry.category,
                entry.name,
                entry.protocol,
                params_json,
                response_json,
                entry.status.as_str(),
                entry.duration_ms,
                error_message,
                entry.hitl_request_id,
                entry.workspace,
            ],
        )?;
        drop(conn);

        info!(
            record_id = %record_id,
            tool = %format!("{}_{}", entry.category, entry.name),
            status = entry.status.as_str(),
            "audit logged"
        );
        Ok(record_id)
    }

    /// Most recent rows, newest first.
    pub fn recent(&self, limit: u32) -> Result<Vec<AuditRecord>> {
        self.query(None, None, limit, 0)
    }

    /// Filtered query with pagination, newest first.
    pub fn query(
        &self,
        status: Option<&str>,
        category: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<AuditRecord>> {
        let conn = self.db.conn()?;
        let mut sql = String::from(
            "SELECT id, timestamp, tool_category, tool_name, protocol, status,
                    duration_ms, error_message, hitl_request_id
             FROM audit_log WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        if let Some(category) = category {
            sql.push_str(" AND tool_category = ?");
            args.push(Box::new(category.to_string()));
        }
        sql.push_str(" ORDER BY timestamp DESC, id LIMIT ? OFFSET ?");
        args.push(Box::new(i64::from(limit)));
        args.push(Box::new(i64::from(offset)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| {
                Ok(AuditRecord {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    category: row.get(2)?,
                    name: row.get(3)?,
                    protocol: row.get(4)?,
                    status: row.get(5)?,
                    duration_ms: row.get(6)?,
                    error: row.get(7)?,
                    hitl_request_id: row.get(8)?,
                })
            },
        )?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Raw params JSON for a record, for tests and admin inspection.
    pub fn params_json(&self, record_id: &str) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT request_params FROM audit_log WHERE id = ?1")?;
        let mut rows = stmt.query(params![record_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests;
