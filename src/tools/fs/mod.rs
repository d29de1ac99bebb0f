use crate::errors::GatewayError;
use crate::tools::base::{InvocationContext, Tool, optional_str, require_str};
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;
use walkdir::WalkDir;

/// Maximum file size `fs read` will load (10 MB).
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;
/// Maximum entries a single `fs list` call returns.
const MAX_LIST_ENTRIES: usize = 1000;

fn workspace_dir(params: &Value) -> Option<&str> {
    optional_str(params, "workspace_dir").filter(|dir| !dir.is_empty())
}

pub struct FsReadTool {
    workspace: Arc<WorkspaceManager>,
}

impl FsReadTool {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for FsReadTool {
    fn category(&self) -> &str {
        "fs"
    }

    fn name(&self) -> &str {
        "read"
    }

    fn description(&self) -> &str {
        "Read the contents of a file at the given path inside the workspace."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path relative to the workspace"},
                "workspace_dir": {"type": "string", "description": "Optional workspace subdirectory override"}
            },
            "required": ["path"]
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let path = require_str(&params, "path")?;
        let resolved = self.workspace.resolve(path, workspace_dir(&params))?;

        let metadata = tokio::fs::metadata(&resolved).await.map_err(|_| {
            GatewayError::not_found_with_suggestion(
                format!("File not found: {}", path),
                "fs_list",
            )
        })?;
        if !metadata.is_file() {
            return Err(GatewayError::InvalidParameter(format!(
                "Not a file: {}",
                path
            )));
        }
        if metadata.len() > MAX_READ_BYTES {
            return Err(GatewayError::InvalidParameter(format!(
                "File too large to read ({} bytes, limit {})",
                metadata.len(),
                MAX_READ_BYTES
            )));
        }

        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to read file: {}", e)))?;

        Ok(json!({
            "path": resolved.to_string_lossy(),
            "content": content,
            "size_bytes": metadata.len(),
        }))
    }
}

pub struct FsWriteTool {
    workspace: Arc<WorkspaceManager>,
}

impl FsWriteTool {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for FsWriteTool {
    fn category(&self) -> &str {
        "fs"
    }

    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file inside the workspace, creating parent directories as needed."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "content": {"type": "string"},
                "append": {"type": "boolean", "default": false},
                "workspace_dir": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let path = require_str(&params, "path")?;
        let content = require_str(&params, "content")?;
        let append = params.get("append").and_then(Value::as_bool).unwrap_or(false);
        let resolved = self.workspace.resolve(path, workspace_dir(&params))?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!("failed to create parent dirs: {}", e))
            })?;
        }

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&resolved)
                .await
                .map_err(|e| {
                    GatewayError::Internal(anyhow::anyhow!("failed to open file: {}", e))
                })?;
            file.write_all(content.as_bytes()).await.map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!("failed to append: {}", e))
            })?;
        } else {
            tokio::fs::write(&resolved, content).await.map_err(|e| {
                GatewayError::Internal(anyhow::anyhow!("failed to write file: {}", e))
            })?;
        }

        info!(path = %resolved.display(), append, bytes = content.len(), "fs write");
        Ok(json!({
            "path": resolved.to_string_lossy(),
            "bytes_written": content.len(),
            "append": append,
        }))
    }
}

pub struct FsListTool {
    workspace: Arc<WorkspaceManager>,
}

impl FsListTool {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for FsListTool {
    fn category(&self) -> &str {
        "fs"
    }

    fn name(&self) -> &str {
        "list"
    }

    fn description(&self) -> &str {
        "List directory entries inside the workspace, optionally recursively."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "default": "."},
                "recursive": {"type": "boolean", "default": false},
                "workspace_dir": {"type": "string"}
            }
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let path = optional_str(&params, "path").unwrap_or(".");
        let recursive = params
            .get("recursive")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let resolved = self.workspace.resolve(path, workspace_dir(&params))?;

        if !resolved.is_dir() {
            return Err(GatewayError::not_found_with_suggestion(
                format!("Directory not found: {}", path),
                "workspace_info",
            ));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in WalkDir::new(&resolved)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!("list failed: {}", e)))?;
            if entries.len() >= MAX_LIST_ENTRIES {
                truncated = true;
                break;
            }
            let relative = entry
                .path()
                .strip_prefix(&resolved)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let file_type = if entry.file_type().is_dir() {
                "directory"
            } else if entry.file_type().is_symlink() {
                "symlink"
            } else {
                "file"
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            entries.push(json!({
                "name": relative,
                "type": file_type,
                "size_bytes": size,
            }));
        }

        Ok(json!({
            "path": resolved.to_string_lossy(),
            "entries": entries,
            "total": entries.len(),
            "truncated": truncated,
        }))
    }
}

pub struct FsSearchTool {
    workspace: Arc<WorkspaceManager>,
}

impl FsSearchTool {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self { workspace }
    }
}

/// Default cap on search matches per call.
const MAX_SEARCH_RESULTS: usize = 100;
/// Bytes sniffed to skip binary files during content search.
const BINARY_SNIFF_BYTES: usize = 1024;
/// Preview length for content matches.
const SEARCH_PREVIEW_CHARS: usize = 200;

enum SearchMatcher {
    Substring(String),
    Pattern(Box<regex::Regex>),
}

impl SearchMatcher {
    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Substring(needle) => text.to_lowercase().contains(needle),
            Self::Pattern(pattern) => pattern.is_match(text),
        }
    }
}

#[async_trait]
impl Tool for FsSearchTool {
    fn category(&self) -> &str {
        "fs"
    }

    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search workspace files by name or content, with substring or regex matching."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "path": {"type": "string", "default": "."},
                "search_type": {"type": "string", "enum": ["filename", "content", "both"], "default": "both"},
                "regex": {"type": "boolean", "default": false},
                "max_results": {"type": "integer", "default": MAX_SEARCH_RESULTS},
                "include_content_preview": {"type": "boolean", "default": true},
                "workspace_dir": {"type": "string"}
            },
            "required": ["query"]
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let started = std::time::Instant::now();
        let query = require_str(&params, "query")?;
        let path = optional_str(&params, "path").unwrap_or(".");
        let search_type = optional_str(&params, "search_type").unwrap_or("both");
        if !matches!(search_type, "filename" | "content" | "both") {
            return Err(GatewayError::InvalidParameter(format!(
                "Invalid search_type '{}'. Must be 'filename', 'content', or 'both'.",
                search_type
            )));
        }
        let use_regex = params.get("regex").and_then(Value::as_bool).unwrap_or(false);
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .map_or(MAX_SEARCH_RESULTS, |n| n as usize);
        let include_preview = params
            .get("include_content_preview")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let matcher = if use_regex {
            let pattern = regex::RegexBuilder::new(query)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    GatewayError::InvalidParameter(format!("Invalid regex pattern: {}", e))
                })?;
            SearchMatcher::Pattern(Box::new(pattern))
        } else {
            SearchMatcher::Substring(query.to_lowercase())
        };

        let resolved = self.workspace.resolve(path, workspace_dir(&params))?;
        if !resolved.is_dir() {
            return Err(GatewayError::not_found_with_suggestion(
                format!("Directory not found: {}", path),
                "fs_list",
            ));
        }

        let mut matches = Vec::new();
        'walk: for entry in WalkDir::new(&resolved).min_depth(1).sort_by_file_name() {
            if matches.len() >= max_results {
                break;
            }
            let Ok(entry) = entry else { continue };
            let relative = entry
                .path()
                .strip_prefix(&resolved)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let file_name = entry.file_name().to_string_lossy();

            if matches!(search_type, "filename" | "both") && matcher.matches(&file_name) {
                matches.push(json!({
                    "path": relative,
                    "type": "filename",
                    "match_line": Value::Null,
                    "preview": Value::Null,
                }));
            }

            if matches!(search_type, "content" | "both") && entry.file_type().is_file() {
                let Ok(content) = std::fs::read(entry.path()) else {
                    continue;
                };
                // Skip binary files.
                if content[..content.len().min(BINARY_SNIFF_BYTES)].contains(&0) {
                    continue;
                }
                let text = String::from_utf8_lossy(&content);
                for (line_idx, line) in text.lines().enumerate() {
                    if matches.len() >= max_results {
                        break 'walk;
                    }
                    if matcher.matches(line) {
                        let preview = if include_preview {
                            Value::String(line.trim().chars().take(SEARCH_PREVIEW_CHARS).collect())
                        } else {
                            Value::Null
                        };
                        matches.push(json!({
                            "path": relative,
                            "type": "content",
                            "match_line": line_idx + 1,
                            "preview": preview,
                        }));
                    }
                }
            }
        }

        let total_matches = matches.len();
        info!(
            path = %resolved.display(),
            query,
            search_type,
            total_matches,
            "fs search completed"
        );
        Ok(json!({
            "query": query,
            "search_type": search_type,
            "matches": matches,
            "total_matches": total_matches,
            "search_time_ms": started.elapsed().as_millis() as i64,
        }))
    }
}
