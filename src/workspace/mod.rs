use crate::errors::GatewayError;
use anyhow::Context;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

/// Disk usage for the workspace filesystem, in bytes.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInfo {
    pub default_workspace: PathBuf,
    pub disk_usage: DiskUsage,
}

/// Manages the sandbox boundary and path resolution.
///
/// Every filesystem and shell tool resolves caller paths through this type,
/// on every call — resolution results are never cached.
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

/// Canonicalise a path, tolerating a non-existent suffix.
///
/// Symlinks in the existing prefix are resolved via `fs::canonicalize`; the
/// remaining (not yet created) components are appended with lexical `.`/`..`
/// normalisation. This mirrors realpath-without-strict semantics so that a
/// path about to be created can still be boundary-checked.
fn canonicalize_lenient(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Ok(resolved);
    }

    // Target does not exist (yet). Normalise lexically, then canonicalise the
    // deepest existing ancestor and re-attach the remainder.
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => normalized.push(component),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(name) => normalized.push(name),
        }
    }

    let mut ancestor = normalized.as_path();
    while !ancestor.exists() {
        ancestor = ancestor.parent().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no existing ancestor for {}", normalized.display()),
            )
        })?;
    }
    let canonical = ancestor.canonicalize()?;
    let remainder = normalized
        .strip_prefix(ancestor)
        .unwrap_or_else(|_| Path::new(""));
    Ok(canonical.join(remainder))
}

impl WorkspaceManager {
    /// Create the manager, creating and canonicalising the sandbox root.
    pub fn new(base_dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref();
        if !base_dir.exists() {
            std::fs::create_dir_all(base_dir).with_context(|| {
                format!("Failed to create workspace directory: {}", base_dir.display())
            })?;
            info!(path = %base_dir.display(), "created workspace dir");
        }
        let base_dir = base_dir.canonicalize().with_context(|| {
            format!("Failed to canonicalize workspace root: {}", base_dir.display())
        })?;
        info!(base_dir = %base_dir.display(), "workspace initialized");
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a user-provided path with security checks.
    ///
    /// This is the critical security function. It must handle relative paths
    /// with `..` traversal, absolute paths that escape the workspace, symlinks
    /// that resolve outside it, and zero bytes in the input.
    pub fn resolve(
        &self,
        user_path: &str,
        workspace_override: Option<&str>,
    ) -> Result<PathBuf, GatewayError> {
        if user_path.contains('\0') {
            return Err(GatewayError::InvalidParameter(
                "Path contains null bytes".to_string(),
            ));
        }

        let effective_root = match workspace_override {
            Some(over) if !over.is_empty() => {
                if over.contains('\0') {
                    return Err(GatewayError::InvalidParameter(
                        "Path contains null bytes".to_string(),
                    ));
                }
                let resolved = canonicalize_lenient(Path::new(over)).map_err(|e| {
                    GatewayError::Security(format!(
                        "Workspace override '{}' cannot be resolved: {}",
                        over, e
                    ))
                })?;
                if resolved != self.base_dir && !resolved.starts_with(&self.base_dir) {
                    return Err(GatewayError::Security(format!(
                        "Workspace override '{}' is outside base workspace",
                        over
                    )));
                }
                resolved
            }
            _ => self.base_dir.clone(),
        };

        let candidate = Path::new(user_path);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            effective_root.join(candidate)
        };
        let resolved = canonicalize_lenient(&joined).map_err(|e| {
            GatewayError::Security(format!("Path '{}' cannot be resolved: {}", user_path, e))
        })?;

        // Prefix containment: equal to the effective root, or a descendant.
        // `Path::starts_with` compares whole components, so `/ws-evil` does
        // not pass for root `/ws`.
        if resolved != effective_root && !resolved.starts_with(&effective_root) {
            return Err(GatewayError::Security(format!(
                "Path '{}' resolves to '{}' which escapes workspace boundary '{}'",
                user_path,
                resolved.display(),
                effective_root.display()
            )));
        }

        debug!(
            user_path = user_path,
            resolved = %resolved.display(),
            workspace = %effective_root.display(),
            "path resolved"
        );
        Ok(resolved)
    }

    /// Whether `path` resolves inside the sandbox.
    pub fn is_within(&self, path: &Path) -> bool {
        match canonicalize_lenient(path) {
            Ok(resolved) => resolved == self.base_dir || resolved.starts_with(&self.base_dir),
            Err(_) => false,
        }
    }

    pub fn info(&self) -> WorkspaceInfo {
        let disk_usage = match (
            fs2::total_space(&self.base_dir),
            fs2::available_space(&self.base_dir),
        ) {
            (Ok(total), Ok(free)) => DiskUsage {
                total,
                used: total.saturating_sub(free),
                free,
            },
            (total, free) => {
                warn!(
                    ?total,
                    ?free,
                    "failed to get disk usage for workspace"
                );
                DiskUsage {
                    total: 0,
                    used: 0,
                    free: 0,
                }
            }
        };
        WorkspaceInfo {
            default_workspace: self.base_dir.clone(),
            disk_usage,
        }
    }
}
