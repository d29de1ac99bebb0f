use crate::errors::GatewayError;
use crate::policy::shell_guard;
use crate::tools::base::{InvocationContext, Tool, optional_str, require_str};
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// Maximum stdout/stderr size kept per stream (100 KB).
const MAX_OUTPUT_BYTES: usize = 100_000;

fn truncate_output(text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n[Output truncated: {} bytes total]",
        &text[..cut],
        text.len()
    )
}

/// Execute a shell command inside the workspace.
///
/// Commands are exec'd directly (no shell interpolation): the command string
/// is word-split and the first token spawned with the rest as arguments.
/// The safety predicate that gates unreviewed execution lives in the policy
/// engine; by the time this tool runs, policy and HITL have already decided.
pub struct ShellExecuteTool {
    workspace: Arc<WorkspaceManager>,
    default_timeout: u64,
}

impl ShellExecuteTool {
    pub fn new(workspace: Arc<WorkspaceManager>, default_timeout: u64) -> Self {
        Self {
            workspace,
            default_timeout,
        }
    }
}

#[async_trait]
impl Tool for ShellExecuteTool {
    fn category(&self) -> &str {
        "shell"
    }

    fn name(&self) -> &str {
        "execute"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return stdout, stderr, and the exit code."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "timeout": {"type": "integer", "description": "Seconds before the process is killed"},
                "workspace_dir": {"type": "string"},
                "env": {"type": "object", "additionalProperties": {"type": "string"}}
            },
            "required": ["command"]
        })
    }

    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();
        let command = require_str(&params, "command")?;
        let timeout_secs = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(self.default_timeout);

        let override_dir = optional_str(&params, "workspace_dir").filter(|d| !d.is_empty());
        let working_dir = self.workspace.resolve(".", override_dir)?;
        if !working_dir.is_dir() {
            return Err(GatewayError::InvalidParameter(format!(
                "Working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let (base, args) =
            shell_guard::parse_command(command).map_err(GatewayError::InvalidParameter)?;

        let mut cmd = tokio::process::Command::new(&base);
        cmd.args(&args)
            .current_dir(&working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = params.get("env").and_then(Value::as_object) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => GatewayError::InvalidParameter(format!(
                "Command not found: '{}'. Make sure it is installed and available in PATH.",
                base
            )),
            std::io::ErrorKind::PermissionDenied => {
                GatewayError::Security(format!("Permission denied executing command: '{}'", base))
            }
            _ => GatewayError::Internal(anyhow::anyhow!("failed to spawn '{}': {}", base, e)),
        })?;

        let output = match tokio::time::timeout(
            std::time::Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                error!(command, error = %e, "shell execution error");
                return Err(GatewayError::Internal(anyhow::anyhow!(
                    "failed to execute command: {}",
                    e
                )));
            }
            Err(_) => {
                // kill_on_drop reaps the child when the future is dropped.
                return Err(GatewayError::Timeout(format!(
                    "Command timed out after {} seconds. Consider increasing the timeout parameter.",
                    timeout_secs
                )));
            }
        };

        let stdout = truncate_output(String::from_utf8_lossy(&output.stdout).into_owned());
        let stderr = truncate_output(String::from_utf8_lossy(&output.stderr).into_owned());
        let exit_code = output.status.code().unwrap_or(-1);
        let duration_ms = started.elapsed().as_millis() as i64;

        info!(command, exit_code, duration_ms, working_dir = %working_dir.display(), "shell executed");

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
            "duration_ms": duration_ms,
            "command": command,
            "working_directory": working_dir.to_string_lossy(),
        }))
    }
}
