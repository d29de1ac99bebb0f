use crate::errors::GatewayError;
use crate::tools::base::{InvocationContext, Tool};
use crate::workspace::WorkspaceManager;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Reports the sandbox root and disk usage.
pub struct WorkspaceInfoTool {
    workspace: Arc<WorkspaceManager>,
}

impl WorkspaceInfoTool {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl Tool for WorkspaceInfoTool {
    fn category(&self) -> &str {
        "workspace"
    }

    fn name(&self) -> &str {
        "info"
    }

    fn description(&self) -> &str {
        "Get the workspace root directory and its disk usage."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn invoke(
        &self,
        _params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let info = self.workspace.info();
        serde_json::to_value(info)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serialize info: {}", e)))
    }
}
