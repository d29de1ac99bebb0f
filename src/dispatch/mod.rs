use crate::audit::{AuditEntry, AuditLog, AuditStatus};
use crate::config::PolicyDecision;
use crate::errors::GatewayError;
use crate::hitl::{HitlCoordinator, HitlDecision};
use crate::policy::PolicyEngine;
use crate::secrets::SecretStore;
use crate::tools::base::InvocationContext;
use crate::tools::registry::ToolRegistry;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// The tool dispatch pipeline: policy evaluation, HITL gating, secret
/// resolution, invocation, audit emission.
///
/// Every dispatch attempt writes exactly one audit row, whatever its
/// outcome. The audit snapshot always carries the templated params — secret
/// resolution happens strictly after the snapshot is captured.
pub struct Dispatcher {
    policy: Arc<PolicyEngine>,
    hitl: Arc<HitlCoordinator>,
    secrets: Arc<SecretStore>,
    audit: Arc<AuditLog>,
    registry: Arc<ToolRegistry>,
    workspace_dir: String,
}

impl Dispatcher {
    pub fn new(
        policy: Arc<PolicyEngine>,
        hitl: Arc<HitlCoordinator>,
        secrets: Arc<SecretStore>,
        audit: Arc<AuditLog>,
        registry: Arc<ToolRegistry>,
        workspace_dir: String,
    ) -> Self {
        Self {
            policy,
            hitl,
            secrets,
            audit,
            registry,
            workspace_dir,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one tool invocation through the full pipeline.
    pub async fn dispatch(
        &self,
        category: &str,
        name: &str,
        raw_params: Value,
        ctx: &InvocationContext,
        force_hitl: bool,
        hitl_reason: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let started = Instant::now();

        let (decision, reason) = if force_hitl {
            (
                PolicyDecision::Hitl,
                Some(hitl_reason.unwrap_or("Requires approval").to_string()),
            )
        } else if category == "shell" {
            self.policy.evaluate_shell(category, name, &raw_params)
        } else {
            self.policy.evaluate(category, name, &raw_params)
        };

        if decision == PolicyDecision::Block {
            let reason = reason.unwrap_or_else(|| "Blocked by policy".to_string());
            self.write_audit(AuditEntry {
                category: category.to_string(),
                name: name.to_string(),
                protocol: ctx.protocol.clone(),
                params: raw_params,
                response: None,
                status: AuditStatus::Blocked,
                duration_ms: None,
                error: Some(reason.clone()),
                hitl_request_id: None,
                workspace: Some(self.workspace_dir.clone()),
            });
            return Err(GatewayError::Security(format!(
                "Operation blocked: {}",
                reason
            )));
        }

        let mut hitl_request_id = None;
        let went_through_hitl = decision == PolicyDecision::Hitl;
        if went_through_hitl {
            let rule = reason.unwrap_or_else(|| "Requires approval".to_string());
            info!(tool = %format!("{}_{}", category, name), reason = %rule, "hitl required");

            let request = self
                .hitl
                .create(
                    category,
                    name,
                    self.secrets.mask_value(&raw_params),
                    ctx.to_value(),
                    &rule,
                    None,
                )
                .await?;
            hitl_request_id = Some(request.id.clone());

            match self.hitl.wait(&request.id, None).await? {
                HitlDecision::Approved => {
                    info!(tool = %format!("{}_{}", category, name), "hitl approved, executing");
                }
                HitlDecision::Rejected => {
                    self.write_audit(AuditEntry {
                        category: category.to_string(),
                        name: name.to_string(),
                        protocol: ctx.protocol.clone(),
                        params: raw_params,
                        response: None,
                        status: AuditStatus::HitlRejected,
                        duration_ms: None,
                        error: Some("Operation rejected by administrator".to_string()),
                        hitl_request_id,
                        workspace: Some(self.workspace_dir.clone()),
                    });
                    return Err(GatewayError::Security(
                        "Operation not permitted. The request was reviewed and rejected."
                            .to_string(),
                    ));
                }
                HitlDecision::Expired => {
                    self.write_audit(AuditEntry {
                        category: category.to_string(),
                        name: name.to_string(),
                        protocol: ctx.protocol.clone(),
                        params: raw_params,
                        response: None,
                        status: AuditStatus::HitlExpired,
                        duration_ms: None,
                        error: Some("Operation timed out waiting for approval".to_string()),
                        hitl_request_id,
                        workspace: Some(self.workspace_dir.clone()),
                    });
                    return Err(GatewayError::Timeout(
                        "Operation timed out waiting for approval. Please try again later."
                            .to_string(),
                    ));
                }
            }
        }

        let outcome = self.run_tool(category, name, &raw_params, ctx).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                self.write_audit(AuditEntry {
                    category: category.to_string(),
                    name: name.to_string(),
                    protocol: ctx.protocol.clone(),
                    params: raw_params,
                    response: Some(result.clone()),
                    status: if went_through_hitl {
                        AuditStatus::HitlApproved
                    } else {
                        AuditStatus::Success
                    },
                    duration_ms: Some(duration_ms),
                    error: None,
                    hitl_request_id,
                    workspace: Some(self.workspace_dir.clone()),
                });
                Ok(result)
            }
            Err(err) => {
                self.write_audit(AuditEntry {
                    category: category.to_string(),
                    name: name.to_string(),
                    protocol: ctx.protocol.clone(),
                    params: raw_params,
                    response: None,
                    status: AuditStatus::Error,
                    duration_ms: Some(duration_ms),
                    error: Some(err.to_string()),
                    hitl_request_id,
                    workspace: Some(self.workspace_dir.clone()),
                });
                Err(err)
            }
        }
    }

    /// Steps that share the single "error" audit row: secret resolution,
    /// registry lookup, and the tool call itself. Resolution runs only after
    /// the caller has fixed the audit snapshot form — the tool sees resolved
    /// values, audit never does.
    async fn run_tool(
        &self,
        category: &str,
        name: &str,
        raw_params: &Value,
        ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        let resolved_params = if SecretStore::has_templates(raw_params) {
            self.secrets.resolve_params(raw_params)?
        } else {
            raw_params.clone()
        };
        let tool = self.registry.lookup(category, name)?;
        tool.invoke(resolved_params, ctx).await
    }

    /// Audit failures must not change the dispatch outcome; they are logged
    /// and swallowed here.
    fn write_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.log(&entry) {
            error!(error = %e, "failed to write audit row");
        }
    }
}
