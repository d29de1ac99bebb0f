use crate::config::{PolicyDecision, ToolPolicyConfig, ToolsConfig};
use anyhow::{Context, Result};
use globset::{Glob, GlobMatcher};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

pub mod shell_guard;

/// A tool policy with its glob patterns compiled once at engine construction.
struct CompiledPolicy {
    base: PolicyDecision,
    workspace_override: PolicyDecision,
    block_patterns: Vec<GlobMatcher>,
    hitl_patterns: Vec<GlobMatcher>,
}

fn compile(config: &ToolPolicyConfig) -> Result<CompiledPolicy> {
    let compile_set = |patterns: &[String]| -> Result<Vec<GlobMatcher>> {
        patterns
            .iter()
            .map(|p| {
                Ok(Glob::new(p)
                    .with_context(|| format!("invalid policy glob pattern: {}", p))?
                    .compile_matcher())
            })
            .collect()
    };
    Ok(CompiledPolicy {
        base: config.policy,
        workspace_override: config.workspace_override,
        block_patterns: compile_set(&config.block_patterns)?,
        hitl_patterns: compile_set(&config.hitl_patterns)?,
    })
}

/// Maps `(category, tool, params)` to an allow/block/hitl decision.
///
/// Policy is purely a function of static configuration and the request
/// shape, never of runtime state — this keeps audit reproducible.
pub struct PolicyEngine {
    defaults: CompiledPolicy,
    overrides: HashMap<(String, String), CompiledPolicy>,
}

impl PolicyEngine {
    pub fn new(config: &ToolsConfig) -> Result<Self> {
        let defaults = compile(&config.defaults)?;
        let mut overrides = HashMap::new();
        for (category, tools) in &config.overrides {
            for (tool, policy) in tools {
                overrides.insert((category.clone(), tool.clone()), compile(policy)?);
            }
        }
        Ok(Self {
            defaults,
            overrides,
        })
    }

    fn policy_for(&self, category: &str, tool: &str) -> &CompiledPolicy {
        self.overrides
            .get(&(category.to_string(), tool.to_string()))
            .unwrap_or(&self.defaults)
    }

    /// Evaluate policy for a tool execution, returning the decision and a
    /// human-readable reason for any non-allow outcome.
    pub fn evaluate(
        &self,
        category: &str,
        tool: &str,
        params: &Value,
    ) -> (PolicyDecision, Option<String>) {
        let policy = self.policy_for(category, tool);
        let path = params.get("path").and_then(Value::as_str).unwrap_or("");

        if !path.is_empty() {
            if policy.block_patterns.iter().any(|m| m.is_match(path)) {
                let reason = "Matches block pattern".to_string();
                info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy blocked");
                return (PolicyDecision::Block, Some(reason));
            }
            if policy.hitl_patterns.iter().any(|m| m.is_match(path)) {
                let reason = "Matches HITL pattern".to_string();
                info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy hitl");
                return (PolicyDecision::Hitl, Some(reason));
            }
        }

        let has_workspace_override = params
            .get("workspace_dir")
            .and_then(Value::as_str)
            .is_some_and(|dir| !dir.is_empty());
        if has_workspace_override {
            match policy.workspace_override {
                PolicyDecision::Block => {
                    let reason = "Workspace override not allowed".to_string();
                    info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy blocked");
                    return (PolicyDecision::Block, Some(reason));
                }
                PolicyDecision::Hitl => {
                    let reason = "Workspace override requires approval".to_string();
                    info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy hitl");
                    return (PolicyDecision::Hitl, Some(reason));
                }
                PolicyDecision::Allow => {}
            }
        }

        match policy.base {
            PolicyDecision::Block => {
                let reason = "Tool is blocked by policy".to_string();
                info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy blocked");
                (PolicyDecision::Block, Some(reason))
            }
            PolicyDecision::Hitl => {
                let reason = "Tool requires approval by policy".to_string();
                info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy hitl");
                (PolicyDecision::Hitl, Some(reason))
            }
            PolicyDecision::Allow => {
                debug!(tool = %format!("{}_{}", category, tool), "policy allowed");
                (PolicyDecision::Allow, None)
            }
        }
    }

    /// Shell variant: an `allow` is lifted to `hitl` when the command-safety
    /// predicate flags the command. Block outcomes are unchanged.
    pub fn evaluate_shell(
        &self,
        category: &str,
        tool: &str,
        params: &Value,
    ) -> (PolicyDecision, Option<String>) {
        let (decision, reason) = self.evaluate(category, tool, params);
        if decision != PolicyDecision::Allow {
            return (decision, reason);
        }
        let Some(command) = params.get("command").and_then(Value::as_str) else {
            return (decision, reason);
        };
        let (safe, guard_reason) = shell_guard::check_command_safety(command);
        if safe {
            (PolicyDecision::Allow, None)
        } else {
            let reason = format!("Command requires approval: {}", guard_reason);
            info!(tool = %format!("{}_{}", category, tool), reason = %reason, "policy hitl");
            (PolicyDecision::Hitl, Some(reason))
        }
    }
}
