use super::*;
use crate::audit::AuditLog;
use crate::config::ToolsConfig;
use crate::policy::PolicyEngine;
use crate::secrets::SecretStore;
use crate::tools::registry::ToolRegistry;
use crate::tools::{InvocationContext, Tool};
use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

/// Echoes `{"step": <task param "step">}`; fails when params contain
/// `"fail": true`.
struct StepTool;

#[async_trait]
impl Tool for StepTool {
    fn category(&self) -> &str {
        "test"
    }
    fn name(&self) -> &str {
        "step"
    }
    fn description(&self) -> &str {
        "test step tool"
    }
    fn parameters(&self) -> Value {
        json!({"type": "object"})
    }
    async fn invoke(
        &self,
        params: Value,
        _ctx: &InvocationContext,
    ) -> Result<Value, GatewayError> {
        if params.get("fail").and_then(Value::as_bool).unwrap_or(false) {
            return Err(GatewayError::InvalidParameter("step failed".to_string()));
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        Ok(json!({
            "step": params.get("step").cloned().unwrap_or(Value::Null),
            "input": params.get("input").cloned().unwrap_or(Value::Null),
        }))
    }
}

struct Harness {
    _tmp: TempDir,
    engine: PlanEngine,
    hitl: Arc<HitlCoordinator>,
    audit: Arc<AuditLog>,
}

fn harness() -> Harness {
    let tmp = TempDir::new().expect("tempdir");
    let db = Arc::new(Database::open(tmp.path().join("gate.sqlite3")).expect("open db"));
    let secrets = Arc::new(SecretStore::new(tmp.path().join("absent.env")));
    let audit = Arc::new(AuditLog::new(Arc::clone(&db), Arc::clone(&secrets)).expect("audit"));
    let hitl = Arc::new(HitlCoordinator::new(Arc::clone(&db), 300, 3600).expect("hitl"));
    let policy = Arc::new(PolicyEngine::new(&ToolsConfig::default()).expect("policy"));
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(StepTool));
    let dispatcher = Arc::new(Dispatcher::new(
        policy,
        Arc::clone(&hitl),
        secrets,
        Arc::clone(&audit),
        Arc::new(registry),
        "/ws".to_string(),
    ));
    let engine =
        PlanEngine::new(Arc::clone(&db), Arc::clone(&hitl), dispatcher).expect("engine");
    Harness {
        _tmp: tmp,
        engine,
        hitl,
        audit,
    }
}

fn task(id: &str, deps: &[&str], params: Value) -> TaskSpec {
    TaskSpec {
        id: id.to_string(),
        name: None,
        tool_category: "test".to_string(),
        tool_name: "step".to_string(),
        params,
        depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        on_failure: None,
        require_hitl: false,
    }
}

#[test]
fn test_levels_simple_chain() {
    let graph = vec![
        ("a".to_string(), vec![]),
        ("b".to_string(), vec!["a".to_string()]),
        ("c".to_string(), vec!["b".to_string()]),
    ];
    let levels = compute_execution_levels(&graph).expect("levels");
    assert_eq!(levels, vec![vec!["a"], vec!["b"], vec!["c"]]);
}

#[test]
fn test_levels_diamond() {
    let graph = vec![
        ("root".to_string(), vec![]),
        ("b1".to_string(), vec!["root".to_string()]),
        ("b2".to_string(), vec!["root".to_string()]),
        ("end".to_string(), vec!["b1".to_string(), "b2".to_string()]),
    ];
    let levels = compute_execution_levels(&graph).expect("levels");
    assert_eq!(levels, vec![vec!["root"], vec!["b1", "b2"], vec!["end"]]);
}

#[test]
fn test_levels_longest_chain_wins() {
    // d depends on both a (level 0) and c (level 2) — its level is 3.
    let graph = vec![
        ("a".to_string(), vec![]),
        ("b".to_string(), vec!["a".to_string()]),
        ("c".to_string(), vec!["b".to_string()]),
        ("d".to_string(), vec!["a".to_string(), "c".to_string()]),
    ];
    let levels = compute_execution_levels(&graph).expect("levels");
    assert_eq!(levels[3], vec!["d"]);
}

#[test]
fn test_levels_cycle_detected() {
    let graph = vec![
        ("a".to_string(), vec!["b".to_string()]),
        ("b".to_string(), vec!["a".to_string()]),
    ];
    let err = compute_execution_levels(&graph).unwrap_err();
    assert_eq!(err.kind(), "invalid_parameter");
    assert!(err.to_string().contains("Cycle"));
}

#[test]
fn test_levels_unknown_dependency() {
    let graph = vec![("a".to_string(), vec!["ghost".to_string()])];
    let err = compute_execution_levels(&graph).unwrap_err();
    assert!(err.to_string().contains("unknown task 'ghost'"));
}

#[test]
fn test_resolve_refs_type_preservation() {
    let mut outputs = HashMap::new();
    outputs.insert(
        "a".to_string(),
        json!({"list": [1, 2], "map": {"k": "v"}, "num": 7, "text": "hi"}),
    );

    // Whole-string placeholder keeps the referenced type.
    let resolved = resolve_task_refs(&json!({"x": "{{task:a.list}}"}), &outputs);
    assert_eq!(resolved["x"], json!([1, 2]));
    let resolved = resolve_task_refs(&json!({"x": "{{task:a.num}}"}), &outputs);
    assert_eq!(resolved["x"], json!(7));

    // Embedded placeholders are stringified (JSON for structures).
    let resolved = resolve_task_refs(&json!({"x": "v={{task:a.num}}!"}), &outputs);
    assert_eq!(resolved["x"], "v=7!");
    let resolved = resolve_task_refs(&json!({"x": "m={{task:a.map}}"}), &outputs);
    assert_eq!(resolved["x"], "m={\"k\":\"v\"}");
    let resolved = resolve_task_refs(&json!({"x": "t={{task:a.text}}"}), &outputs);
    assert_eq!(resolved["x"], "t=hi");
}

#[test]
fn test_resolve_refs_unknown_becomes_empty() {
    let outputs = HashMap::new();
    let resolved = resolve_task_refs(&json!({"x": "{{task:ghost.field}}"}), &outputs);
    assert_eq!(resolved["x"], "");
    let resolved = resolve_task_refs(&json!({"x": "pre {{task:ghost.field}} post"}), &outputs);
    assert_eq!(resolved["x"], "pre  post");
}

#[test]
fn test_resolve_refs_nested() {
    let mut outputs = HashMap::new();
    outputs.insert("a".to_string(), json!({"v": "deep"}));
    let resolved = resolve_task_refs(
        &json!({"outer": {"inner": ["{{task:a.v}}"]}}),
        &outputs,
    );
    assert_eq!(resolved["outer"]["inner"][0], "deep");
}

#[tokio::test]
async fn test_create_validations() {
    let h = harness();

    let err = h.engine.create("empty", &[], "stop").unwrap_err();
    assert!(err.to_string().contains("at least one task"));

    let dup = vec![task("a", &[], json!({})), task("a", &[], json!({}))];
    let err = h.engine.create("dup", &dup, "stop").unwrap_err();
    assert!(err.to_string().contains("Duplicate task IDs"));

    let err = h
        .engine
        .create("badpol", &[task("a", &[], json!({}))], "explode")
        .unwrap_err();
    assert!(err.to_string().contains("Invalid on_failure"));

    let mut bad_task = task("a", &[], json!({}));
    bad_task.on_failure = Some("explode".to_string());
    let err = h.engine.create("badtaskpol", &[bad_task], "stop").unwrap_err();
    assert!(err.to_string().contains("invalid on_failure"));

    let cycle = vec![task("a", &["b"], json!({})), task("b", &["a"], json!({}))];
    assert!(h.engine.create("cycle", &cycle, "stop").is_err());
}

#[tokio::test]
async fn test_create_returns_execution_order() {
    let h = harness();
    let response = h
        .engine
        .create(
            "chain",
            &[
                task("a", &[], json!({"step": "A"})),
                task("b", &["a"], json!({"step": "B"})),
            ],
            "stop",
        )
        .expect("create");
    assert_eq!(response.task_count, 2);
    assert_eq!(response.execution_levels, 2);
    assert_eq!(response.execution_order, vec![vec!["a"], vec!["b"]]);
}

#[tokio::test]
async fn test_execute_chain_propagates_values() {
    let h = harness();
    let plan = h
        .engine
        .create(
            "chain",
            &[
                task("A", &[], json!({"step": "A"})),
                task("B", &["A"], json!({"step": "B", "input": "{{task:A.step}}"})),
                task("C", &["B"], json!({"step": "C", "input": "{{task:B.step}}"})),
            ],
            "stop",
        )
        .expect("create");

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    assert_eq!(result.status, "completed");
    assert_eq!(result.tasks_completed, 3);
    assert_eq!(result.tasks_failed, 0);

    let status = h.engine.status(&plan.plan_id).await.expect("status");
    let task_b = status.tasks.iter().find(|t| t.id == "B").expect("task B");
    assert_eq!(
        task_b.output.as_ref().expect("output")["input"],
        "A",
        "B must have received A's step output"
    );

    // One audit row per task through the dispatch pipeline.
    assert_eq!(h.audit.recent(10).expect("recent").len(), 3);

    // Dependencies completed before dependents started.
    let task_a = status.tasks.iter().find(|t| t.id == "A").expect("task A");
    assert!(
        task_a.completed_at.as_ref().expect("completed")
            <= task_b.started_at.as_ref().expect("started")
    );
}

#[tokio::test]
async fn test_execute_stop_policy_skips_dependents() {
    let h = harness();
    let plan = h
        .engine
        .create(
            "diamond",
            &[
                task("root", &[], json!({"step": "root"})),
                task("b1", &["root"], json!({"fail": true})),
                task("b2", &["root"], json!({"step": "b2"})),
                task("end", &["b1", "b2"], json!({"step": "end"})),
            ],
            "stop",
        )
        .expect("create");

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    assert_eq!(result.status, "failed");
    assert_eq!(result.tasks_completed, 2); // root and b2 (same level as b1)
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(result.tasks_skipped, 1);

    let status = h.engine.status(&plan.plan_id).await.expect("status");
    let by_id = |id: &str| {
        status
            .tasks
            .iter()
            .find(|t| t.id == id)
            .expect("task")
            .status
            .clone()
    };
    assert_eq!(by_id("b1"), "failed");
    assert_eq!(by_id("b2"), "completed");
    assert_eq!(by_id("end"), "skipped");
}

#[tokio::test]
async fn test_execute_continue_policy_runs_everything() {
    let h = harness();
    let plan = h
        .engine
        .create(
            "lenient",
            &[
                task("a", &[], json!({"fail": true})),
                task("b", &["a"], json!({"step": "b"})),
            ],
            "continue",
        )
        .expect("create");

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    assert_eq!(result.status, "failed");
    assert_eq!(result.tasks_failed, 1);
    // With continue, the dependent still runs (its reference resolves empty).
    assert_eq!(result.tasks_completed, 1);
}

#[tokio::test]
async fn test_execute_skip_dependents_policy() {
    let h = harness();
    let plan = h
        .engine
        .create(
            "partial",
            &[
                task("a", &[], json!({"fail": true})),
                task("b", &["a"], json!({"step": "b"})),
                task("c", &[], json!({"step": "c"})),
                task("d", &["c"], json!({"step": "d"})),
            ],
            "skip_dependents",
        )
        .expect("create");

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    assert_eq!(result.status, "failed");
    assert_eq!(result.tasks_failed, 1);
    assert_eq!(result.tasks_skipped, 1); // only b
    assert_eq!(result.tasks_completed, 2); // c and d untouched
}

#[tokio::test]
async fn test_task_level_policy_overrides_plan_policy() {
    let h = harness();
    let mut failing = task("a", &[], json!({"fail": true}));
    failing.on_failure = Some("continue".to_string());
    let plan = h
        .engine
        .create(
            "override",
            &[failing, task("b", &["a"], json!({"step": "b"}))],
            "stop",
        )
        .expect("create");

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    // Task-level continue beats the plan-level stop.
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_skipped, 0);
}

#[tokio::test]
async fn test_execute_rejects_reruns_and_running() {
    let h = harness();
    let plan = h
        .engine
        .create("once", &[task("a", &[], json!({"step": "a"}))], "stop")
        .expect("create");

    h.engine.execute(&plan.plan_id).await.expect("execute");
    let err = h.engine.execute(&plan.plan_id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert!(err.to_string().contains("already finished"));
}

#[tokio::test]
async fn test_execute_by_name_and_ambiguity() {
    let h = harness();
    h.engine
        .create("shared-name", &[task("a", &[], json!({"step": "a"}))], "stop")
        .expect("create");

    let result = h.engine.execute("shared-name").await.expect("execute by name");
    assert_eq!(result.status, "completed");

    h.engine
        .create("shared-name", &[task("a", &[], json!({"step": "a"}))], "stop")
        .expect("create duplicate name");
    let err = h.engine.status("shared-name").await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
    assert!(err.to_string().contains("Multiple plans named"));
}

#[tokio::test]
async fn test_unknown_plan_not_found() {
    let h = harness();
    let err = h.engine.status("no-such-plan").await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn test_cancel_pending_plan() {
    let h = harness();
    let plan = h
        .engine
        .create(
            "doomed",
            &[task("a", &[], json!({})), task("b", &["a"], json!({}))],
            "stop",
        )
        .expect("create");

    let cancelled = h.engine.cancel(&plan.plan_id).await.expect("cancel");
    assert_eq!(cancelled.cancelled_tasks, 2);
    assert_eq!(cancelled.status, "cancelled");

    // No task ever leaves pending for running after a cancel.
    let status = h.engine.status(&plan.plan_id).await.expect("status");
    assert!(status.tasks.iter().all(|t| t.status == "skipped"));
    assert_eq!(status.status, "cancelled");

    let err = h.engine.execute(&plan.plan_id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    let err = h.engine.cancel(&plan.plan_id).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn test_list_newest_first() {
    let h = harness();
    h.engine
        .create("first", &[task("a", &[], json!({}))], "stop")
        .expect("create");
    h.engine
        .create("second", &[task("a", &[], json!({}))], "continue")
        .expect("create");

    let listing = h.engine.list().expect("list");
    assert_eq!(listing.total, 2);
    assert_eq!(listing.plans[0].name, "second");
    assert_eq!(listing.plans[0].task_count, 1);
    assert_eq!(listing.plans[1].name, "first");
}

#[tokio::test]
async fn test_require_hitl_task_gated() {
    let h = harness();
    let mut gated = task("a", &[], json!({"step": "a"}));
    gated.require_hitl = true;
    let plan = h
        .engine
        .create("gated", &[gated], "stop")
        .expect("create");

    let hitl = Arc::clone(&h.hitl);
    let approver = tokio::spawn(async move {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(request) = hitl.pending().first() {
                assert_eq!(request.policy_rule_matched, "plan_task_require_hitl");
                hitl.approve(&request.id, "admin", None).await.expect("approve");
                return;
            }
        }
        panic!("no pending hitl request appeared");
    });

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    approver.await.expect("approver");
    assert_eq!(result.status, "completed");
}

#[tokio::test]
async fn test_require_hitl_task_rejected_fails_task() {
    let h = harness();
    let mut gated = task("a", &[], json!({"step": "a"}));
    gated.require_hitl = true;
    let plan = h
        .engine
        .create("gated-reject", &[gated], "stop")
        .expect("create");

    let hitl = Arc::clone(&h.hitl);
    let rejecter = tokio::spawn(async move {
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            if let Some(request) = hitl.pending().first() {
                hitl.reject(&request.id, "admin", None).await.expect("reject");
                return;
            }
        }
        panic!("no pending hitl request appeared");
    });

    let result = h.engine.execute(&plan.plan_id).await.expect("execute");
    rejecter.await.expect("rejecter");
    assert_eq!(result.status, "failed");

    let status = h.engine.status(&plan.plan_id).await.expect("status");
    assert_eq!(
        status.tasks[0].error.as_deref(),
        Some("Task rejected via HITL")
    );
}
