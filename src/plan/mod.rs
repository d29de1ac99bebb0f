use crate::audit::now_iso;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::errors::GatewayError;
use crate::hitl::{HitlCoordinator, HitlDecision};
use crate::tools::base::InvocationContext;
use anyhow::Result;
use futures_util::future::join_all;
use regex::Regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

static TASK_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{task:([^.}\s]+)\.([^}\s]+)\}\}").expect("task ref regex"));
static TASK_REF_FULL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\{\{task:([^.}\s]+)\.([^}\s]+)\}\}$").expect("task ref full regex")
});

/// How a task failure propagates through the rest of the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Stop,
    SkipDependents,
    Continue,
}

impl FailurePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::SkipDependents => "skip_dependents",
            Self::Continue => "continue",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        match raw {
            "stop" => Ok(Self::Stop),
            "skip_dependents" => Ok(Self::SkipDependents),
            "continue" => Ok(Self::Continue),
            other => Err(GatewayError::InvalidParameter(format!(
                "Invalid on_failure '{}'. Must be one of: stop, skip_dependents, continue",
                other
            ))),
        }
    }
}

/// One task as submitted at plan creation.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub tool_category: String,
    pub tool_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub on_failure: Option<String>,
    #[serde(default)]
    pub require_hitl: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateResponse {
    pub plan_id: String,
    pub name: String,
    pub task_count: usize,
    pub execution_levels: usize,
    pub execution_order: Vec<Vec<String>>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub plan_id: String,
    pub status: String,
    pub tasks_completed: i64,
    pub tasks_failed: i64,
    pub tasks_skipped: i64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    pub id: String,
    pub name: String,
    pub tool_category: String,
    pub tool_name: String,
    pub status: String,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub depends_on: Vec<String>,
    pub execution_level: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub plan_id: String,
    pub name: String,
    pub status: String,
    pub on_failure: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub tasks: Vec<TaskStatus>,
    pub tasks_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_skipped: usize,
    pub tasks_running: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListItem {
    pub plan_id: String,
    pub name: String,
    pub status: String,
    pub on_failure: String,
    pub task_count: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResponse {
    pub plans: Vec<ListItem>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub plan_id: String,
    pub cancelled_tasks: i64,
    pub status: String,
}

#[derive(Debug, Clone)]
struct PlanRow {
    id: String,
    name: String,
    status: String,
    on_failure: FailurePolicy,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

#[derive(Debug, Clone)]
struct TaskRow {
    id: String,
    tool_category: String,
    tool_name: String,
    params: Value,
    depends_on: Vec<String>,
    on_failure: Option<FailurePolicy>,
    require_hitl: bool,
    execution_level: i64,
}

/// Kahn's algorithm over the task dependency graph. Each returned level
/// contains task ids whose dependencies all sit in earlier levels, so a
/// task's level equals its longest dependency chain from any root.
fn compute_execution_levels(
    tasks: &[(String, Vec<String>)],
) -> Result<Vec<Vec<String>>, GatewayError> {
    let task_ids: HashSet<&str> = tasks.iter().map(|(id, _)| id.as_str()).collect();

    for (id, deps) in tasks {
        for dep in deps {
            if !task_ids.contains(dep.as_str()) {
                return Err(GatewayError::InvalidParameter(format!(
                    "Task '{}' depends on unknown task '{}'",
                    id, dep
                )));
            }
        }
    }

    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> =
        tasks.iter().map(|(id, _)| (id.as_str(), Vec::new())).collect();
    for (id, deps) in tasks {
        for dep in deps {
            if let Some(entries) = dependents.get_mut(dep.as_str()) {
                entries.push(id.as_str());
            }
        }
    }

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    queue.sort_unstable();

    let mut levels: Vec<Vec<String>> = Vec::new();
    let mut visited = 0;
    while !queue.is_empty() {
        levels.push(queue.iter().map(|id| (*id).to_string()).collect());
        let mut next: Vec<&str> = Vec::new();
        for id in &queue {
            visited += 1;
            for dependent in &dependents[id] {
                let degree = in_degree.get_mut(dependent).expect("known task");
                *degree -= 1;
                if *degree == 0 {
                    next.push(dependent);
                }
            }
        }
        next.sort_unstable();
        queue = next;
    }

    if visited != tasks.len() {
        return Err(GatewayError::InvalidParameter(
            "Cycle detected in task dependency graph".to_string(),
        ));
    }
    Ok(levels)
}

/// Task ids that transitively depend on `failed_id`.
fn transitive_dependents(failed_id: &str, tasks: &[TaskRow]) -> HashSet<String> {
    let mut dependents = HashSet::new();
    let mut queue = vec![failed_id.to_string()];
    while let Some(current) = queue.pop() {
        for task in tasks {
            if task.depends_on.iter().any(|dep| dep == &current)
                && dependents.insert(task.id.clone())
            {
                queue.push(task.id.clone());
            }
        }
    }
    dependents
}

fn stringify_for_inline(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `{{task:ID.FIELD}}` placeholders with earlier task outputs.
///
/// A string that is exactly one placeholder resolves to the referenced value
/// with its original type; a placeholder embedded in a larger string is
/// stringified in place. Unresolved references become the empty string.
fn resolve_task_refs(value: &Value, outputs: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = TASK_REF_FULL_RE.captures(s) {
                return outputs
                    .get(&caps[1])
                    .and_then(|output| output.get(&caps[2]))
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
            }
            let replaced = TASK_REF_RE.replace_all(s, |caps: &regex::Captures<'_>| {
                outputs
                    .get(&caps[1])
                    .and_then(|output| output.get(&caps[2]))
                    .map(stringify_for_inline)
                    .unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_task_refs(v, outputs)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| resolve_task_refs(v, outputs)).collect(),
        ),
        other => other.clone(),
    }
}

/// DAG plan engine: validates plans, persists them, and executes them level
/// by level through the dispatch pipeline.
pub struct PlanEngine {
    db: Arc<Database>,
    hitl: Arc<HitlCoordinator>,
    dispatcher: Arc<Dispatcher>,
}

impl PlanEngine {
    pub fn new(
        db: Arc<Database>,
        hitl: Arc<HitlCoordinator>,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Self> {
        {
            let conn = db.conn()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS plan_plans (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    status TEXT NOT NULL,
                    on_failure TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_plans_name ON plan_plans(name);
                CREATE TABLE IF NOT EXISTS plan_tasks (
                    id TEXT NOT NULL,
                    plan_id TEXT NOT NULL REFERENCES plan_plans(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    tool_category TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    params TEXT NOT NULL,
                    depends_on TEXT NOT NULL,
                    on_failure TEXT,
                    require_hitl INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    output TEXT,
                    error TEXT,
                    started_at TEXT,
                    completed_at TEXT,
                    execution_level INTEGER NOT NULL,
                    PRIMARY KEY (plan_id, id)
                );
                CREATE INDEX IF NOT EXISTS idx_tasks_plan ON plan_tasks(plan_id, execution_level);",
            )?;
        }
        Ok(Self {
            db,
            hitl,
            dispatcher,
        })
    }

    /// Validate and persist a new plan. Rejects empty plans, duplicate task
    /// ids, unknown failure policies, unknown dependencies, and cycles.
    pub fn create(
        &self,
        name: &str,
        tasks: &[TaskSpec],
        plan_policy: &str,
    ) -> Result<CreateResponse, GatewayError> {
        if tasks.is_empty() {
            return Err(GatewayError::InvalidParameter(
                "Plan must contain at least one task".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for task in tasks {
            if !seen.insert(task.id.as_str()) {
                duplicates.push(task.id.clone());
            }
        }
        if !duplicates.is_empty() {
            duplicates.sort();
            duplicates.dedup();
            return Err(GatewayError::InvalidParameter(format!(
                "Duplicate task IDs: {}",
                duplicates.join(", ")
            )));
        }

        let plan_policy = FailurePolicy::parse(plan_policy)?;
        for task in tasks {
            if let Some(raw) = &task.on_failure {
                FailurePolicy::parse(raw).map_err(|_| {
                    GatewayError::InvalidParameter(format!(
                        "Task '{}' has invalid on_failure '{}'",
                        task.id, raw
                    ))
                })?;
            }
        }

        let graph: Vec<(String, Vec<String>)> = tasks
            .iter()
            .map(|t| (t.id.clone(), t.depends_on.clone()))
            .collect();
        let execution_order = compute_execution_levels(&graph)?;
        let mut level_of: HashMap<&str, i64> = HashMap::new();
        for (level, ids) in execution_order.iter().enumerate() {
            for id in ids {
                level_of.insert(id.as_str(), level as i64);
            }
        }

        let plan_id = Uuid::new_v4().to_string();
        let now = now_iso();
        {
            let mut conn = self.db.conn().map_err(GatewayError::Internal)?;
            let tx = conn
                .transaction()
                .map_err(|e| GatewayError::Internal(e.into()))?;
            tx.execute(
                "INSERT INTO plan_plans (id, name, status, on_failure, created_at)
                 VALUES (?1, ?2, 'pending', ?3, ?4)",
                params![plan_id, name, plan_policy.as_str(), now],
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
            for task in tasks {
                let params_json = if task.params.is_null() {
                    "{}".to_string()
                } else {
                    task.params.to_string()
                };
                tx.execute(
                    "INSERT INTO plan_tasks
                        (id, plan_id, name, tool_category, tool_name, params, depends_on,
                         on_failure, require_hitl, status, execution_level)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10)",
                    params![
                        task.id,
                        plan_id,
                        task.name.clone().unwrap_or_else(|| task.id.clone()),
                        task.tool_category,
                        task.tool_name,
                        params_json,
                        serde_json::to_string(&task.depends_on)
                            .unwrap_or_else(|_| "[]".to_string()),
                        task.on_failure,
                        i64::from(task.require_hitl),
                        level_of[task.id.as_str()],
                    ],
                )
                .map_err(|e| GatewayError::Internal(e.into()))?;
            }
            tx.commit().map_err(|e| GatewayError::Internal(e.into()))?;
        }

        info!(plan_id = %plan_id, tasks = tasks.len(), "plan created");
        Ok(CreateResponse {
            plan_id,
            name: name.to_string(),
            task_count: tasks.len(),
            execution_levels: execution_order.len(),
            execution_order,
            created_at: now,
        })
    }

    fn plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
        let on_failure: String = row.get("on_failure")?;
        Ok(PlanRow {
            id: row.get("id")?,
            name: row.get("name")?,
            status: row.get("status")?,
            on_failure: FailurePolicy::parse(&on_failure)
                .unwrap_or(FailurePolicy::Stop),
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Resolve a plan reference by id first, then by unique name. Retries for
    /// `wait` to absorb read-your-write races right after `create`; ambiguous
    /// names are an error, never a guess.
    async fn resolve_plan_reference(
        &self,
        plan_ref: &str,
        wait: Duration,
    ) -> Result<PlanRow, GatewayError> {
        let retry_interval = Duration::from_millis(100);
        let attempts = (wait.as_millis() / retry_interval.as_millis()) as usize + 1;

        for attempt in 0..attempts {
            {
                let conn = self.db.conn().map_err(GatewayError::Internal)?;
                let by_id = conn
                    .query_row(
                        "SELECT * FROM plan_plans WHERE id = ?1",
                        params![plan_ref],
                        Self::plan_row,
                    )
                    .map(Some)
                    .or_else(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => Ok(None),
                        other => Err(GatewayError::Internal(other.into())),
                    })?;
                if let Some(plan) = by_id {
                    return Ok(plan);
                }

                let mut stmt = conn
                    .prepare(
                        "SELECT * FROM plan_plans WHERE name = ?1
                         ORDER BY created_at DESC, id DESC",
                    )
                    .map_err(|e| GatewayError::Internal(e.into()))?;
                let rows = stmt
                    .query_map(params![plan_ref], Self::plan_row)
                    .map_err(|e| GatewayError::Internal(e.into()))?;
                let mut matches = Vec::new();
                for row in rows {
                    matches.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
                }

                if matches.len() == 1 {
                    let resolved = matches.remove(0);
                    info!(
                        plan_reference = plan_ref,
                        resolved_plan_id = %resolved.id,
                        "plan reference resolved by name"
                    );
                    return Ok(resolved);
                }
                if matches.len() > 1 {
                    let sample: Vec<&str> =
                        matches.iter().take(5).map(|p| p.id.as_str()).collect();
                    let extra = matches.len().saturating_sub(sample.len());
                    let extra_text = if extra > 0 {
                        format!(" (+{} more)", extra)
                    } else {
                        String::new()
                    };
                    return Err(GatewayError::Conflict(format!(
                        "Multiple plans named '{}' found (plan_ids: {}{}). \
                         Use the exact plan_id returned by plan_create.",
                        plan_ref,
                        sample.join(", "),
                        extra_text
                    )));
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(retry_interval).await;
            }
        }

        Err(GatewayError::not_found_with_suggestion(
            format!(
                "Plan '{}' not found. Pass the plan_id returned by plan_create.",
                plan_ref
            ),
            "plan_list",
        ))
    }

    fn load_tasks(&self, plan_id: &str) -> Result<Vec<TaskRow>, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM plan_tasks WHERE plan_id = ?1 ORDER BY execution_level, id",
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let rows = stmt
            .query_map(params![plan_id], |row| {
                let params_raw: String = row.get("params")?;
                let depends_raw: String = row.get("depends_on")?;
                let on_failure: Option<String> = row.get("on_failure")?;
                Ok(TaskRow {
                    id: row.get("id")?,
                    tool_category: row.get("tool_category")?,
                    tool_name: row.get("tool_name")?,
                    params: serde_json::from_str(&params_raw)
                        .unwrap_or(Value::Object(serde_json::Map::new())),
                    depends_on: serde_json::from_str(&depends_raw).unwrap_or_default(),
                    on_failure: on_failure.and_then(|raw| FailurePolicy::parse(&raw).ok()),
                    require_hitl: row.get::<_, i64>("require_hitl")? != 0,
                    execution_level: row.get("execution_level")?,
                })
            })
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
        }
        Ok(tasks)
    }

    fn plan_status(&self, plan_id: &str) -> Result<String, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        conn.query_row(
            "SELECT status FROM plan_plans WHERE id = ?1",
            params![plan_id],
            |row| row.get(0),
        )
        .map_err(|e| GatewayError::Internal(e.into()))
    }

    fn set_plan_status(
        &self,
        plan_id: &str,
        status: &str,
        started: bool,
        completed: bool,
    ) -> Result<(), GatewayError> {
        let now = now_iso();
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        if started {
            conn.execute(
                "UPDATE plan_plans SET status = ?1, started_at = ?2 WHERE id = ?3",
                params![status, now, plan_id],
            )
        } else if completed {
            conn.execute(
                "UPDATE plan_plans SET status = ?1, completed_at = ?2 WHERE id = ?3",
                params![status, now, plan_id],
            )
        } else {
            conn.execute(
                "UPDATE plan_plans SET status = ?1 WHERE id = ?2",
                params![status, plan_id],
            )
        }
        .map_err(|e| GatewayError::Internal(e.into()))?;
        Ok(())
    }

    fn update_task(
        &self,
        plan_id: &str,
        task_id: &str,
        status: &str,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), GatewayError> {
        let now = now_iso();
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        if status == "running" {
            conn.execute(
                "UPDATE plan_tasks SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND plan_id = ?3",
                params![now, task_id, plan_id],
            )
        } else {
            conn.execute(
                "UPDATE plan_tasks SET status = ?1, output = ?2, error = ?3, completed_at = ?4
                 WHERE id = ?5 AND plan_id = ?6",
                params![
                    status,
                    output.map(std::string::ToString::to_string),
                    error,
                    now,
                    task_id,
                    plan_id
                ],
            )
        }
        .map_err(|e| GatewayError::Internal(e.into()))?;
        Ok(())
    }

    /// Execute a plan, blocking until every task is terminal. Tasks in the
    /// same level run concurrently; the level joins before the skip-set and
    /// stop flag are re-evaluated for the next one.
    pub async fn execute(&self, plan_ref: &str) -> Result<ExecuteResponse, GatewayError> {
        let plan = self
            .resolve_plan_reference(plan_ref, Duration::from_secs(1))
            .await?;
        let plan_id = plan.id.clone();

        match plan.status.as_str() {
            "running" => {
                return Err(GatewayError::Conflict(format!(
                    "Plan '{}' is already running",
                    plan_id
                )));
            }
            "completed" | "failed" => {
                return Err(GatewayError::Conflict(format!(
                    "Plan '{}' already finished with status '{}'. Create a new plan to re-run.",
                    plan_id, plan.status
                )));
            }
            "cancelled" => {
                return Err(GatewayError::Conflict(format!(
                    "Plan '{}' is cancelled and cannot be executed",
                    plan_id
                )));
            }
            _ => {}
        }

        let all_tasks = self.load_tasks(&plan_id)?;
        let mut levels: BTreeMap<i64, Vec<&TaskRow>> = BTreeMap::new();
        for task in &all_tasks {
            levels.entry(task.execution_level).or_default().push(task);
        }

        self.set_plan_status(&plan_id, "running", true, false)?;
        let started = Instant::now();

        let mut task_outputs: HashMap<String, Value> = HashMap::new();
        let mut skip_ids: HashSet<String> = HashSet::new();
        let mut stop_all = false;

        for level_tasks in levels.values() {
            // Observe external cancellation at the top of each level.
            if self.plan_status(&plan_id)? == "cancelled" {
                break;
            }

            let mut to_run: Vec<&TaskRow> = Vec::new();
            let mut to_skip: Vec<&TaskRow> = Vec::new();
            for &task in level_tasks {
                let blocked = stop_all
                    || skip_ids.contains(&task.id)
                    || task.depends_on.iter().any(|dep| skip_ids.contains(dep));
                if blocked {
                    to_skip.push(task);
                } else {
                    to_run.push(task);
                }
            }

            for task in &to_skip {
                self.update_task(&plan_id, &task.id, "skipped", None, None)?;
            }
            if to_run.is_empty() {
                continue;
            }

            let results = join_all(
                to_run
                    .iter()
                    .map(|task| self.execute_task(&plan_id, task, &task_outputs)),
            )
            .await;

            for (task, result) in to_run.iter().zip(results) {
                match result {
                    Ok(output) => {
                        task_outputs.insert(task.id.clone(), output);
                    }
                    Err(_) => {
                        let effective = task.on_failure.unwrap_or(plan.on_failure);
                        match effective {
                            FailurePolicy::Stop => {
                                stop_all = true;
                                skip_ids.insert(task.id.clone());
                            }
                            FailurePolicy::SkipDependents => {
                                skip_ids.extend(transitive_dependents(&task.id, &all_tasks));
                            }
                            FailurePolicy::Continue => {}
                        }
                    }
                }
            }
        }

        let (tasks_completed, tasks_failed, tasks_skipped) = {
            let conn = self.db.conn().map_err(GatewayError::Internal)?;
            let mut stmt = conn
                .prepare(
                    "SELECT status, COUNT(*) FROM plan_tasks WHERE plan_id = ?1 GROUP BY status",
                )
                .map_err(|e| GatewayError::Internal(e.into()))?;
            let rows = stmt
                .query_map(params![plan_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| GatewayError::Internal(e.into()))?;
            let mut counts: HashMap<String, i64> = HashMap::new();
            for row in rows {
                let (status, count) = row.map_err(|e| GatewayError::Internal(e.into()))?;
                counts.insert(status, count);
            }
            (
                counts.get("completed").copied().unwrap_or(0),
                counts.get("failed").copied().unwrap_or(0),
                counts.get("skipped").copied().unwrap_or(0),
            )
        };

        let final_status = if self.plan_status(&plan_id)? == "cancelled" {
            "cancelled".to_string()
        } else {
            let status = if tasks_failed == 0 { "completed" } else { "failed" };
            self.set_plan_status(&plan_id, status, false, true)?;
            status.to_string()
        };

        let duration_ms = started.elapsed().as_millis() as i64;
        info!(
            plan_id = %plan_id,
            status = %final_status,
            completed = tasks_completed,
            failed = tasks_failed,
            skipped = tasks_skipped,
            duration_ms,
            "plan executed"
        );

        Ok(ExecuteResponse {
            plan_id,
            status: final_status,
            tasks_completed,
            tasks_failed,
            tasks_skipped,
            duration_ms,
        })
    }

    /// Run one task: resolve references, honour its HITL gate, dispatch, and
    /// persist the terminal status.
    async fn execute_task(
        &self,
        plan_id: &str,
        task: &TaskRow,
        task_outputs: &HashMap<String, Value>,
    ) -> Result<Value, GatewayError> {
        let resolved_params = resolve_task_refs(&task.params, task_outputs);

        if task.require_hitl {
            let request = self
                .hitl
                .create(
                    &task.tool_category,
                    &task.tool_name,
                    resolved_params.clone(),
                    serde_json::json!({"plan_id": plan_id, "task_id": task.id}),
                    "plan_task_require_hitl",
                    None,
                )
                .await?;
            match self.hitl.wait(&request.id, None).await? {
                HitlDecision::Approved => {}
                HitlDecision::Rejected => {
                    let message = "Task rejected via HITL";
                    self.update_task(plan_id, &task.id, "failed", None, Some(message))?;
                    return Err(GatewayError::Security(message.to_string()));
                }
                HitlDecision::Expired => {
                    let message = "HITL approval timed out";
                    self.update_task(plan_id, &task.id, "failed", None, Some(message))?;
                    return Err(GatewayError::Timeout(message.to_string()));
                }
            }
        }

        self.update_task(plan_id, &task.id, "running", None, None)?;

        let mut ctx = InvocationContext::new("plan");
        ctx.metadata
            .insert("plan_id".to_string(), Value::String(plan_id.to_string()));
        ctx.metadata
            .insert("task_id".to_string(), Value::String(task.id.clone()));

        match self
            .dispatcher
            .dispatch(
                &task.tool_category,
                &task.tool_name,
                resolved_params,
                &ctx,
                false,
                None,
            )
            .await
        {
            Ok(output) => {
                let output = if output.is_object() {
                    output
                } else {
                    serde_json::json!({"result": stringify_for_inline(&output)})
                };
                self.update_task(plan_id, &task.id, "completed", Some(&output), None)?;
                Ok(output)
            }
            Err(err) => {
                self.update_task(plan_id, &task.id, "failed", None, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Full plan snapshot with live per-task state.
    pub async fn status(&self, plan_ref: &str) -> Result<StatusResponse, GatewayError> {
        let plan = self
            .resolve_plan_reference(plan_ref, Duration::ZERO)
            .await?;

        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM plan_tasks WHERE plan_id = ?1 ORDER BY execution_level, id",
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let rows = stmt
            .query_map(params![plan.id], |row| {
                let depends_raw: String = row.get("depends_on")?;
                let output_raw: Option<String> = row.get("output")?;
                Ok(TaskStatus {
                    id: row.get("id")?,
                    name: row.get("name")?,
                    tool_category: row.get("tool_category")?,
                    tool_name: row.get("tool_name")?,
                    status: row.get("status")?,
                    output: output_raw.and_then(|raw| serde_json::from_str(&raw).ok()),
                    error: row.get("error")?,
                    started_at: row.get("started_at")?,
                    completed_at: row.get("completed_at")?,
                    depends_on: serde_json::from_str(&depends_raw).unwrap_or_default(),
                    execution_level: row.get("execution_level")?,
                })
            })
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
        }

        let count = |status: &str| tasks.iter().filter(|t| t.status == status).count();
        Ok(StatusResponse {
            plan_id: plan.id,
            name: plan.name,
            status: plan.status,
            on_failure: plan.on_failure.as_str().to_string(),
            created_at: plan.created_at,
            started_at: plan.started_at,
            completed_at: plan.completed_at,
            tasks_total: tasks.len(),
            tasks_completed: count("completed"),
            tasks_failed: count("failed"),
            tasks_skipped: count("skipped"),
            tasks_running: count("running"),
            tasks,
        })
    }

    /// Summaries of every plan, newest first.
    pub fn list(&self) -> Result<ListResponse, GatewayError> {
        let conn = self.db.conn().map_err(GatewayError::Internal)?;
        let mut stmt = conn
            .prepare(
                "SELECT p.*,
                        (SELECT COUNT(*) FROM plan_tasks t WHERE t.plan_id = p.id) AS task_count
                 FROM plan_plans p
                 ORDER BY p.created_at DESC, p.rowid DESC",
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let rows = stmt
            .query_map([], |row| {
                let on_failure: String = row.get("on_failure")?;
                Ok(ListItem {
                    plan_id: row.get("id")?,
                    name: row.get("name")?,
                    status: row.get("status")?,
                    on_failure,
                    task_count: row.get("task_count")?,
                    created_at: row.get("created_at")?,
                    started_at: row.get("started_at")?,
                    completed_at: row.get("completed_at")?,
                })
            })
            .map_err(|e| GatewayError::Internal(e.into()))?;
        let mut plans = Vec::new();
        for row in rows {
            plans.push(row.map_err(|e| GatewayError::Internal(e.into()))?);
        }
        let total = plans.len();
        Ok(ListResponse { plans, total })
    }

    /// Cancel a pending or running plan: every non-terminal task becomes
    /// `skipped`, the plan `cancelled`. In-flight tasks are not interrupted;
    /// the executor observes the change at its next level boundary.
    pub async fn cancel(&self, plan_ref: &str) -> Result<CancelResponse, GatewayError> {
        let plan = self
            .resolve_plan_reference(plan_ref, Duration::ZERO)
            .await?;

        if !matches!(plan.status.as_str(), "pending" | "running") {
            return Err(GatewayError::Conflict(format!(
                "Plan '{}' is already '{}' and cannot be cancelled",
                plan.id, plan.status
            )));
        }

        let now = now_iso();
        let cancelled_tasks = {
            let conn = self.db.conn().map_err(GatewayError::Internal)?;
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM plan_tasks
                     WHERE plan_id = ?1 AND status IN ('pending', 'running')",
                    params![plan.id],
                    |row| row.get(0),
                )
                .map_err(|e| GatewayError::Internal(e.into()))?;
            conn.execute(
                "UPDATE plan_tasks SET status = 'skipped', completed_at = ?1
                 WHERE plan_id = ?2 AND status IN ('pending', 'running')",
                params![now, plan.id],
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
            conn.execute(
                "UPDATE plan_plans SET status = 'cancelled', completed_at = ?1 WHERE id = ?2",
                params![now, plan.id],
            )
            .map_err(|e| GatewayError::Internal(e.into()))?;
            count
        };

        info!(plan_id = %plan.id, cancelled_tasks, "plan cancelled");
        Ok(CancelResponse {
            plan_id: plan.id,
            cancelled_tasks,
            status: "cancelled".to_string(),
        })
    }
}

#[cfg(test)]
mod tests;
