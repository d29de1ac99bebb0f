use crate::audit::TS_FORMAT;
use crate::db::Database;
use crate::errors::GatewayError;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::BoxFuture;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HitlStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl HitlStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// Outcome a waiter observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlDecision {
    Approved,
    Rejected,
    Expired,
}

/// One approval request. The status is monotonic: exactly one transition out
/// of `pending`, and reviewer fields are set only on decided (not expired)
/// requests.
#[derive(Debug, Clone, Serialize)]
pub struct HitlRequest {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub tool_category: String,
    pub tool_name: String,
    pub request_params: Value,
    pub request_context: Value,
    pub policy_rule_matched: String,
    pub status: HitlStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reviewer_note: Option<String>,
    pub ttl_seconds: u64,
}

/// Event kinds delivered to registered watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlEventKind {
    /// A new request was created.
    Request,
    /// An existing request changed state.
    Update,
}

impl HitlEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "hitl_request",
            Self::Update => "hitl_update",
        }
    }
}

/// Broadcast sink. Failures are logged and absorbed — a broken watcher must
/// never block or drop a state transition.
pub type Watcher =
    Arc<dyn Fn(HitlEventKind, Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct RequestEntry {
    request: HitlRequest,
    notify: Arc<Notify>,
}

/// Request/decision rendezvous for human-in-the-loop approvals.
///
/// Every request gets a persistent row (terminal state survives restart)
/// and an in-memory record carrying the completion handle that `wait`
/// blocks on. A background sweep expires overdue requests and evicts old
/// terminal records from memory.
pub struct HitlCoordinator {
    db: Arc<Database>,
    default_ttl: u64,
    retention: Duration,
    requests: Mutex<HashMap<String, RequestEntry>>,
    watchers: Mutex<Vec<Watcher>>,
    cleanup_handle: Mutex<Option<JoinHandle<()>>>,
}

impl HitlCoordinator {
    pub fn new(db: Arc<Database>, default_ttl: u64, retention_seconds: u64) -> Result<Self> {
        {
            let conn = db.conn()?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS hitl_requests (
                    id TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL,
                    tool_category TEXT NOT NULL,
                    tool_name TEXT NOT NULL,
                    request_params TEXT NOT NULL,
                    request_context TEXT NOT NULL,
                    policy_rule_matched TEXT NOT NULL,
                    status TEXT NOT NULL,
                    reviewed_by TEXT,
                    reviewed_at TEXT,
                    reviewer_note TEXT,
                    ttl_seconds INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_hitl_status ON hitl_requests(status);
                CREATE INDEX IF NOT EXISTS idx_hitl_created ON hitl_requests(created_at DESC);",
            )?;
        }
        Ok(Self {
            db,
            default_ttl,
            retention: Duration::from_secs(retention_seconds),
            requests: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            cleanup_handle: Mutex::new(None),
        })
    }

    /// Spawn the background expiry sweep.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let coordinator = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.sweep().await;
            }
        });
        if let Some(old) = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle)
        {
            old.abort();
        }
        info!(default_ttl = self.default_ttl, "hitl coordinator started");
    }

    pub fn stop(&self) {
        if let Some(handle) = self
            .cleanup_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        info!("hitl coordinator stopped");
    }

    pub fn register_watcher(&self, watcher: Watcher) {
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(watcher);
    }

    async fn broadcast(&self, kind: HitlEventKind, request: &HitlRequest) {
        let payload = match serde_json::to_value(request) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize hitl event payload");
                return;
            }
        };
        let watchers: Vec<Watcher> = self
            .watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        for watcher in watchers {
            if let Err(e) = watcher(kind, payload.clone()).await {
                error!(error = %e, event = kind.as_str(), "hitl watcher notification failed");
            }
        }
    }

    /// Create a new pending request, persist it, and broadcast `hitl_request`.
    pub async fn create(
        &self,
        category: &str,
        name: &str,
        params: Value,
        context: Value,
        policy_rule: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<HitlRequest, GatewayError> {
        let request = HitlRequest {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            tool_category: category.to_string(),
            tool_name: name.to_string(),
            request_params: params,
            request_context: context,
            policy_rule_matched: policy_rule.to_string(),
            status: HitlStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            reviewer_note: None,
            ttl_seconds: ttl_seconds.unwrap_or(self.default_ttl),
        };

        self.persist_insert(&request).map_err(GatewayError::Internal)?;
        {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            requests.insert(
                request.id.clone(),
                RequestEntry {
                    request: request.clone(),
                    notify: Arc::new(Notify::new()),
                },
            );
        }

        info!(
            request_id = %request.id,
            tool = %format!("{}_{}", category, name),
            ttl = request.ttl_seconds,
            "hitl request created"
        );
        self.broadcast(HitlEventKind::Request, &request).await;
        Ok(request)
    }

    /// Block until the request is decided or its TTL elapses.
    ///
    /// On timeout the request atomically transitions to `expired`; a decision
    /// racing the deadline wins if it lands first.
    pub async fn wait(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> Result<HitlDecision, GatewayError> {
        let (notify, ttl) = {
            let requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = requests.get(request_id).ok_or_else(|| {
                GatewayError::InvalidParameter(format!("HITL request {} not found", request_id))
            })?;
            (
                Arc::clone(&entry.notify),
                Duration::from_secs(entry.request.ttl_seconds),
            )
        };
        let timeout = timeout.unwrap_or(ttl);

        match tokio::time::timeout(timeout, notify.notified()).await {
            Ok(()) => {
                let status = self.status_of(request_id)?;
                match status {
                    HitlStatus::Approved => {
                        info!(request_id, "hitl approved");
                        Ok(HitlDecision::Approved)
                    }
                    HitlStatus::Rejected => {
                        info!(request_id, "hitl rejected");
                        Ok(HitlDecision::Rejected)
                    }
                    other => {
                        warn!(request_id, status = other.as_str(), "hitl unexpected status");
                        Ok(HitlDecision::Expired)
                    }
                }
            }
            Err(_) => {
                // Deadline passed. Expire unless a decision won the race.
                match self.expire(request_id).await? {
                    Some(decided) => Ok(decided),
                    None => {
                        info!(request_id, "hitl expired");
                        Ok(HitlDecision::Expired)
                    }
                }
            }
        }
    }

    /// Approve a pending request.
    pub async fn approve(
        &self,
        request_id: &str,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<HitlRequest, GatewayError> {
        self.decide(request_id, HitlStatus::Approved, reviewer, note)
            .await
    }

    /// Reject a pending request.
    pub async fn reject(
        &self,
        request_id: &str,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<HitlRequest, GatewayError> {
        self.decide(request_id, HitlStatus::Rejected, reviewer, note)
            .await
    }

    async fn decide(
        &self,
        request_id: &str,
        status: HitlStatus,
        reviewer: &str,
        note: Option<String>,
    ) -> Result<HitlRequest, GatewayError> {
        let (request, notify) = {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let entry = requests.get_mut(request_id).ok_or_else(|| {
                GatewayError::InvalidParameter(format!("HITL request {} not found", request_id))
            })?;
            if entry.request.status != HitlStatus::Pending {
                return Err(GatewayError::InvalidParameter(format!(
                    "HITL request {} is not pending (status: {})",
                    request_id,
                    entry.request.status.as_str()
                )));
            }
            entry.request.status = status;
            entry.request.reviewed_by = Some(reviewer.to_string());
            entry.request.reviewed_at = Some(Utc::now());
            entry.request.reviewer_note = note;
            (entry.request.clone(), Arc::clone(&entry.notify))
        };

        self.persist_update(&request).map_err(GatewayError::Internal)?;
        notify.notify_one();

        info!(request_id, reviewer, status = status.as_str(), "hitl request decided");
        self.broadcast(HitlEventKind::Update, &request).await;
        Ok(request)
    }

    /// Transition a pending request to `expired`. Returns the decision a
    /// racing reviewer made, if one already landed.
    async fn expire(&self, request_id: &str) -> Result<Option<HitlDecision>, GatewayError> {
        let request = {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let Some(entry) = requests.get_mut(request_id) else {
                return Ok(None);
            };
            match entry.request.status {
                HitlStatus::Pending => {
                    entry.request.status = HitlStatus::Expired;
                    entry.request.clone()
                }
                HitlStatus::Approved => return Ok(Some(HitlDecision::Approved)),
                HitlStatus::Rejected => return Ok(Some(HitlDecision::Rejected)),
                HitlStatus::Expired => return Ok(None),
            }
        };

        self.persist_update(&request).map_err(GatewayError::Internal)?;
        self.broadcast(HitlEventKind::Update, &request).await;
        Ok(None)
    }

    /// Snapshot of all pending requests.
    pub fn pending(&self) -> Vec<HitlRequest> {
        let requests = self
            .requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut pending: Vec<HitlRequest> = requests
            .values()
            .filter(|e| e.request.status == HitlStatus::Pending)
            .map(|e| e.request.clone())
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        pending
    }

    /// A request by id, if still held in memory.
    pub fn get(&self, request_id: &str) -> Option<HitlRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(request_id)
            .map(|e| e.request.clone())
    }

    /// One pass of the background sweep: expire overdue pending requests,
    /// evict terminal records past the retention window. Persistent rows
    /// are never deleted.
    pub async fn sweep(&self) {
        let now = Utc::now();
        let (overdue, evict): (Vec<String>, Vec<String>) = {
            let requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let overdue = requests
                .values()
                .filter(|e| {
                    e.request.status == HitlStatus::Pending
                        && e.request.created_at
                            + ChronoDuration::seconds(e.request.ttl_seconds as i64)
                            <= now
                })
                .map(|e| e.request.id.clone())
                .collect();
            let cutoff = now
                - ChronoDuration::from_std(self.retention).unwrap_or_else(|_| ChronoDuration::hours(1));
            let evict = requests
                .values()
                .filter(|e| e.request.status.is_terminal() && e.request.created_at < cutoff)
                .map(|e| e.request.id.clone())
                .collect();
            (overdue, evict)
        };

        for request_id in &overdue {
            if let Err(e) = self.expire(request_id).await {
                error!(request_id, error = %e, "hitl cleanup failed to expire request");
            }
        }

        if !evict.is_empty() {
            let mut requests = self
                .requests
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for request_id in &evict {
                requests.remove(request_id);
            }
        }

        if !overdue.is_empty() || !evict.is_empty() {
            info!(expired = overdue.len(), removed = evict.len(), "hitl cleanup");
        }
    }

    fn persist_insert(&self, request: &HitlRequest) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO hitl_requests (
                id, created_at, tool_category, tool_name, request_params,
                request_context, policy_rule_matched, status, ttl_seconds
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                request.id,
                request.created_at.format(TS_FORMAT).to_string(),
                request.tool_category,
                request.tool_name,
                request.request_params.to_string(),
                request.request_context.to_string(),
                request.policy_rule_matched,
                request.status.as_str(),
                request.ttl_seconds as i64,
            ],
        )?;
        Ok(())
    }

    fn persist_update(&self, request: &HitlRequest) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE hitl_requests
             SET status = ?1, reviewed_by = ?2, reviewed_at = ?3, reviewer_note = ?4
             WHERE id = ?5",
            params![
                request.status.as_str(),
                request.reviewed_by,
                request
                    .reviewed_at
                    .map(|t| t.format(TS_FORMAT).to_string()),
                request.reviewer_note,
                request.id,
            ],
        )?;
        Ok(())
    }

    /// Persisted status for a request id, used by tests and the admin surface.
    pub fn persisted_status(&self, request_id: &str) -> Result<Option<String>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare("SELECT status FROM hitl_requests WHERE id = ?1")?;
        let mut rows = stmt.query(params![request_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn status_of(&self, request_id: &str) -> Result<HitlStatus, GatewayError> {
        let requests = self
            .requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        requests
            .get(request_id)
            .map(|e| e.request.status)
            .ok_or_else(|| {
                GatewayError::InvalidParameter(format!("HITL request {} not found", request_id))
            })
    }

    pub fn default_ttl(&self) -> u64 {
        self.default_ttl
    }
}

#[cfg(test)]
mod tests;
