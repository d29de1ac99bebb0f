use crate::audit::AuditLog;
use crate::config::Config;
use crate::db::Database;
use crate::dispatch::Dispatcher;
use crate::hitl::HitlCoordinator;
use crate::memory::KnowledgeGraph;
use crate::plan::PlanEngine;
use crate::policy::PolicyEngine;
use crate::secrets::SecretStore;
use crate::tools::fs::{FsListTool, FsReadTool, FsSearchTool, FsWriteTool};
use crate::tools::http::HttpRequestTool;
use crate::tools::memory::MemoryTool;
use crate::tools::registry::ToolRegistry;
use crate::tools::shell::ShellExecuteTool;
use crate::tools::workspace_tool::WorkspaceInfoTool;
use crate::workspace::WorkspaceManager;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The wired-up gateway: every component built from one `Config`, with the
/// tool catalog populated and the dispatch pipeline ready.
pub struct Gateway {
    pub workspace: Arc<WorkspaceManager>,
    pub secrets: Arc<SecretStore>,
    pub audit: Arc<AuditLog>,
    pub hitl: Arc<HitlCoordinator>,
    pub graph: Arc<KnowledgeGraph>,
    pub dispatcher: Arc<Dispatcher>,
    pub plans: Arc<PlanEngine>,
    cleanup_interval: Duration,
}

impl Gateway {
    pub fn new(config: &Config) -> Result<Self> {
        let workspace = Arc::new(
            WorkspaceManager::new(&config.workspace.root)
                .context("failed to initialise workspace")?,
        );
        let secrets = Arc::new(SecretStore::new(&config.secrets.file));
        let db = Arc::new(Database::open(&config.database.path)?);
        let audit = Arc::new(AuditLog::new(Arc::clone(&db), Arc::clone(&secrets))?);
        let hitl = Arc::new(HitlCoordinator::new(
            Arc::clone(&db),
            config.hitl.default_ttl_seconds,
            config.hitl.retention_seconds,
        )?);
        let graph = Arc::new(KnowledgeGraph::new(Arc::clone(&db))?);
        let policy = Arc::new(PolicyEngine::new(&config.tools)?);

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FsReadTool::new(Arc::clone(&workspace))));
        registry.register(Arc::new(FsWriteTool::new(Arc::clone(&workspace))));
        registry.register(Arc::new(FsListTool::new(Arc::clone(&workspace))));
        registry.register(Arc::new(FsSearchTool::new(Arc::clone(&workspace))));
        registry.register(Arc::new(ShellExecuteTool::new(
            Arc::clone(&workspace),
            config.shell.timeout,
        )));
        registry.register(Arc::new(HttpRequestTool::new(config.http.timeout)?));
        registry.register(Arc::new(WorkspaceInfoTool::new(Arc::clone(&workspace))));
        MemoryTool::register_all(&mut registry, &graph);

        let dispatcher = Arc::new(Dispatcher::new(
            policy,
            Arc::clone(&hitl),
            Arc::clone(&secrets),
            Arc::clone(&audit),
            Arc::new(registry),
            workspace.base_dir().to_string_lossy().to_string(),
        ));
        let plans = Arc::new(PlanEngine::new(
            Arc::clone(&db),
            Arc::clone(&hitl),
            Arc::clone(&dispatcher),
        )?);

        info!(
            workspace = %workspace.base_dir().display(),
            tools = dispatcher.registry().len(),
            "gateway initialised"
        );

        Ok(Self {
            workspace,
            secrets,
            audit,
            hitl,
            graph,
            dispatcher,
            plans,
            cleanup_interval: Duration::from_secs(config.hitl.cleanup_interval_seconds),
        })
    }

    /// Start background tasks (the HITL expiry sweep).
    pub fn start(&self) {
        self.hitl.start(self.cleanup_interval);
    }

    pub fn stop(&self) {
        self.hitl.stop();
    }
}
