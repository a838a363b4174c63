//! One-shot scheduler sweep. Each invocation walks the schedulable
//! workspaces, runs the queue executor for every workspace it can lock,
//! and prints the sweep summary as JSON on stdout.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use db::DBService;
use services::services::{
    cache::MemoryKv,
    channels::{ChannelRegistry, CredentialError, CredentialProvider},
    events::DbEventSink,
    killswitch::KillSwitch,
    locks::LockManager,
    modes::ModeService,
    plans::{PlanCatalog, PlanLimiter},
    publisher::{PublishConfig, PublishEngine},
    queue::{ApprovalQueueService, QueueConfig},
    scheduler::{
        PipelineContext, SchedulerConfig, WorkspacePipeline, WorkspaceScheduler,
    },
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

/// Run one scheduler sweep across all schedulable workspaces.
#[derive(Parser)]
#[command(name = "run-scheduler")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Sweep at most this many workspaces
    #[arg(long)]
    limit: Option<usize>,

    /// SQLite database location
    #[arg(long, env = "ORCHESTRATOR_DATABASE_URL", default_value = "sqlite://orchestrator.db")]
    database_url: String,

    /// Key namespace for locks, mode cache and the kill switch
    #[arg(long, env = "ORCHESTRATOR_NAMESPACE", default_value = "orchestrator")]
    namespace: String,

    /// Restrict the sweep to a single workspace
    #[arg(long, env = "ORCHESTRATOR_PRIMARY_WORKSPACE")]
    primary_workspace: Option<Uuid>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

/// Upstream token from the environment; absent means every publish is
/// blocked at the credential gate rather than attempted.
struct EnvCredentials;

#[async_trait]
impl CredentialProvider for EnvCredentials {
    async fn access_token(&self, _workspace_id: Uuid) -> Result<Option<String>, CredentialError> {
        Ok(std::env::var("ORCHESTRATOR_ACCESS_TOKEN")
            .ok()
            .filter(|token| !token.is_empty()))
    }
}

/// Per-workspace unit the sweep runs under the scheduler lock: one pass
/// of the due-item executor.
struct QueueExecutorPipeline {
    queue: ApprovalQueueService,
}

#[async_trait]
impl WorkspacePipeline for QueueExecutorPipeline {
    fn name(&self) -> &str {
        "queue-executor"
    }

    async fn run(
        &self,
        ctx: &PipelineContext,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        let summary = self.queue.run_due(ctx.workspace.id, Utc::now()).await?;
        Ok(serde_json::to_value(summary)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("run_scheduler={log_level},services={log_level},warn").into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let db = DBService::new(&cli.database_url)
        .await
        .with_context(|| format!("opening database at {}", cli.database_url))?;

    let kv = Arc::new(MemoryKv::new());
    let locks = LockManager::new(kv.clone(), &cli.namespace);
    let modes = ModeService::new(db.clone(), kv.clone(), &cli.namespace);
    let kill = KillSwitch::new(kv.clone(), &cli.namespace);
    let limiter = PlanLimiter::new(db.clone(), PlanCatalog::builtin());
    let events = Arc::new(DbEventSink::new(db.clone()));

    // No channel clients wired here: due items pass admission up to the
    // channel gate and stay scheduled, so a dry sweep is always safe.
    let engine = PublishEngine::new(
        db.clone(),
        modes.clone(),
        limiter,
        ChannelRegistry::new(),
        Arc::new(EnvCredentials),
        kill,
        PublishConfig::default(),
    );
    let queue = ApprovalQueueService::new(
        db.clone(),
        engine,
        events.clone(),
        QueueConfig::default(),
    );
    let pipeline = QueueExecutorPipeline { queue };

    let scheduler = WorkspaceScheduler::new(
        db,
        locks,
        modes,
        events,
        SchedulerConfig {
            primary_workspace: cli.primary_workspace,
        },
    );

    // Individual workspace failures are in the summary, not the exit
    // code; only startup errors are fatal.
    let summary = scheduler.sweep(&pipeline, cli.limit).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
