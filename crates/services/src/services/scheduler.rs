//! Fleet sweep: run a pipeline once per schedulable workspace, under the
//! per-workspace lock. A held lock or an ineligible mode skips the
//! workspace; pipeline failure is contained to that workspace's entry in
//! the summary and never aborts the sweep.

use std::sync::Arc;

use async_trait::async_trait;
use db::{DBService, models::workspace::Workspace};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::events::{EventSink, emit_best_effort};
use super::locks::LockManager;
use super::modes::{ModeError, ModeService};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Workspace(#[from] db::models::workspace::WorkspaceError),
}

pub struct PipelineContext {
    pub workspace: Workspace,
    pub db: DBService,
}

/// Unit of per-workspace work driven by the sweep. Implementations must
/// be safe to re-run; the lock guarantees no concurrent run for the same
/// workspace, not that a run happens exactly once.
#[async_trait]
pub trait WorkspacePipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        ctx: &PipelineContext,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Executed,
    SkippedLocked,
    SkippedMode,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRun {
    pub workspace_id: Uuid,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepSummary {
    pub total_active_workspaces: usize,
    pub executed: usize,
    pub skipped_locked: usize,
    pub skipped_mode: usize,
    pub failed: usize,
    pub runs: Vec<WorkspaceRun>,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// When set, the sweep only considers this workspace.
    pub primary_workspace: Option<Uuid>,
}

pub struct WorkspaceScheduler {
    db: DBService,
    locks: LockManager,
    modes: ModeService,
    events: Arc<dyn EventSink>,
    config: SchedulerConfig,
}

impl WorkspaceScheduler {
    pub fn new(
        db: DBService,
        locks: LockManager,
        modes: ModeService,
        events: Arc<dyn EventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            locks,
            modes,
            events,
            config,
        }
    }

    pub async fn sweep(
        &self,
        pipeline: &dyn WorkspacePipeline,
        limit: Option<usize>,
    ) -> Result<SweepSummary, SchedulerError> {
        let mut workspaces = Workspace::find_schedulable(&self.db.pool).await?;
        if let Some(primary) = self.config.primary_workspace {
            workspaces.retain(|w| w.id == primary);
        }
        let total_active_workspaces = workspaces.len();
        if let Some(limit) = limit {
            workspaces.truncate(limit);
        }

        let mut summary = SweepSummary {
            total_active_workspaces,
            executed: 0,
            skipped_locked: 0,
            skipped_mode: 0,
            failed: 0,
            runs: Vec::with_capacity(workspaces.len()),
        };

        for workspace in workspaces {
            let run = self.run_one(pipeline, workspace).await;
            match run.outcome {
                RunOutcome::Executed => summary.executed += 1,
                RunOutcome::SkippedLocked => summary.skipped_locked += 1,
                RunOutcome::SkippedMode => summary.skipped_mode += 1,
                RunOutcome::Failed => summary.failed += 1,
            }
            summary.runs.push(run);
        }

        info!(
            pipeline = pipeline.name(),
            executed = summary.executed,
            skipped_locked = summary.skipped_locked,
            skipped_mode = summary.skipped_mode,
            failed = summary.failed,
            "scheduler sweep complete"
        );
        Ok(summary)
    }

    async fn run_one(&self, pipeline: &dyn WorkspacePipeline, workspace: Workspace) -> WorkspaceRun {
        let workspace_id = workspace.id;
        let run = self.run_guarded(pipeline, workspace).await;

        emit_best_effort(
            self.events.as_ref(),
            Some(workspace_id),
            "scheduler_run",
            &json!({
                "pipeline": pipeline.name(),
                "outcome": run.outcome,
                "error": run.error,
            }),
        )
        .await;

        run
    }

    async fn run_guarded(
        &self,
        pipeline: &dyn WorkspacePipeline,
        workspace: Workspace,
    ) -> WorkspaceRun {
        let workspace_id = workspace.id;

        let eligible = match self.eligibility(workspace_id).await {
            Ok(eligible) => eligible,
            // Mode lookup failure fails this workspace only.
            Err(e) => {
                error!(%workspace_id, error = %e, "mode lookup failed");
                return WorkspaceRun {
                    workspace_id,
                    outcome: RunOutcome::Failed,
                    error: Some(e.to_string()),
                };
            }
        };
        if !eligible {
            return WorkspaceRun {
                workspace_id,
                outcome: RunOutcome::SkippedMode,
                error: None,
            };
        }

        let handle = match self.locks.acquire(workspace_id).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                return WorkspaceRun {
                    workspace_id,
                    outcome: RunOutcome::SkippedLocked,
                    error: None,
                };
            }
            Err(e) => {
                error!(%workspace_id, error = %e, "lock acquisition failed");
                return WorkspaceRun {
                    workspace_id,
                    outcome: RunOutcome::Failed,
                    error: Some(e.to_string()),
                };
            }
        };

        let ctx = PipelineContext {
            workspace,
            db: self.db.clone(),
        };
        let result = pipeline.run(&ctx).await;

        // Release before reporting so a panic-free failure path never
        // leaves the workspace locked until TTL expiry.
        match self.locks.release(&handle).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(%workspace_id, "lock expired during pipeline run")
            }
            Err(e) => warn!(%workspace_id, error = %e, "lock release failed"),
        }

        match result {
            Ok(_) => WorkspaceRun {
                workspace_id,
                outcome: RunOutcome::Executed,
                error: None,
            },
            Err(e) => {
                error!(%workspace_id, pipeline = pipeline.name(), error = %e, "pipeline failed");
                WorkspaceRun {
                    workspace_id,
                    outcome: RunOutcome::Failed,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn eligibility(&self, workspace_id: Uuid) -> Result<bool, ModeError> {
        if self.modes.is_paused(workspace_id).await? {
            return Ok(false);
        }
        Ok(self.modes.current(workspace_id).await?.allows_scheduling())
    }
}
