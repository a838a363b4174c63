//! Operator command surface. Every verb is a pure request to response
//! operation; internal errors become failed responses, never panics, and
//! every failed response is recorded as a `command_error` event so the
//! stability guard can see operator friction.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        pipeline_run::PipelineRun,
        queue_item::QueueItem,
        workspace::Workspace,
        workspace_mode::OperationalMode,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info};
use uuid::Uuid;

use super::events::{EventSink, emit_best_effort};
use super::killswitch::KillSwitch;
use super::locks::{LockHandle, LockManager};
use super::modes::{AUTONOMOUS_CONFIRM_TOKEN, ModeError, ModeService};
use super::queue::ApprovalQueueService;
use super::scheduler::{PipelineContext, WorkspacePipeline};
use super::stability::StabilityGuard;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl CommandResponse {
    fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    fn failed(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }
}

pub struct CommandService {
    db: DBService,
    locks: LockManager,
    modes: ModeService,
    kill_switch: KillSwitch,
    queue: ApprovalQueueService,
    guard: Arc<StabilityGuard>,
    events: Arc<dyn EventSink>,
    pipelines: HashMap<String, Arc<dyn WorkspacePipeline>>,
}

impl CommandService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DBService,
        locks: LockManager,
        modes: ModeService,
        kill_switch: KillSwitch,
        queue: ApprovalQueueService,
        guard: Arc<StabilityGuard>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            db,
            locks,
            modes,
            kill_switch,
            queue,
            guard,
            events,
            pipelines: HashMap::new(),
        }
    }

    pub fn register_pipeline(&mut self, pipeline: Arc<dyn WorkspacePipeline>) {
        self.pipelines.insert(pipeline.name().to_string(), pipeline);
    }

    /// `/run <pipeline>`: idempotency-keyed, serialized by the pipeline
    /// lock. A retried key returns the prior run instead of starting a
    /// second one.
    pub async fn run(
        &self,
        workspace_id: Uuid,
        pipeline_name: &str,
        idempotency_key: &str,
    ) -> CommandResponse {
        let Some(pipeline) = self.pipelines.get(pipeline_name).cloned() else {
            return self
                .fail(Some(workspace_id), format!("unknown pipeline: {pipeline_name}"), Value::Null)
                .await;
        };

        let handle = match self.locks.acquire_pipeline(workspace_id, pipeline_name).await {
            Ok(Some(handle)) => handle,
            // Contention is a normal skip, not an operator error. No run
            // row exists yet, so the key stays free for a later retry.
            Ok(None) => {
                return CommandResponse::failed(
                    format!("{pipeline_name} is already running for this workspace"),
                    json!({ "skipped": "locked" }),
                );
            }
            Err(e) => return self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        };

        let (run, started) = match PipelineRun::start_or_get(
            &self.db.pool,
            workspace_id,
            pipeline_name,
            idempotency_key,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                self.release_pipeline_lock(workspace_id, pipeline_name, &handle).await;
                return self.fail(Some(workspace_id), e.to_string(), Value::Null).await;
            }
        };
        if !started {
            self.release_pipeline_lock(workspace_id, pipeline_name, &handle).await;
            return CommandResponse::ok(
                "command already processed",
                json!({ "run_id": run.id, "status": run.status, "started": false }),
            );
        }

        let response = self.execute_run(&run.id, workspace_id, pipeline.as_ref()).await;
        self.release_pipeline_lock(workspace_id, pipeline_name, &handle).await;
        response
    }

    async fn release_pipeline_lock(
        &self,
        workspace_id: Uuid,
        pipeline_name: &str,
        handle: &LockHandle,
    ) {
        if let Err(e) = self.locks.release(handle).await {
            error!(%workspace_id, pipeline_name, error = %e, "pipeline lock release failed");
        }
    }

    async fn execute_run(
        &self,
        run_id: &Uuid,
        workspace_id: Uuid,
        pipeline: &dyn WorkspacePipeline,
    ) -> CommandResponse {
        let workspace = match Workspace::find_by_id(&self.db.pool, workspace_id).await {
            Ok(workspace) => workspace,
            Err(e) => return self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        };
        let ctx = PipelineContext {
            workspace,
            db: self.db.clone(),
        };

        match pipeline.run(&ctx).await {
            Ok(result) => {
                if let Err(e) =
                    PipelineRun::complete(&self.db.pool, *run_id, "succeeded", &result).await
                {
                    return self.fail(Some(workspace_id), e.to_string(), Value::Null).await;
                }
                info!(%workspace_id, pipeline = pipeline.name(), "pipeline run succeeded");
                CommandResponse::ok(
                    format!("{} completed", pipeline.name()),
                    json!({ "run_id": run_id, "result": result, "started": true }),
                )
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(complete_err) = PipelineRun::complete(
                    &self.db.pool,
                    *run_id,
                    "failed",
                    &json!({ "error": message }),
                )
                .await
                {
                    error!(%workspace_id, error = %complete_err, "failed to record run failure");
                }
                self.fail(
                    Some(workspace_id),
                    format!("{} failed: {message}", pipeline.name()),
                    json!({ "run_id": run_id }),
                )
                .await
            }
        }
    }

    /// `/approve <id>`: short-id prefix lookup. Ambiguity returns the
    /// candidates for the operator to pick from, never a guess.
    pub async fn approve(
        &self,
        workspace_id: Uuid,
        short_id: &str,
        actor: &str,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> CommandResponse {
        let item = match self.resolve_short_id(workspace_id, short_id).await {
            Ok(item) => item,
            Err(response) => return response,
        };

        match self.queue.approve(item.id, actor, at, now).await {
            Ok(result) if result.already_resolved => CommandResponse::ok(
                format!("item is already {}", result.item.status),
                json!({ "item_id": result.item.id, "status": result.item.status }),
            ),
            Ok(result) => CommandResponse::ok(
                "item approved",
                json!({
                    "item_id": result.item.id,
                    "scheduled_for": result.item.scheduled_for,
                    "window_key": result.item.window_key,
                }),
            ),
            Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        }
    }

    pub async fn reject(
        &self,
        workspace_id: Uuid,
        short_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> CommandResponse {
        let item = match self.resolve_short_id(workspace_id, short_id).await {
            Ok(item) => item,
            Err(response) => return response,
        };

        match self.queue.reject(item.id, actor, reason).await {
            Ok(result) if result.already_resolved => CommandResponse::ok(
                format!("item is already {}", result.item.status),
                json!({ "item_id": result.item.id, "status": result.item.status }),
            ),
            Ok(result) => CommandResponse::ok(
                "item rejected",
                json!({ "item_id": result.item.id }),
            ),
            Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        }
    }

    /// `/pause`: workspace scope pauses one workspace; global scope
    /// engages the kill switch.
    pub async fn pause(&self, workspace_id: Option<Uuid>, reason: &str) -> CommandResponse {
        match workspace_id {
            Some(workspace_id) => match self.modes.pause(workspace_id).await {
                Ok(true) => CommandResponse::ok(
                    "workspace paused",
                    json!({ "workspace_id": workspace_id }),
                ),
                Ok(false) => CommandResponse::ok(
                    "workspace was already paused",
                    json!({ "workspace_id": workspace_id }),
                ),
                Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
            },
            None => match self.kill_switch.engage(reason).await {
                Ok(state) => CommandResponse::ok(
                    "global kill switch engaged",
                    json!({ "reason": state.reason, "engaged_at": state.engaged_at }),
                ),
                Err(e) => self.fail(None, e.to_string(), Value::Null).await,
            },
        }
    }

    pub async fn resume(&self, workspace_id: Uuid) -> CommandResponse {
        match self.modes.resume(workspace_id).await {
            Ok(changed) => CommandResponse::ok(
                if changed { "workspace resumed" } else { "workspace was not paused" },
                json!({ "workspace_id": workspace_id }),
            ),
            Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        }
    }

    /// `/mode set <value> [confirm]`. The autonomous tier refuses to
    /// engage without the confirmation phrase.
    pub async fn set_mode(
        &self,
        workspace_id: Uuid,
        value: &str,
        actor: &str,
        confirm: Option<&str>,
    ) -> CommandResponse {
        let target = match OperationalMode::parse(value) {
            Ok(target) => target,
            Err(e) => return self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        };

        match self.modes.transition(workspace_id, target, actor, confirm).await {
            Ok(mode) => CommandResponse::ok(
                format!("mode set to {mode}"),
                json!({ "workspace_id": workspace_id, "mode": mode }),
            ),
            Err(ModeError::ConfirmationRequired) => CommandResponse::failed(
                format!(
                    "autonomous mode needs explicit confirmation; rerun with '{AUTONOMOUS_CONFIRM_TOKEN}'"
                ),
                json!({ "requires_confirmation": true }),
            ),
            Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        }
    }

    /// `/stability [contain]`.
    pub async fn stability(
        &self,
        workspace_id: Uuid,
        contain: bool,
        now: DateTime<Utc>,
    ) -> CommandResponse {
        match self.guard.run(workspace_id, contain, now).await {
            Ok(report) => CommandResponse::ok(
                format!("stability: {:?}", report.overall).to_lowercase(),
                json!(report),
            ),
            Err(e) => self.fail(Some(workspace_id), e.to_string(), Value::Null).await,
        }
    }

    /// `/ack_kill_switch`: extends the engaged flag without re-running
    /// the checks that tripped it.
    pub async fn ack_kill_switch(&self, actor: &str) -> CommandResponse {
        match self.kill_switch.acknowledge(actor).await {
            Ok(Some(state)) => CommandResponse::ok(
                "kill switch acknowledged",
                json!({ "reason": state.reason, "acknowledged_by": state.acknowledged_by }),
            ),
            Ok(None) => CommandResponse::failed("kill switch is not engaged", Value::Null),
            Err(e) => self.fail(None, e.to_string(), Value::Null).await,
        }
    }

    async fn resolve_short_id(
        &self,
        workspace_id: Uuid,
        short_id: &str,
    ) -> Result<QueueItem, CommandResponse> {
        let candidates = match QueueItem::find_by_short_id(&self.db.pool, workspace_id, short_id)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => return Err(self.fail(Some(workspace_id), e.to_string(), Value::Null).await),
        };

        if candidates.len() > 1 {
            let listed: Vec<Value> = candidates
                .iter()
                .map(|item| {
                    json!({
                        "id": item.id,
                        "short_id": item.id.simple().to_string()[..8].to_string(),
                        "kind": item.kind,
                        "status": item.status,
                    })
                })
                .collect();
            return Err(CommandResponse::failed(
                format!("'{short_id}' matches {} items; use a longer prefix", listed.len()),
                json!({ "candidates": listed }),
            ));
        }

        match candidates.into_iter().next() {
            Some(item) => Ok(item),
            None => Err(self
                .fail(
                    Some(workspace_id),
                    format!("no queue item matches '{short_id}'"),
                    Value::Null,
                )
                .await),
        }
    }

    async fn fail(
        &self,
        workspace_id: Option<Uuid>,
        message: String,
        data: Value,
    ) -> CommandResponse {
        emit_best_effort(
            self.events.as_ref(),
            workspace_id,
            "command_error",
            &json!({ "message": message }),
        )
        .await;
        CommandResponse::failed(message, data)
    }
}
