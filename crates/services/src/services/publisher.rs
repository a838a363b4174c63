//! Publish engine: admission control and the send path. Admission runs in
//! a fixed order (kill-switch/mode, structural metadata, channel enabled,
//! credential, plan limit, cooldowns) before any provider call, and a
//! successful send commits its audit row and usage increments in one
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        publish_audit::{PublishAudit, PublishAuditError, RecordAudit, Usage},
        publish_cooldown::{CooldownScope, PublishCooldown, PublishCooldownError},
        queue_item::QueueItemKind,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::cache::KvError;
use super::channels::{
    ChannelError, ChannelPayload, ChannelRegistry, CredentialError, CredentialProvider,
    action_name, char_budget, truncate_chars,
};
use super::killswitch::KillSwitch;
use super::modes::{ModeError, ModeService};
use super::plans::{PlanDecision, PlanError, PlanLimiter};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Cooldown(#[from] PublishCooldownError),
    #[error(transparent)]
    Audit(#[from] PublishAuditError),
    #[error(transparent)]
    Cache(#[from] KvError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Published,
    Failed,
    CredentialMissing,
    BlockedPlan,
    BlockedCooldown,
    BlockedRateLimit,
    BlockedAdmission,
}

impl PublishStatus {
    /// Blocked statuses leave a queue item eligible for the next sweep;
    /// the rest resolve the attempt.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            PublishStatus::BlockedPlan
                | PublishStatus::BlockedCooldown
                | PublishStatus::BlockedRateLimit
                | PublishStatus::BlockedAdmission
                | PublishStatus::CredentialMissing
        )
    }
}

impl std::fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PublishStatus::Published => "published",
            PublishStatus::Failed => "failed",
            PublishStatus::CredentialMissing => "credential_missing",
            PublishStatus::BlockedPlan => "blocked_plan",
            PublishStatus::BlockedCooldown => "blocked_cooldown",
            PublishStatus::BlockedRateLimit => "blocked_rate_limit",
            PublishStatus::BlockedAdmission => "blocked_admission",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub workspace_id: Uuid,
    pub queue_item_id: Option<Uuid>,
    pub kind: QueueItemKind,
    pub text: String,
    pub thread_key: Option<String>,
    pub author_key: Option<String>,
    /// Explicit owner override for publishing out of containment.
    pub owner_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub published: bool,
    pub external_id: Option<String>,
    pub status: PublishStatus,
    pub message: String,
    pub plan: Option<PlanDecision>,
}

impl PublishOutcome {
    fn blocked(status: PublishStatus, message: impl Into<String>) -> Self {
        Self {
            published: false,
            external_id: None,
            status,
            message: message.into(),
            plan: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishConfig {
    pub cooldown_minutes: i64,
    pub error_truncate_chars: usize,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            cooldown_minutes: 45,
            error_truncate_chars: 500,
        }
    }
}

#[derive(Clone)]
pub struct PublishEngine {
    db: DBService,
    modes: ModeService,
    limiter: PlanLimiter,
    channels: ChannelRegistry,
    credentials: Arc<dyn CredentialProvider>,
    kill_switch: KillSwitch,
    config: PublishConfig,
}

impl PublishEngine {
    pub fn new(
        db: DBService,
        modes: ModeService,
        limiter: PlanLimiter,
        channels: ChannelRegistry,
        credentials: Arc<dyn CredentialProvider>,
        kill_switch: KillSwitch,
        config: PublishConfig,
    ) -> Self {
        Self {
            db,
            modes,
            limiter,
            channels,
            credentials,
            kill_switch,
            config,
        }
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        self.credentials.clone()
    }

    pub async fn publish(&self, request: PublishRequest) -> Result<PublishOutcome, PublishError> {
        self.publish_at(request, Utc::now()).await
    }

    /// Clock-parameterized variant; `now` drives plan day, cooldown
    /// comparisons, and new cooldown deadlines.
    pub async fn publish_at(
        &self,
        request: PublishRequest,
        now: DateTime<Utc>,
    ) -> Result<PublishOutcome, PublishError> {
        let action = action_name(request.kind);

        if self.kill_switch.is_engaged().await? {
            self.audit_blocked(&request, action, PublishStatus::BlockedAdmission, "kill_switch")
                .await?;
            return Ok(PublishOutcome::blocked(
                PublishStatus::BlockedAdmission,
                "global kill switch is engaged",
            ));
        }

        let mode = self.modes.current(request.workspace_id).await?;
        if mode.blocks_publishing() && !request.owner_override {
            self.audit_blocked(&request, action, PublishStatus::BlockedAdmission, "containment")
                .await?;
            return Ok(PublishOutcome::blocked(
                PublishStatus::BlockedAdmission,
                "workspace is in containment; owner override required",
            ));
        }

        // Structural requirements resolve before any provider concern.
        if request.kind == QueueItemKind::Reply && request.thread_key.is_none() {
            self.audit_blocked(&request, action, PublishStatus::Failed, "missing thread key")
                .await?;
            return Ok(PublishOutcome::blocked(
                PublishStatus::Failed,
                "reply requires a thread key",
            ));
        }

        let Some(client) = self.channels.client_for(request.kind) else {
            self.audit_blocked(&request, action, PublishStatus::BlockedAdmission, "channel_disabled")
                .await?;
            return Ok(PublishOutcome::blocked(
                PublishStatus::BlockedAdmission,
                format!("channel {} is not enabled", request.kind),
            ));
        };

        let Some(access_token) = self.credentials.access_token(request.workspace_id).await? else {
            self.audit_blocked(
                &request,
                action,
                PublishStatus::CredentialMissing,
                "no valid credential",
            )
            .await?;
            return Ok(PublishOutcome::blocked(
                PublishStatus::CredentialMissing,
                "no valid upstream credential for workspace",
            ));
        };

        let decision = self.limiter.check(request.workspace_id, action, 1, now).await?;
        if !decision.allowed {
            self.audit_blocked(&request, action, PublishStatus::BlockedPlan, "plan limit")
                .await?;
            let message = format!(
                "daily limit reached for {action}: used {} of {}",
                decision.used, decision.limit
            );
            let mut outcome = PublishOutcome::blocked(PublishStatus::BlockedPlan, message);
            outcome.plan = Some(decision);
            return Ok(outcome);
        }

        for (scope, scope_key) in self.cooldown_scopes(&request) {
            let active = PublishCooldown::active_until(
                &self.db.pool,
                request.workspace_id,
                scope,
                &scope_key,
                now,
            )
            .await?;
            if let Some(until) = active {
                self.audit_blocked(&request, action, PublishStatus::BlockedCooldown, "cooldown")
                    .await?;
                return Ok(PublishOutcome::blocked(
                    PublishStatus::BlockedCooldown,
                    format!("{scope} {scope_key} is cooling down until {until}"),
                ));
            }
        }

        let mut text = request.text.clone();
        if let Some(budget) = char_budget(request.kind) {
            text = truncate_chars(&text, budget);
        }

        let payload = ChannelPayload {
            workspace_id: request.workspace_id,
            kind: request.kind,
            text,
            thread_key: request.thread_key.clone(),
            author_key: request.author_key.clone(),
        };

        match client.publish(&access_token, &payload).await {
            Ok(receipt) => {
                let mut tx = self.db.pool.begin().await?;
                PublishAudit::record(
                    &mut *tx,
                    RecordAudit {
                        workspace_id: request.workspace_id,
                        queue_item_id: request.queue_item_id,
                        action,
                        status: "published",
                        external_id: Some(&receipt.external_id),
                        error: None,
                        payload: Some(&receipt.raw),
                    },
                )
                .await?;
                Usage::increment(
                    &mut tx,
                    request.workspace_id,
                    action,
                    1,
                    &PlanLimiter::day_key(now),
                )
                .await?;
                tx.commit().await?;

                let until = now + chrono::Duration::minutes(self.config.cooldown_minutes);
                for (scope, scope_key) in self.cooldown_scopes(&request) {
                    PublishCooldown::upsert(
                        &self.db.pool,
                        request.workspace_id,
                        scope,
                        &scope_key,
                        until,
                    )
                    .await?;
                }

                info!(
                    workspace_id = %request.workspace_id,
                    kind = %request.kind,
                    external_id = %receipt.external_id,
                    "published"
                );
                Ok(PublishOutcome {
                    published: true,
                    external_id: Some(receipt.external_id),
                    status: PublishStatus::Published,
                    message: "published".to_string(),
                    plan: Some(decision),
                })
            }
            Err(ChannelError::RateLimited) => {
                self.audit_blocked(&request, action, PublishStatus::BlockedRateLimit, "rate limited")
                    .await?;
                warn!(workspace_id = %request.workspace_id, kind = %request.kind, "rate limited");
                Ok(PublishOutcome::blocked(
                    PublishStatus::BlockedRateLimit,
                    "rate limited by provider",
                ))
            }
            Err(e) => {
                let error = truncate_chars(&e.to_string(), self.config.error_truncate_chars);
                self.audit_blocked(&request, action, PublishStatus::Failed, &error).await?;
                warn!(
                    workspace_id = %request.workspace_id,
                    kind = %request.kind,
                    error,
                    "publish failed"
                );
                Ok(PublishOutcome::blocked(PublishStatus::Failed, error))
            }
        }
    }

    /// Reply publishes are scoped by thread and target author; top-level
    /// content has no cooldown scope.
    fn cooldown_scopes(&self, request: &PublishRequest) -> Vec<(CooldownScope, String)> {
        if request.kind != QueueItemKind::Reply {
            return Vec::new();
        }
        let mut scopes = Vec::new();
        if let Some(thread) = &request.thread_key {
            scopes.push((CooldownScope::Thread, thread.clone()));
        }
        if let Some(author) = &request.author_key {
            scopes.push((CooldownScope::Author, author.clone()));
        }
        scopes
    }

    async fn audit_blocked(
        &self,
        request: &PublishRequest,
        action: &str,
        status: PublishStatus,
        error: &str,
    ) -> Result<(), PublishError> {
        PublishAudit::record(
            &self.db.pool,
            RecordAudit {
                workspace_id: request.workspace_id,
                queue_item_id: request.queue_item_id,
                action,
                status: &status.to_string(),
                external_id: None,
                error: Some(error),
                payload: Some(&json!({ "kind": request.kind })),
            },
        )
        .await?;
        Ok(())
    }
}

/// Derived circuit-breaker signal: recent failures plus rate-limit blocks.
/// The stability guard consumes this; the engine never acts on it inline.
pub async fn recent_breaker_count(
    db: &DBService,
    workspace_id: Uuid,
    since: DateTime<Utc>,
) -> Result<i64, PublishError> {
    let count = PublishAudit::count_with_status_since(
        &db.pool,
        workspace_id,
        &["failed", "blocked_rate_limit"],
        since,
    )
    .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{Harness, harness};
    use chrono::Duration as ChronoDuration;
    use db::models::workspace_mode::OperationalMode;

    fn reply(h: &Harness, n: usize) -> PublishRequest {
        PublishRequest {
            workspace_id: h.workspace_id,
            queue_item_id: None,
            kind: QueueItemKind::Reply,
            text: format!("reply number {n}"),
            thread_key: Some(format!("thread-{n}")),
            author_key: Some(format!("author-{n}")),
            owner_override: false,
        }
    }

    #[tokio::test]
    async fn free_plan_allows_five_replies_then_blocks() {
        let h = harness().await;
        let now = Utc::now();

        let mut external_ids = Vec::new();
        for n in 1..=5 {
            let outcome = h.engine.publish_at(reply(&h, n), now).await.unwrap();
            assert_eq!(outcome.status, PublishStatus::Published, "call {n}");
            external_ids.push(outcome.external_id.unwrap());
        }
        assert_eq!(external_ids, vec!["ext-1", "ext-2", "ext-3", "ext-4", "ext-5"]);

        let sixth = h.engine.publish_at(reply(&h, 6), now).await.unwrap();
        assert_eq!(sixth.status, PublishStatus::BlockedPlan);
        let plan = sixth.plan.unwrap();
        assert_eq!(plan.used, 5);
        assert_eq!(plan.limit, 5);
        assert_eq!(plan.remaining, 0);

        // The blocked attempt must not consume usage.
        let day = PlanLimiter::day_key(now);
        let used = Usage::used_on_day(&h.db.pool, h.workspace_id, "publish_reply", &day)
            .await
            .unwrap();
        assert_eq!(used, 5);
    }

    #[tokio::test]
    async fn same_thread_is_blocked_until_cooldown_elapses() {
        let h = harness().await;
        let now = Utc::now();

        let first = h.engine.publish_at(reply(&h, 1), now).await.unwrap();
        assert!(first.published);

        let retry = h.engine.publish_at(reply(&h, 1), now + ChronoDuration::minutes(10)).await.unwrap();
        assert_eq!(retry.status, PublishStatus::BlockedCooldown);

        let later = now + ChronoDuration::minutes(46);
        let after = h.engine.publish_at(reply(&h, 1), later).await.unwrap();
        assert_eq!(after.status, PublishStatus::Published);
    }

    #[tokio::test]
    async fn missing_credential_blocks_before_send() {
        let h = harness().await;
        h.credentials.set_token(None);

        let outcome = h.engine.publish(reply(&h, 1)).await.unwrap();
        assert_eq!(outcome.status, PublishStatus::CredentialMissing);
        assert!(h.client.published_payloads().is_empty());
    }

    #[tokio::test]
    async fn kill_switch_blocks_everything() {
        let h = harness().await;
        h.kill.engage("drill").await.unwrap();

        let outcome = h.engine.publish(reply(&h, 1)).await.unwrap();
        assert_eq!(outcome.status, PublishStatus::BlockedAdmission);
        assert!(h.client.published_payloads().is_empty());
    }

    #[tokio::test]
    async fn containment_requires_owner_override() {
        let h = harness().await;
        h.modes
            .transition(h.workspace_id, OperationalMode::Containment, "guard", None)
            .await
            .unwrap();

        let blocked = h.engine.publish(reply(&h, 1)).await.unwrap();
        assert_eq!(blocked.status, PublishStatus::BlockedAdmission);

        let mut overridden = reply(&h, 2);
        overridden.owner_override = true;
        let outcome = h.engine.publish(overridden).await.unwrap();
        assert_eq!(outcome.status, PublishStatus::Published);
    }

    #[tokio::test]
    async fn reply_without_thread_key_is_structural_failure() {
        let h = harness().await;
        let mut request = reply(&h, 1);
        request.thread_key = None;

        let outcome = h.engine.publish(request).await.unwrap();
        assert_eq!(outcome.status, PublishStatus::Failed);
        assert!(outcome.message.contains("thread key"));
        assert!(h.client.published_payloads().is_empty());
    }

    #[tokio::test]
    async fn short_form_text_is_truncated_before_send() {
        let h = harness().await;
        let mut request = reply(&h, 1);
        request.text = "x".repeat(500);

        let outcome = h.engine.publish(request).await.unwrap();
        assert!(outcome.published);

        let payloads = h.client.published_payloads();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].text.chars().count(), 280);
    }

    #[tokio::test]
    async fn transport_failure_audits_and_rate_limit_feeds_breaker() {
        let h = harness().await;
        let now = Utc::now();

        h.client.push_error(ChannelError::Provider("boom".into()));
        let failed = h.engine.publish_at(reply(&h, 1), now).await.unwrap();
        assert_eq!(failed.status, PublishStatus::Failed);

        h.client.push_error(ChannelError::RateLimited);
        let limited = h.engine.publish_at(reply(&h, 2), now).await.unwrap();
        assert_eq!(limited.status, PublishStatus::BlockedRateLimit);

        let breaker = recent_breaker_count(&h.db, h.workspace_id, now - ChronoDuration::hours(1))
            .await
            .unwrap();
        assert_eq!(breaker, 2);
    }

    #[tokio::test]
    async fn post_kind_has_no_cooldown_scope() {
        let h = harness().await;
        let now = Utc::now();
        let request = PublishRequest {
            workspace_id: h.workspace_id,
            queue_item_id: None,
            kind: QueueItemKind::Post,
            text: "a scheduled post".into(),
            thread_key: None,
            author_key: None,
            owner_override: false,
        };

        let first = h.engine.publish_at(request.clone(), now).await.unwrap();
        assert!(first.published);
        let second = h.engine.publish_at(request, now + ChronoDuration::minutes(1)).await.unwrap();
        assert!(second.published);
    }
}
