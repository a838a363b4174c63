//! Stability guard: a read-mostly battery of health checks with two
//! escalation paths. Auto-containment pauses a critical workspace and
//! drops it into containment mode; the kill-switch predicate count can
//! engage the global publish stop and page the operators.
//!
//! Checks are isolated. An error inside one check degrades to a warning
//! result for that check and the rest of the battery still runs.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use db::{
    DBService,
    models::{
        publish_audit::PublishAudit,
        queue_item::{QueueItem, QueueStatus},
        workspace_event::WorkspaceEvent,
        workspace_mode::OperationalMode,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::cache::KvError;
use super::channels::CredentialProvider;
use super::events::{AlertTransport, EventSink, emit_best_effort};
use super::killswitch::KillSwitch;
use super::locks::LockManager;
use super::modes::{ModeError, ModeService};
use super::publisher::recent_breaker_count;

#[derive(Debug, Error)]
pub enum StabilityError {
    #[error(transparent)]
    Mode(#[from] ModeError),
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityCheck {
    pub key: String,
    pub severity: Severity,
    pub status: String,
    pub summary: String,
    pub details: Value,
    pub recommended_action: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainmentOutcome {
    pub applied: bool,
    pub actions_applied: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchOutcome {
    pub predicates_true: usize,
    pub engaged: bool,
    pub alerted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilityReport {
    pub workspace_id: Uuid,
    pub overall: Severity,
    pub checks: Vec<StabilityCheck>,
    pub containment: ContainmentOutcome,
    pub kill_switch: KillSwitchOutcome,
}

#[derive(Debug, Clone)]
pub struct StabilityConfig {
    pub auto_containment: bool,
    pub failure_threshold_24h: i64,
    pub consecutive_failure_threshold: i64,
    pub queue_stall_minutes: i64,
    pub pending_backlog_warning: i64,
    pub pending_age_warning_minutes: i64,
    pub command_error_warning_24h: i64,
    pub stuck_lock_threshold: usize,
    pub kill_switch_threshold: usize,
    pub required_secrets: Vec<String>,
    pub operators: Vec<String>,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            auto_containment: true,
            failure_threshold_24h: 10,
            consecutive_failure_threshold: 5,
            queue_stall_minutes: 30,
            pending_backlog_warning: 10,
            pending_age_warning_minutes: 24 * 60,
            command_error_warning_24h: 5,
            stuck_lock_threshold: 5,
            kill_switch_threshold: 2,
            required_secrets: Vec::new(),
            operators: Vec::new(),
        }
    }
}

/// Read-only secret lookup for the config-drift check.
pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

pub struct StabilityGuard {
    db: DBService,
    locks: LockManager,
    modes: ModeService,
    credentials: Arc<dyn CredentialProvider>,
    alerts: Option<Arc<dyn AlertTransport>>,
    kill_switch: KillSwitch,
    events: Arc<dyn EventSink>,
    secrets: Arc<dyn SecretSource>,
    config: StabilityConfig,
}

impl StabilityGuard {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DBService,
        locks: LockManager,
        modes: ModeService,
        credentials: Arc<dyn CredentialProvider>,
        alerts: Option<Arc<dyn AlertTransport>>,
        kill_switch: KillSwitch,
        events: Arc<dyn EventSink>,
        secrets: Arc<dyn SecretSource>,
        config: StabilityConfig,
    ) -> Self {
        Self {
            db,
            locks,
            modes,
            credentials,
            alerts,
            kill_switch,
            events,
            secrets,
            config,
        }
    }

    pub async fn run(
        &self,
        workspace_id: Uuid,
        contain: bool,
        now: DateTime<Utc>,
    ) -> Result<StabilityReport, StabilityError> {
        let checks = self.run_checks(workspace_id, now).await;
        let overall = checks
            .iter()
            .map(|c| c.severity)
            .max()
            .unwrap_or(Severity::Ok);

        let containment = if contain && self.config.auto_containment && overall == Severity::Critical
        {
            self.apply_containment(workspace_id).await?
        } else {
            ContainmentOutcome {
                applied: false,
                actions_applied: Vec::new(),
            }
        };

        let kill_switch = self.evaluate_kill_switch(&checks).await?;

        let report = StabilityReport {
            workspace_id,
            overall,
            checks,
            containment,
            kill_switch,
        };

        emit_best_effort(
            self.events.as_ref(),
            Some(workspace_id),
            "stability_report",
            &json!({
                "overall": report.overall,
                "checks": report
                    .checks
                    .iter()
                    .map(|c| json!({ "key": c.key, "severity": c.severity }))
                    .collect::<Vec<_>>(),
                "containment": report.containment,
                "kill_switch": report.kill_switch,
            }),
        )
        .await;

        Ok(report)
    }

    async fn run_checks(&self, workspace_id: Uuid, now: DateTime<Utc>) -> Vec<StabilityCheck> {
        vec![
            guarded("credentials", self.check_credentials(workspace_id)).await,
            guarded("publish_failures", self.check_publish_failures(workspace_id, now)).await,
            guarded("command_errors", self.check_command_errors(workspace_id, now)).await,
            guarded("notifications", self.check_notifications()).await,
            guarded("queue", self.check_queue(workspace_id, now)).await,
            guarded("locks", self.check_locks()).await,
            guarded("config", self.check_config_drift()).await,
        ]
    }

    async fn check_credentials(&self, workspace_id: Uuid) -> Result<StabilityCheck, String> {
        let token = self
            .credentials
            .access_token(workspace_id)
            .await
            .map_err(|e| e.to_string())?;
        let present = token.is_some();
        Ok(StabilityCheck {
            key: "credentials".into(),
            severity: if present { Severity::Ok } else { Severity::Critical },
            status: if present { "connected" } else { "missing" }.into(),
            summary: if present {
                "upstream credential available".into()
            } else {
                "no valid upstream credential".into()
            },
            details: json!({ "token_present": present }),
            recommended_action: (!present).then(|| "reconnect the upstream account".into()),
        })
    }

    async fn check_publish_failures(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<StabilityCheck, String> {
        let failures_24h = PublishAudit::count_with_status_since(
            &self.db.pool,
            workspace_id,
            &["failed"],
            now - Duration::hours(24),
        )
        .await
        .map_err(|e| e.to_string())?;
        let streak = PublishAudit::consecutive_failures(&self.db.pool, workspace_id)
            .await
            .map_err(|e| e.to_string())?;
        let breaker_1h = recent_breaker_count(&self.db, workspace_id, now - Duration::hours(1))
            .await
            .map_err(|e| e.to_string())?;

        let critical = failures_24h >= self.config.failure_threshold_24h
            || streak >= self.config.consecutive_failure_threshold;
        let severity = if critical {
            Severity::Critical
        } else if failures_24h > 0 || breaker_1h > 0 {
            Severity::Warning
        } else {
            Severity::Ok
        };

        Ok(StabilityCheck {
            key: "publish_failures".into(),
            severity,
            status: if critical { "failing" } else { "stable" }.into(),
            summary: format!("{failures_24h} failures in 24h, streak {streak}"),
            details: json!({
                "failures_24h": failures_24h,
                "consecutive_failures": streak,
                "breaker_count_1h": breaker_1h,
            }),
            recommended_action: critical
                .then(|| "inspect recent publish audit rows before resuming".into()),
        })
    }

    async fn check_command_errors(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<StabilityCheck, String> {
        let errors_24h = WorkspaceEvent::count_since(
            &self.db.pool,
            workspace_id,
            "command_error",
            now - Duration::hours(24),
        )
        .await
        .map_err(|e| e.to_string())?;

        let severity = if errors_24h >= self.config.command_error_warning_24h {
            Severity::Warning
        } else {
            Severity::Ok
        };
        Ok(StabilityCheck {
            key: "command_errors".into(),
            severity,
            status: "observed".into(),
            summary: format!("{errors_24h} command errors in 24h"),
            details: json!({ "command_errors_24h": errors_24h }),
            recommended_action: None,
        })
    }

    async fn check_notifications(&self) -> Result<StabilityCheck, String> {
        let (configured, healthy) = match &self.alerts {
            Some(alerts) => (true, alerts.healthy().await),
            None => (false, false),
        };
        let severity = if configured && healthy {
            Severity::Ok
        } else {
            Severity::Warning
        };
        Ok(StabilityCheck {
            key: "notifications".into(),
            severity,
            status: if configured { "configured" } else { "absent" }.into(),
            summary: if configured && healthy {
                "alert transport healthy".into()
            } else if configured {
                "alert transport unhealthy".into()
            } else {
                "no alert transport configured".into()
            },
            details: json!({ "configured": configured, "healthy": healthy }),
            recommended_action: (severity != Severity::Ok)
                .then(|| "operators cannot be paged until this recovers".into()),
        })
    }

    async fn check_queue(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<StabilityCheck, String> {
        let oldest_publishing = QueueItem::oldest_in_status_minutes(
            &self.db.pool,
            workspace_id,
            QueueStatus::Publishing,
            now,
        )
        .await
        .map_err(|e| e.to_string())?;
        let pending =
            QueueItem::count_in_status(&self.db.pool, workspace_id, QueueStatus::PendingReview)
                .await
                .map_err(|e| e.to_string())?;
        let oldest_pending = QueueItem::oldest_in_status_minutes(
            &self.db.pool,
            workspace_id,
            QueueStatus::PendingReview,
            now,
        )
        .await
        .map_err(|e| e.to_string())?;

        let stalled = oldest_publishing
            .map(|age| age >= self.config.queue_stall_minutes)
            .unwrap_or(false);
        let backlog = pending >= self.config.pending_backlog_warning
            || oldest_pending
                .map(|age| age >= self.config.pending_age_warning_minutes)
                .unwrap_or(false);

        let severity = if stalled {
            Severity::Critical
        } else if backlog {
            Severity::Warning
        } else {
            Severity::Ok
        };
        Ok(StabilityCheck {
            key: "queue".into(),
            severity,
            status: if stalled { "stalled" } else { "flowing" }.into(),
            summary: format!("{pending} items awaiting review"),
            details: json!({
                "oldest_publishing_minutes": oldest_publishing,
                "pending_review": pending,
                "oldest_pending_minutes": oldest_pending,
            }),
            recommended_action: stalled
                .then(|| "a claimed item never settled; inspect the executor".into()),
        })
    }

    async fn check_locks(&self) -> Result<StabilityCheck, String> {
        let active = self
            .locks
            .active_lock_count()
            .await
            .map_err(|e| e.to_string())?;
        let anomalous = active >= self.config.stuck_lock_threshold;
        Ok(StabilityCheck {
            key: "locks".into(),
            severity: if anomalous { Severity::Warning } else { Severity::Ok },
            status: if anomalous { "congested" } else { "normal" }.into(),
            summary: format!("{active} active locks"),
            details: json!({ "active_locks": active }),
            recommended_action: None,
        })
    }

    async fn check_config_drift(&self) -> Result<StabilityCheck, String> {
        let missing: Vec<&str> = self
            .config
            .required_secrets
            .iter()
            .filter(|name| self.secrets.get(name).is_none())
            .map(String::as_str)
            .collect();
        let drifted = !missing.is_empty();
        Ok(StabilityCheck {
            key: "config".into(),
            severity: if drifted { Severity::Critical } else { Severity::Ok },
            status: if drifted { "drifted" } else { "complete" }.into(),
            summary: if drifted {
                format!("{} required secrets missing", missing.len())
            } else {
                "all required secrets present".into()
            },
            details: json!({ "missing": missing }),
            recommended_action: drifted.then(|| "restore the missing secrets".into()),
        })
    }

    /// Pause plus containment mode, each applied only if not already in
    /// effect. A second critical cycle reports no actions.
    async fn apply_containment(
        &self,
        workspace_id: Uuid,
    ) -> Result<ContainmentOutcome, StabilityError> {
        let mut actions = Vec::new();

        if self.modes.pause(workspace_id).await? {
            actions.push("paused_workspace".to_string());
        }
        if self.modes.current(workspace_id).await? != OperationalMode::Containment {
            self.modes
                .transition(workspace_id, OperationalMode::Containment, "stability-guard", None)
                .await?;
            actions.push("mode_containment".to_string());
        }

        if !actions.is_empty() {
            warn!(%workspace_id, ?actions, "containment applied");
        }
        Ok(ContainmentOutcome {
            applied: !actions.is_empty(),
            actions_applied: actions,
        })
    }

    async fn evaluate_kill_switch(
        &self,
        checks: &[StabilityCheck],
    ) -> Result<KillSwitchOutcome, StabilityError> {
        let predicates = self.kill_switch_predicates(checks);
        let predicates_true = predicates.iter().filter(|(_, hit)| *hit).count();

        if predicates_true < self.config.kill_switch_threshold {
            return Ok(KillSwitchOutcome {
                predicates_true,
                engaged: false,
                alerted: 0,
            });
        }

        // Re-engaging would reset the TTL and drop an operator's
        // acknowledgement; an already-engaged switch is left as it is.
        if self.kill_switch.is_engaged().await? {
            return Ok(KillSwitchOutcome {
                predicates_true,
                engaged: true,
                alerted: 0,
            });
        }

        let reasons: Vec<&str> = predicates
            .iter()
            .filter(|(_, hit)| *hit)
            .map(|(name, _)| *name)
            .collect();
        self.kill_switch
            .engage(&format!("stability guard: {}", reasons.join(", ")))
            .await?;

        let mut alerted = 0;
        if let Some(alerts) = &self.alerts {
            let text = format!(
                "kill switch engaged: {} stability predicates tripped ({})",
                predicates_true,
                reasons.join(", ")
            );
            for operator in &self.config.operators {
                match alerts.send(operator, &text).await {
                    Ok(()) => alerted += 1,
                    Err(e) => warn!(operator, error = %e, "operator alert failed"),
                }
            }
        }

        info!(predicates_true, alerted, "kill switch engaged by stability guard");
        Ok(KillSwitchOutcome {
            predicates_true,
            engaged: true,
            alerted,
        })
    }

    fn kill_switch_predicates(&self, checks: &[StabilityCheck]) -> Vec<(&'static str, bool)> {
        let detail = |key: &str, field: &str| -> Option<Value> {
            checks
                .iter()
                .find(|c| c.key == key)
                .map(|c| c.details[field].clone())
        };
        let int = |key: &str, field: &str| detail(key, field).and_then(|v| v.as_i64());

        vec![
            (
                "credential_invalid",
                detail("credentials", "token_present").and_then(|v| v.as_bool()) == Some(false),
            ),
            (
                "excessive_failures_24h",
                int("publish_failures", "failures_24h").unwrap_or(0)
                    >= self.config.failure_threshold_24h,
            ),
            (
                "failure_streak",
                int("publish_failures", "consecutive_failures").unwrap_or(0)
                    >= self.config.consecutive_failure_threshold,
            ),
            (
                "queue_stalled",
                int("queue", "oldest_publishing_minutes").unwrap_or(0)
                    >= self.config.queue_stall_minutes,
            ),
            (
                "stuck_locks",
                int("locks", "active_locks").unwrap_or(0) >= self.config.stuck_lock_threshold as i64,
            ),
            (
                "config_drift",
                detail("config", "missing")
                    .and_then(|v| v.as_array().map(|a| !a.is_empty()))
                    .unwrap_or(false),
            ),
        ]
    }
}

/// Maps a check's own failure into a warning result so the rest of the
/// battery is unaffected.
async fn guarded(
    key: &str,
    fut: impl Future<Output = Result<StabilityCheck, String>>,
) -> StabilityCheck {
    match fut.await {
        Ok(check) => check,
        Err(error) => {
            warn!(key, %error, "stability check errored");
            StabilityCheck {
                key: key.to_string(),
                severity: Severity::Warning,
                status: "check_error".into(),
                summary: format!("check failed to run: {error}"),
                details: json!({ "error": error }),
                recommended_action: None,
            }
        }
    }
}
