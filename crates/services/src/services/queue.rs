//! Approval queue lifecycle and the due-item executor. Approval fills the
//! next open publish window; the executor claims due items, hands them to
//! the publish engine, and settles them according to the outcome.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc};
use db::{
    DBService,
    models::queue_item::{
        CreateQueueItem, QueueItem, QueueItemError, QueueStatus,
    },
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::channels::truncate_chars;
use super::events::{EventSink, emit_best_effort};
use super::publisher::{PublishEngine, PublishError, PublishRequest, PublishStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Item(#[from] QueueItemError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Hours of the day (UTC) at which publish windows open.
    pub cadence_hours: Vec<u32>,
    pub window_horizon_days: i64,
    pub pending_review_cap: i64,
    pub daily_stock_target: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            cadence_hours: vec![9, 12, 15, 18],
            window_horizon_days: 14,
            pending_review_cap: 12,
            daily_stock_target: 8,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApprovalResult {
    pub item: QueueItem,
    /// True when the item was already past review; re-approval returns the
    /// current state instead of erroring.
    pub already_resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSummary {
    pub workspace_id: Uuid,
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
    pub blocked: usize,
    pub scheduled_pending: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedCapacity {
    pub pending_open: i64,
    pub daily_remaining: i64,
    pub allowed: bool,
}

/// First cadence slot strictly after `now` whose window key is not yet
/// booked. Pure so the no-double-booking property is testable directly.
pub fn next_open_window(
    now: DateTime<Utc>,
    cadence_hours: &[u32],
    horizon_days: i64,
    occupied: &HashSet<String>,
) -> (DateTime<Utc>, String) {
    // Enough days to cover the horizon plus every booked slot, so a
    // fully booked horizon spills into later days instead of reusing a
    // window.
    let slots_per_day = cadence_hours.len().max(1) as i64;
    let scan_days = horizon_days.max(1) + occupied.len() as i64 / slots_per_day + 2;
    let mut fallback = None;
    for day_offset in 0..scan_days {
        let date = now.date_naive() + Duration::days(day_offset);
        for hour in cadence_hours {
            let Some(time) = NaiveTime::from_hms_opt(*hour, 0, 0) else {
                continue;
            };
            let slot = Utc.from_utc_datetime(&date.and_time(time));
            if slot <= now {
                continue;
            }
            let key = window_key(slot);
            if !occupied.contains(&key) {
                return (slot, key);
            }
            fallback.get_or_insert((slot, key));
        }
    }
    // Unreachable with a sane cadence; fall back to the first future slot.
    fallback.unwrap_or_else(|| {
        let slot = now + Duration::days(1);
        (slot, window_key(slot))
    })
}

pub fn window_key(slot: DateTime<Utc>) -> String {
    format!(
        "{:04}-{:02}-{:02}T{:02}",
        slot.year(),
        slot.month(),
        slot.day(),
        slot.hour()
    )
}

#[derive(Clone)]
pub struct ApprovalQueueService {
    db: DBService,
    engine: PublishEngine,
    events: Arc<dyn EventSink>,
    config: QueueConfig,
}

impl ApprovalQueueService {
    pub fn new(
        db: DBService,
        engine: PublishEngine,
        events: Arc<dyn EventSink>,
        config: QueueConfig,
    ) -> Self {
        Self {
            db,
            engine,
            events,
            config,
        }
    }

    /// Idempotency-keyed creation; see `QueueItem::create`.
    pub async fn create(&self, data: CreateQueueItem) -> Result<(QueueItem, bool), QueueError> {
        let (item, created) = QueueItem::create(&self.db.pool, data).await?;
        if created {
            info!(item_id = %item.id, workspace_id = %item.workspace_id, kind = %item.kind, "queued item");
        }
        Ok((item, created))
    }

    /// Whether seeding commands may add more drafts. Checked in order:
    /// the pending-review cap first, then the daily stock target.
    pub async fn seed_capacity(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<SeedCapacity, QueueError> {
        let pending =
            QueueItem::count_in_status(&self.db.pool, workspace_id, QueueStatus::PendingReview)
                .await?;
        let pending_open = (self.config.pending_review_cap - pending).max(0);
        if pending_open == 0 {
            return Ok(SeedCapacity {
                pending_open: 0,
                daily_remaining: 0,
                allowed: false,
            });
        }

        let midnight = Utc
            .from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
        let created_today =
            QueueItem::count_created_since(&self.db.pool, workspace_id, midnight).await?;
        let daily_remaining = (self.config.daily_stock_target - created_today).max(0);

        Ok(SeedCapacity {
            pending_open,
            daily_remaining,
            allowed: daily_remaining > 0,
        })
    }

    pub async fn approve(
        &self,
        item_id: Uuid,
        actor: &str,
        at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalResult, QueueError> {
        let item = QueueItem::find_by_id(&self.db.pool, item_id).await?;
        if item.queue_status()? != QueueStatus::PendingReview {
            return Ok(ApprovalResult {
                item,
                already_resolved: true,
            });
        }

        let (scheduled_for, window) = match at {
            Some(at) => (at, None),
            None => {
                let occupied: HashSet<String> = QueueItem::occupied_windows(
                    &self.db.pool,
                    item.workspace_id,
                )
                .await?
                .into_iter()
                .collect();
                let (slot, key) = next_open_window(
                    now,
                    &self.config.cadence_hours,
                    self.config.window_horizon_days,
                    &occupied,
                );
                (slot, Some(key))
            }
        };

        match QueueItem::approve(&self.db.pool, item_id, actor, scheduled_for, window.as_deref())
            .await
        {
            Ok(item) => {
                info!(item_id = %item.id, %scheduled_for, "item approved");
                Ok(ApprovalResult {
                    item,
                    already_resolved: false,
                })
            }
            // Lost a race with another approver/executor; report current state.
            Err(QueueItemError::NotFound) => {
                let item = QueueItem::find_by_id(&self.db.pool, item_id).await?;
                Ok(ApprovalResult {
                    item,
                    already_resolved: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn reject(
        &self,
        item_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ApprovalResult, QueueError> {
        let item = QueueItem::find_by_id(&self.db.pool, item_id).await?;
        if item.queue_status()? != QueueStatus::PendingReview {
            return Ok(ApprovalResult {
                item,
                already_resolved: true,
            });
        }

        match QueueItem::reject(&self.db.pool, item_id, actor, reason).await {
            Ok(item) => Ok(ApprovalResult {
                item,
                already_resolved: false,
            }),
            Err(QueueItemError::NotFound) => {
                let item = QueueItem::find_by_id(&self.db.pool, item_id).await?;
                Ok(ApprovalResult {
                    item,
                    already_resolved: true,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One executor sweep: claim each due item, publish, settle. Blocked
    /// admission returns the item to the approved state for the next
    /// sweep; structural or transport failure is terminal.
    pub async fn run_due(
        &self,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ExecutorSummary, QueueError> {
        let due = QueueItem::find_due(&self.db.pool, workspace_id, now).await?;

        let mut summary = ExecutorSummary {
            workspace_id,
            attempted: 0,
            published: 0,
            failed: 0,
            blocked: 0,
            scheduled_pending: 0,
        };

        for item in due {
            if !QueueItem::claim_for_publishing(&self.db.pool, item.id).await? {
                continue;
            }
            summary.attempted += 1;

            let kind = match item.queue_kind() {
                Ok(kind) => kind,
                Err(e) => {
                    // Unsupported kind is structural; no retry will fix it.
                    QueueItem::mark_failed(&self.db.pool, item.id, &e.to_string()).await?;
                    summary.failed += 1;
                    continue;
                }
            };

            let outcome = self
                .engine
                .publish_at(
                    PublishRequest {
                        workspace_id,
                        queue_item_id: Some(item.id),
                        kind,
                        text: item.content.clone(),
                        thread_key: item.thread_key.clone(),
                        author_key: item.author_key.clone(),
                        owner_override: false,
                    },
                    now,
                )
                .await?;

            match outcome.status {
                PublishStatus::Published => {
                    let external_id = outcome.external_id.as_deref().unwrap_or_default();
                    QueueItem::mark_published(&self.db.pool, item.id, external_id).await?;
                    summary.published += 1;
                }
                status if status.is_blocked() => {
                    QueueItem::release_to_approved(&self.db.pool, item.id).await?;
                    summary.blocked += 1;
                    warn!(item_id = %item.id, %status, message = %outcome.message, "publish blocked");
                }
                _ => {
                    let error = truncate_chars(&outcome.message, 500);
                    QueueItem::mark_failed(&self.db.pool, item.id, &error).await?;
                    summary.failed += 1;
                }
            }
        }

        summary.scheduled_pending =
            QueueItem::count_scheduled_pending(&self.db.pool, workspace_id, now).await?;

        emit_best_effort(
            self.events.as_ref(),
            Some(workspace_id),
            "queue_executor_sweep",
            &json!(summary),
        )
        .await;

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{Harness, harness};
    use db::models::queue_item::QueueItemKind;

    fn service(h: &Harness) -> ApprovalQueueService {
        ApprovalQueueService::new(
            h.db.clone(),
            h.engine.clone(),
            h.events.clone(),
            QueueConfig::default(),
        )
    }

    fn draft(h: &Harness, key: &str, thread: Option<&str>) -> CreateQueueItem {
        CreateQueueItem {
            workspace_id: h.workspace_id,
            kind: QueueItemKind::Reply,
            content: format!("draft {key}"),
            thread_key: thread.map(String::from),
            author_key: Some(format!("author-{key}")),
            scheduled_for: None,
            priority: None,
            idempotency_key: key.to_string(),
        }
    }

    #[test]
    fn window_assignment_never_double_books() {
        let now = Utc.with_ymd_and_hms(2026, 8, 28, 10, 30, 0).unwrap();
        let cadence = vec![9, 12, 15, 18];
        let mut occupied = HashSet::new();

        let (first_slot, first_key) = next_open_window(now, &cadence, 14, &occupied);
        assert!(first_slot > now);
        assert_eq!(first_key, "2026-08-28T12");

        occupied.insert(first_key.clone());
        let (second_slot, second_key) = next_open_window(now, &cadence, 14, &occupied);
        assert!(second_slot > first_slot);
        assert_eq!(second_key, "2026-08-28T15");
        assert_ne!(first_key, second_key);
    }

    #[test]
    fn fully_booked_horizon_spills_into_later_days() {
        let now = Utc.with_ymd_and_hms(2026, 8, 28, 8, 0, 0).unwrap();
        let cadence = vec![9, 12];
        let mut occupied = HashSet::new();
        for day in 0..3 {
            let date = now.date_naive() + Duration::days(day);
            for hour in &cadence {
                let time = NaiveTime::from_hms_opt(*hour, 0, 0).unwrap();
                occupied.insert(window_key(Utc.from_utc_datetime(&date.and_time(time))));
            }
        }

        let (slot, key) = next_open_window(now, &cadence, 3, &occupied);
        assert!(!occupied.contains(&key));
        assert_eq!(key, "2026-08-31T09");
        assert!(slot > now + Duration::days(2));
    }

    #[test]
    fn late_evening_rolls_to_next_day() {
        let now = Utc.with_ymd_and_hms(2026, 8, 28, 22, 30, 0).unwrap();
        let (_, key) = next_open_window(now, &[9, 12, 15, 18], 14, &HashSet::new());
        assert_eq!(key, "2026-08-29T09");
    }

    #[tokio::test]
    async fn approval_books_distinct_windows() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let (a, _) = queue.create(draft(&h, "a", Some("t-a"))).await.unwrap();
        let (b, _) = queue.create(draft(&h, "b", Some("t-b"))).await.unwrap();

        let first = queue.approve(a.id, "owner", None, now).await.unwrap();
        let second = queue.approve(b.id, "owner", None, now).await.unwrap();

        assert!(!first.already_resolved);
        let key_a = first.item.window_key.clone().unwrap();
        let key_b = second.item.window_key.clone().unwrap();
        assert_ne!(key_a, key_b);
        assert!(first.item.scheduled_for.unwrap() > now);
    }

    #[tokio::test]
    async fn re_approving_resolved_items_is_idempotent() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let (item, _) = queue.create(draft(&h, "done", Some("t-1"))).await.unwrap();
        queue.reject(item.id, "owner", Some("off-brand")).await.unwrap();

        let replay = queue.approve(item.id, "owner", None, now).await.unwrap();
        assert!(replay.already_resolved);
        assert_eq!(replay.item.queue_status().unwrap(), QueueStatus::Rejected);

        let reject_replay = queue.reject(item.id, "owner", None).await.unwrap();
        assert!(reject_replay.already_resolved);
    }

    #[tokio::test]
    async fn executor_honors_the_schedule_boundary() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let (item, _) = queue.create(draft(&h, "later", Some("t-1"))).await.unwrap();
        queue
            .approve(item.id, "owner", Some(now + Duration::hours(1)), now)
            .await
            .unwrap();

        let early = queue.run_due(h.workspace_id, now).await.unwrap();
        assert_eq!(early.attempted, 0);
        assert_eq!(early.scheduled_pending, 1);
        let reloaded = QueueItem::find_by_id(&h.db.pool, item.id).await.unwrap();
        assert_eq!(reloaded.queue_status().unwrap(), QueueStatus::ApprovedScheduled);

        let later = queue.run_due(h.workspace_id, now + Duration::hours(2)).await.unwrap();
        assert_eq!(later.published, 1);
        assert_eq!(later.scheduled_pending, 0);
        let published = QueueItem::find_by_id(&h.db.pool, item.id).await.unwrap();
        assert_eq!(published.queue_status().unwrap(), QueueStatus::Published);
        assert_eq!(published.external_post_id.as_deref(), Some("ext-1"));
    }

    #[tokio::test]
    async fn blocked_admission_returns_item_to_approved() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let (item, _) = queue.create(draft(&h, "blocked", Some("t-1"))).await.unwrap();
        queue.approve(item.id, "owner", Some(now), now).await.unwrap();
        h.kill.engage("incident").await.unwrap();

        let summary = queue.run_due(h.workspace_id, now).await.unwrap();
        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.published, 0);

        let reloaded = QueueItem::find_by_id(&h.db.pool, item.id).await.unwrap();
        assert_eq!(reloaded.queue_status().unwrap(), QueueStatus::ApprovedScheduled);

        // Next sweep succeeds once the switch clears.
        h.kill.clear().await.unwrap();
        let retry = queue.run_due(h.workspace_id, now).await.unwrap();
        assert_eq!(retry.published, 1);
    }

    #[tokio::test]
    async fn structural_failure_is_terminal() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let (item, _) = queue.create(draft(&h, "no-thread", None)).await.unwrap();
        queue.approve(item.id, "owner", Some(now), now).await.unwrap();

        let summary = queue.run_due(h.workspace_id, now).await.unwrap();
        assert_eq!(summary.failed, 1);

        let failed = QueueItem::find_by_id(&h.db.pool, item.id).await.unwrap();
        assert_eq!(failed.queue_status().unwrap(), QueueStatus::Failed);
        assert!(failed.publish_error.unwrap().contains("thread key"));

        // Terminal: a later sweep does not touch it.
        let retry = queue.run_due(h.workspace_id, now).await.unwrap();
        assert_eq!(retry.attempted, 0);
    }

    #[tokio::test]
    async fn seed_capacity_checks_pending_cap_before_daily_target() {
        let h = harness().await;
        let queue = service(&h);
        let now = Utc::now();

        let open = queue.seed_capacity(h.workspace_id, now).await.unwrap();
        assert!(open.allowed);
        assert_eq!(open.pending_open, 12);

        for n in 0..12 {
            queue
                .create(draft(&h, &format!("fill-{n}"), Some("t")))
                .await
                .unwrap();
        }

        let full = queue.seed_capacity(h.workspace_id, now).await.unwrap();
        assert!(!full.allowed);
        assert_eq!(full.pending_open, 0);
    }
}
