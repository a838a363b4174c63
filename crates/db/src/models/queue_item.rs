use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueItemError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Queue item not found")]
    NotFound,
    #[error("Unknown queue item kind: {0}")]
    UnknownKind(String),
    #[error("Unknown queue item status: {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemKind {
    Reply,
    Post,
    Email,
    Blog,
    Instagram,
}

impl QueueItemKind {
    pub fn parse(value: &str) -> Result<Self, QueueItemError> {
        match value {
            "reply" => Ok(QueueItemKind::Reply),
            "post" => Ok(QueueItemKind::Post),
            "email" => Ok(QueueItemKind::Email),
            "blog" => Ok(QueueItemKind::Blog),
            "instagram" => Ok(QueueItemKind::Instagram),
            other => Err(QueueItemError::UnknownKind(other.to_string())),
        }
    }
}

impl std::fmt::Display for QueueItemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueItemKind::Reply => write!(f, "reply"),
            QueueItemKind::Post => write!(f, "post"),
            QueueItemKind::Email => write!(f, "email"),
            QueueItemKind::Blog => write!(f, "blog"),
            QueueItemKind::Instagram => write!(f, "instagram"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    PendingReview,
    ApprovedScheduled,
    Publishing,
    Published,
    Failed,
    Rejected,
}

impl QueueStatus {
    /// Canonicalize a stored status, folding the legacy aliases written by
    /// earlier deployments onto the current variants. Internal logic only
    /// ever sees canonical variants.
    pub fn canonicalize(value: &str) -> Result<Self, QueueItemError> {
        match value {
            "pending_review" | "pending" => Ok(QueueStatus::PendingReview),
            "approved_scheduled" | "approved" => Ok(QueueStatus::ApprovedScheduled),
            "publishing" => Ok(QueueStatus::Publishing),
            "published" => Ok(QueueStatus::Published),
            "failed" => Ok(QueueStatus::Failed),
            "rejected" => Ok(QueueStatus::Rejected),
            other => Err(QueueItemError::UnknownStatus(other.to_string())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Published | QueueStatus::Failed | QueueStatus::Rejected
        )
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueStatus::PendingReview => write!(f, "pending_review"),
            QueueStatus::ApprovedScheduled => write!(f, "approved_scheduled"),
            QueueStatus::Publishing => write!(f, "publishing"),
            QueueStatus::Published => write!(f, "published"),
            QueueStatus::Failed => write!(f, "failed"),
            QueueStatus::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub kind: String,
    pub status: String,
    pub content: String,
    pub thread_key: Option<String>,
    pub author_key: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub window_key: Option<String>,
    pub priority: i64,
    pub idempotency_key: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub external_post_id: Option<String>,
    pub publish_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    pub fn queue_status(&self) -> Result<QueueStatus, QueueItemError> {
        QueueStatus::canonicalize(&self.status)
    }

    pub fn queue_kind(&self) -> Result<QueueItemKind, QueueItemError> {
        QueueItemKind::parse(&self.kind)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateQueueItem {
    pub workspace_id: Uuid,
    pub kind: QueueItemKind,
    pub content: String,
    pub thread_key: Option<String>,
    pub author_key: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub priority: Option<i64>,
    pub idempotency_key: String,
}

impl QueueItem {
    /// Idempotent create: a second call with the same (workspace,
    /// idempotency key) returns the first row unchanged. The bool reports
    /// whether this call inserted the row.
    pub async fn create(
        pool: &SqlitePool,
        data: CreateQueueItem,
    ) -> Result<(Self, bool), QueueItemError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO queue_items (
                id, workspace_id, kind, content, thread_key, author_key,
                scheduled_for, priority, idempotency_key
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT (workspace_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(data.workspace_id)
        .bind(data.kind.to_string())
        .bind(&data.content)
        .bind(&data.thread_key)
        .bind(&data.author_key)
        .bind(data.scheduled_for)
        .bind(data.priority.unwrap_or(0))
        .bind(&data.idempotency_key)
        .execute(pool)
        .await?;

        let created = result.rows_affected() > 0;
        let item =
            Self::find_by_idempotency_key(pool, data.workspace_id, &data.idempotency_key).await?;

        Ok((item, created))
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Self, QueueItemError> {
        sqlx::query_as::<_, QueueItem>(r#"SELECT * FROM queue_items WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(QueueItemError::NotFound)
    }

    pub async fn find_by_idempotency_key(
        pool: &SqlitePool,
        workspace_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Self, QueueItemError> {
        sqlx::query_as::<_, QueueItem>(
            r#"SELECT * FROM queue_items WHERE workspace_id = ?1 AND idempotency_key = ?2"#,
        )
        .bind(workspace_id)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueItemError::NotFound)
    }

    /// Prefix match on the hex form of the id, for human commands that
    /// quote a short id. Returns every candidate so the caller can
    /// disambiguate instead of guessing.
    pub async fn find_by_short_id(
        pool: &SqlitePool,
        workspace_id: Uuid,
        short_id: &str,
    ) -> Result<Vec<Self>, QueueItemError> {
        let prefix = short_id.replace('-', "").to_lowercase();
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT * FROM queue_items
            WHERE workspace_id = ?1 AND lower(hex(id)) LIKE ?2 || '%'
            ORDER BY created_at ASC
            "#,
        )
        .bind(workspace_id)
        .bind(&prefix)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    pub async fn approve(
        pool: &SqlitePool,
        id: Uuid,
        approved_by: &str,
        scheduled_for: DateTime<Utc>,
        window_key: Option<&str>,
    ) -> Result<Self, QueueItemError> {
        sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items SET
                status = 'approved_scheduled',
                approved_by = ?2,
                approved_at = datetime('now', 'subsec'),
                scheduled_for = ?3,
                window_key = ?4,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending_review', 'pending')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(approved_by)
        .bind(scheduled_for)
        .bind(window_key)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueItemError::NotFound)
    }

    pub async fn reject(
        pool: &SqlitePool,
        id: Uuid,
        rejected_by: &str,
        reason: Option<&str>,
    ) -> Result<Self, QueueItemError> {
        sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items SET
                status = 'rejected',
                rejected_by = ?2,
                rejected_at = datetime('now', 'subsec'),
                publish_error = ?3,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('pending_review', 'pending')
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(rejected_by)
        .bind(reason)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueItemError::NotFound)
    }

    /// Claim an approved item for publishing. Returns false when another
    /// sweep claimed it first or it left the approved state.
    pub async fn claim_for_publishing(pool: &SqlitePool, id: Uuid) -> Result<bool, QueueItemError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_items SET
                status = 'publishing',
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status IN ('approved_scheduled', 'approved')
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Return a publishing item to the approved state after a blocked
    /// admission check, so the next sweep retries it.
    pub async fn release_to_approved(pool: &SqlitePool, id: Uuid) -> Result<(), QueueItemError> {
        sqlx::query(
            r#"
            UPDATE queue_items SET
                status = 'approved_scheduled',
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND status = 'publishing'
            "#,
        )
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn mark_published(
        pool: &SqlitePool,
        id: Uuid,
        external_post_id: &str,
    ) -> Result<Self, QueueItemError> {
        sqlx::query_as::<_, QueueItem>(
            r#"
            UPDATE queue_items SET
                status = 'published',
                external_post_id = ?2,
                publish_error = NULL,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(external_post_id)
        .fetch_optional(pool)
        .await?
        .ok_or(QueueItemError::NotFound)
    }

    pub async fn mark_failed(
        pool: &SqlitePool,
        id: Uuid,
        error: &str,
    ) -> Result<(), QueueItemError> {
        sqlx::query(
            r#"
            UPDATE queue_items SET
                status = 'failed',
                publish_error = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Approved items whose scheduled time has passed (or was never set),
    /// in executor order: earliest schedule first with unscheduled items
    /// ahead, then priority, then age.
    pub async fn find_due(
        pool: &SqlitePool,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Vec<Self>, QueueItemError> {
        let items = sqlx::query_as::<_, QueueItem>(
            r#"
            SELECT * FROM queue_items
            WHERE workspace_id = ?1
              AND status IN ('approved_scheduled', 'approved')
              AND (scheduled_for IS NULL OR datetime(scheduled_for) <= datetime(?2))
            ORDER BY scheduled_for ASC NULLS FIRST, priority ASC, created_at ASC
            "#,
        )
        .bind(workspace_id)
        .bind(now)
        .fetch_all(pool)
        .await?;

        Ok(items)
    }

    /// Approved items still waiting on a future schedule.
    pub async fn count_scheduled_pending(
        pool: &SqlitePool,
        workspace_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<i64, QueueItemError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_items
            WHERE workspace_id = ?1
              AND status IN ('approved_scheduled', 'approved')
              AND scheduled_for IS NOT NULL
              AND datetime(scheduled_for) > datetime(?2)
            "#,
        )
        .bind(workspace_id)
        .bind(now)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    /// Window keys already booked by items that are still live (anything
    /// not rejected or failed keeps its claim on the window).
    pub async fn occupied_windows(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Vec<String>, QueueItemError> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT window_key FROM queue_items
            WHERE workspace_id = ?1
              AND window_key IS NOT NULL
              AND status NOT IN ('rejected', 'failed')
            "#,
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await?;

        Ok(keys)
    }

    pub async fn count_in_status(
        pool: &SqlitePool,
        workspace_id: Uuid,
        status: QueueStatus,
    ) -> Result<i64, QueueItemError> {
        // Legacy rows answer for their canonical status as well.
        let (canonical, legacy) = match status {
            QueueStatus::PendingReview => ("pending_review", "pending"),
            QueueStatus::ApprovedScheduled => ("approved_scheduled", "approved"),
            other => {
                let count: i64 = sqlx::query_scalar(
                    r#"SELECT COUNT(*) FROM queue_items WHERE workspace_id = ?1 AND status = ?2"#,
                )
                .bind(workspace_id)
                .bind(other.to_string())
                .fetch_one(pool)
                .await?;
                return Ok(count);
            }
        };

        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM queue_items WHERE workspace_id = ?1 AND status IN (?2, ?3)"#,
        )
        .bind(workspace_id)
        .bind(canonical)
        .bind(legacy)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    /// Age in minutes of the oldest item sitting in `status`, from the last
    /// time the row changed. Used by queue staleness checks.
    pub async fn oldest_in_status_minutes(
        pool: &SqlitePool,
        workspace_id: Uuid,
        status: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, QueueItemError> {
        let oldest: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(updated_at) FROM queue_items
            WHERE workspace_id = ?1 AND status = ?2
            "#,
        )
        .bind(workspace_id)
        .bind(status.to_string())
        .fetch_one(pool)
        .await?;

        Ok(oldest.map(|t| (now - t).num_minutes()))
    }

    /// Items created today, used by seeding capacity checks.
    pub async fn count_created_since(
        pool: &SqlitePool,
        workspace_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<i64, QueueItemError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM queue_items
            WHERE workspace_id = ?1 AND datetime(created_at) >= datetime(?2)
            "#,
        )
        .bind(workspace_id)
        .bind(since)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_workspace, setup_test_pool};
    use chrono::Duration;

    fn reply(workspace_id: Uuid, key: &str) -> CreateQueueItem {
        CreateQueueItem {
            workspace_id,
            kind: QueueItemKind::Reply,
            content: "thanks for the shoutout".into(),
            thread_key: Some("thread-1".into()),
            author_key: Some("author-1".into()),
            scheduled_for: None,
            priority: None,
            idempotency_key: key.into(),
        }
    }

    #[tokio::test]
    async fn create_is_idempotent_per_workspace() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;

        let (first, created) = QueueItem::create(&pool, reply(workspace_id, "seed-1"))
            .await
            .expect("create failed");
        assert!(created);

        let mut duplicate = reply(workspace_id, "seed-1");
        duplicate.content = "different text that must not overwrite".into();
        let (second, created_again) = QueueItem::create(&pool, duplicate)
            .await
            .expect("duplicate create failed");

        assert!(!created_again);
        assert_eq!(first.id, second.id);
        assert_eq!(second.content, "thanks for the shoutout");

        let count: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM queue_items WHERE workspace_id = ?1"#,
        )
        .bind(workspace_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn legacy_status_aliases_canonicalize() {
        assert_eq!(
            QueueStatus::canonicalize("pending").unwrap(),
            QueueStatus::PendingReview
        );
        assert_eq!(
            QueueStatus::canonicalize("approved").unwrap(),
            QueueStatus::ApprovedScheduled
        );
        assert!(QueueStatus::canonicalize("draft").is_err());
    }

    #[tokio::test]
    async fn legacy_rows_are_claimable_and_countable() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let (item, _) = QueueItem::create(&pool, reply(workspace_id, "legacy"))
            .await
            .unwrap();

        // Simulate a row written by an older deployment.
        sqlx::query(r#"UPDATE queue_items SET status = 'approved' WHERE id = ?1"#)
            .bind(item.id)
            .execute(&pool)
            .await
            .unwrap();

        let approved =
            QueueItem::count_in_status(&pool, workspace_id, QueueStatus::ApprovedScheduled)
                .await
                .unwrap();
        assert_eq!(approved, 1);

        let due = QueueItem::find_due(&pool, workspace_id, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(QueueItem::claim_for_publishing(&pool, item.id).await.unwrap());
    }

    #[tokio::test]
    async fn due_selection_respects_schedule_boundary_and_order() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let now = Utc::now();

        let (unscheduled, _) = QueueItem::create(&pool, reply(workspace_id, "a"))
            .await
            .unwrap();
        let (past, _) = QueueItem::create(&pool, reply(workspace_id, "b")).await.unwrap();
        let (future, _) = QueueItem::create(&pool, reply(workspace_id, "c")).await.unwrap();

        QueueItem::approve(&pool, past.id, "owner", now - Duration::minutes(5), None)
            .await
            .unwrap();
        QueueItem::approve(&pool, future.id, "owner", now + Duration::hours(1), None)
            .await
            .unwrap();
        // Approved with no schedule: sorts ahead of everything.
        sqlx::query(
            r#"UPDATE queue_items SET status = 'approved_scheduled', scheduled_for = NULL WHERE id = ?1"#,
        )
        .bind(unscheduled.id)
        .execute(&pool)
        .await
        .unwrap();

        let due = QueueItem::find_due(&pool, workspace_id, now).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![unscheduled.id, past.id]);

        let pending = QueueItem::count_scheduled_pending(&pool, workspace_id, now)
            .await
            .unwrap();
        assert_eq!(pending, 1);

        // Once the clock passes the schedule, the future item becomes due.
        let later = now + Duration::hours(2);
        let due_later = QueueItem::find_due(&pool, workspace_id, later).await.unwrap();
        assert_eq!(due_later.len(), 3);
    }

    #[tokio::test]
    async fn claim_is_single_winner() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let (item, _) = QueueItem::create(&pool, reply(workspace_id, "claim"))
            .await
            .unwrap();
        QueueItem::approve(&pool, item.id, "owner", Utc::now(), None)
            .await
            .unwrap();

        assert!(QueueItem::claim_for_publishing(&pool, item.id).await.unwrap());
        assert!(!QueueItem::claim_for_publishing(&pool, item.id).await.unwrap());

        QueueItem::release_to_approved(&pool, item.id).await.unwrap();
        assert!(QueueItem::claim_for_publishing(&pool, item.id).await.unwrap());
    }

    #[tokio::test]
    async fn short_id_prefix_returns_all_candidates() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let (item, _) = QueueItem::create(&pool, reply(workspace_id, "short"))
            .await
            .unwrap();

        let prefix = item.id.simple().to_string()[..8].to_string();
        let found = QueueItem::find_by_short_id(&pool, workspace_id, &prefix)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, item.id);

        let missing = QueueItem::find_by_short_id(&pool, workspace_id, "ffffffff")
            .await
            .unwrap();
        assert!(missing.len() <= 1);
    }
}
