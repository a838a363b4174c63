//! Publish attempt audit trail plus usage accounting. The usage increment
//! and the audit row for a successful send are written in one transaction
//! so the two can never diverge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Executor, FromRow, Sqlite, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishAuditError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PublishAudit {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub queue_item_id: Option<Uuid>,
    pub action: String,
    pub status: String,
    pub external_id: Option<String>,
    pub error: Option<String>,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RecordAudit<'a> {
    pub workspace_id: Uuid,
    pub queue_item_id: Option<Uuid>,
    pub action: &'a str,
    pub status: &'a str,
    pub external_id: Option<&'a str>,
    pub error: Option<&'a str>,
    pub payload: Option<&'a serde_json::Value>,
}

impl PublishAudit {
    pub async fn record<'e, E>(executor: E, data: RecordAudit<'_>) -> Result<Uuid, PublishAuditError>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO publish_audit (
                id, workspace_id, queue_item_id, action, status,
                external_id, error, payload
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(id)
        .bind(data.workspace_id)
        .bind(data.queue_item_id)
        .bind(data.action)
        .bind(data.status)
        .bind(data.external_id)
        .bind(data.error)
        .bind(data.payload.map(|p| p.to_string()))
        .execute(executor)
        .await?;

        Ok(id)
    }

    pub async fn count_with_status_since(
        pool: &SqlitePool,
        workspace_id: Uuid,
        statuses: &[&str],
        since: DateTime<Utc>,
    ) -> Result<i64, PublishAuditError> {
        // Status lists are short and fixed; build the placeholder list.
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            SELECT COUNT(*) FROM publish_audit
            WHERE workspace_id = ?1 AND datetime(created_at) >= datetime(?2)
              AND status IN ({placeholders})
            "#
        );

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(workspace_id)
            .bind(since);
        for status in statuses {
            query = query.bind(*status);
        }

        Ok(query.fetch_one(pool).await?)
    }

    /// Length of the trailing run of failed attempts, newest first. A
    /// single successful publish resets the streak.
    pub async fn consecutive_failures(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<i64, PublishAuditError> {
        let recent: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT status FROM publish_audit
            WHERE workspace_id = ?1 AND status IN ('published', 'failed')
            ORDER BY created_at DESC, id DESC
            LIMIT 50
            "#,
        )
        .bind(workspace_id)
        .fetch_all(pool)
        .await?;

        let streak = recent.iter().take_while(|s| s.as_str() == "failed").count();
        Ok(streak as i64)
    }
}

pub struct Usage;

impl Usage {
    /// Append a raw usage event and bump the daily aggregate. Callers pass
    /// the transaction that also writes the publish audit row.
    pub async fn increment(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        workspace_id: Uuid,
        action: &str,
        amount: i64,
        day: &str,
    ) -> Result<(), PublishAuditError> {
        sqlx::query(
            r#"INSERT INTO usage_events (id, workspace_id, action, amount) VALUES (?1, ?2, ?3, ?4)"#,
        )
        .bind(Uuid::new_v4())
        .bind(workspace_id)
        .bind(action)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO usage_daily (workspace_id, action, day, used)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (workspace_id, action, day) DO UPDATE SET
                used = used + excluded.used
            "#,
        )
        .bind(workspace_id)
        .bind(action)
        .bind(day)
        .bind(amount)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn used_on_day(
        pool: &SqlitePool,
        workspace_id: Uuid,
        action: &str,
        day: &str,
    ) -> Result<i64, PublishAuditError> {
        let used: Option<i64> = sqlx::query_scalar(
            r#"SELECT used FROM usage_daily WHERE workspace_id = ?1 AND action = ?2 AND day = ?3"#,
        )
        .bind(workspace_id)
        .bind(action)
        .bind(day)
        .fetch_optional(pool)
        .await?;

        Ok(used.unwrap_or(0))
    }
}
