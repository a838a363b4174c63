use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceEventError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Durable backing for the audit/event sink. Scheduler outcomes, executor
/// summaries, stability reports, and command errors all land here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkspaceEvent {
    pub id: Uuid,
    pub workspace_id: Option<Uuid>,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl WorkspaceEvent {
    pub async fn record(
        pool: &SqlitePool,
        workspace_id: Option<Uuid>,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Uuid, WorkspaceEventError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO workspace_events (id, workspace_id, event_type, payload)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(event_type)
        .bind(payload.to_string())
        .execute(pool)
        .await?;

        Ok(id)
    }

    pub async fn count_since(
        pool: &SqlitePool,
        workspace_id: Uuid,
        event_type: &str,
        since: DateTime<Utc>,
    ) -> Result<i64, WorkspaceEventError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM workspace_events
            WHERE workspace_id = ?1 AND event_type = ?2
              AND datetime(created_at) >= datetime(?3)
            "#,
        )
        .bind(workspace_id)
        .bind(event_type)
        .bind(since)
        .fetch_one(pool)
        .await?;

        Ok(count)
    }

    pub async fn recent(
        pool: &SqlitePool,
        workspace_id: Uuid,
        event_type: &str,
        limit: i64,
    ) -> Result<Vec<Self>, WorkspaceEventError> {
        let events = sqlx::query_as::<_, WorkspaceEvent>(
            r#"
            SELECT * FROM workspace_events
            WHERE workspace_id = ?1 AND event_type = ?2
            ORDER BY created_at DESC
            LIMIT ?3
            "#,
        )
        .bind(workspace_id)
        .bind(event_type)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(events)
    }
}
