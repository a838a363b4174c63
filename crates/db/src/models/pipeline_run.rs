use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineRunError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Pipeline run not found")]
    NotFound,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub pipeline: String,
    pub idempotency_key: String,
    pub status: String,
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Start a run, or return the run a previous command with the same key
    /// already produced. The bool reports whether this call started it.
    pub async fn start_or_get(
        pool: &SqlitePool,
        workspace_id: Uuid,
        pipeline: &str,
        idempotency_key: &str,
    ) -> Result<(Self, bool), PipelineRunError> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_runs (id, workspace_id, pipeline, idempotency_key)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (workspace_id, idempotency_key) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(workspace_id)
        .bind(pipeline)
        .bind(idempotency_key)
        .execute(pool)
        .await?;

        let started = result.rows_affected() > 0;
        let run = sqlx::query_as::<_, PipelineRun>(
            r#"SELECT * FROM pipeline_runs WHERE workspace_id = ?1 AND idempotency_key = ?2"#,
        )
        .bind(workspace_id)
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?
        .ok_or(PipelineRunError::NotFound)?;

        Ok((run, started))
    }

    pub async fn complete(
        pool: &SqlitePool,
        id: Uuid,
        status: &str,
        result: &serde_json::Value,
    ) -> Result<Self, PipelineRunError> {
        sqlx::query_as::<_, PipelineRun>(
            r#"
            UPDATE pipeline_runs SET
                status = ?2,
                result = ?3,
                finished_at = datetime('now', 'subsec')
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(result.to_string())
        .fetch_optional(pool)
        .await?
        .ok_or(PipelineRunError::NotFound)
    }
}
