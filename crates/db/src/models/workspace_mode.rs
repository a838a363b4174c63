//! Durable copy of each workspace's operational mode. The cache layer in
//! the services crate fronts this table; this row is always ground truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceModeError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Unknown operational mode: {0}")]
    UnknownMode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationalMode {
    Manual,
    SemiAutonomous,
    AutonomousLimited,
    Containment,
}

impl OperationalMode {
    pub fn parse(value: &str) -> Result<Self, WorkspaceModeError> {
        match value {
            "manual" => Ok(OperationalMode::Manual),
            "semi_autonomous" => Ok(OperationalMode::SemiAutonomous),
            "autonomous_limited" => Ok(OperationalMode::AutonomousLimited),
            "containment" => Ok(OperationalMode::Containment),
            other => Err(WorkspaceModeError::UnknownMode(other.to_string())),
        }
    }

    /// Modes under which the scheduler may run the pipeline unattended.
    pub fn allows_scheduling(&self) -> bool {
        matches!(
            self,
            OperationalMode::SemiAutonomous | OperationalMode::AutonomousLimited
        )
    }

    /// Containment blocks publishing unless an explicit owner override is
    /// supplied with the request.
    pub fn blocks_publishing(&self) -> bool {
        matches!(self, OperationalMode::Containment)
    }
}

impl Default for OperationalMode {
    fn default() -> Self {
        OperationalMode::Manual
    }
}

impl std::fmt::Display for OperationalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationalMode::Manual => write!(f, "manual"),
            OperationalMode::SemiAutonomous => write!(f, "semi_autonomous"),
            OperationalMode::AutonomousLimited => write!(f, "autonomous_limited"),
            OperationalMode::Containment => write!(f, "containment"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorkspaceMode {
    pub workspace_id: Uuid,
    pub mode: String,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkspaceMode {
    pub async fn get(
        pool: &SqlitePool,
        workspace_id: Uuid,
    ) -> Result<Option<Self>, WorkspaceModeError> {
        let row = sqlx::query_as::<_, WorkspaceMode>(
            r#"SELECT * FROM workspace_modes WHERE workspace_id = ?1"#,
        )
        .bind(workspace_id)
        .fetch_optional(pool)
        .await?;

        Ok(row)
    }

    pub async fn upsert(
        pool: &SqlitePool,
        workspace_id: Uuid,
        mode: OperationalMode,
        updated_by: &str,
    ) -> Result<Self, WorkspaceModeError> {
        let row = sqlx::query_as::<_, WorkspaceMode>(
            r#"
            INSERT INTO workspace_modes (workspace_id, mode, updated_by)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (workspace_id) DO UPDATE SET
                mode = excluded.mode,
                updated_by = excluded.updated_by,
                updated_at = datetime('now', 'subsec')
            RETURNING *
            "#,
        )
        .bind(workspace_id)
        .bind(mode.to_string())
        .bind(updated_by)
        .fetch_one(pool)
        .await?;

        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_workspace, setup_test_pool};

    #[tokio::test]
    async fn upsert_replaces_existing_mode() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;

        assert!(WorkspaceMode::get(&pool, workspace_id).await.unwrap().is_none());

        WorkspaceMode::upsert(&pool, workspace_id, OperationalMode::SemiAutonomous, "owner")
            .await
            .expect("upsert failed");
        let row = WorkspaceMode::upsert(&pool, workspace_id, OperationalMode::Containment, "guard")
            .await
            .expect("upsert failed");

        assert_eq!(row.mode, "containment");
        assert_eq!(row.updated_by.as_deref(), Some("guard"));

        let fetched = WorkspaceMode::get(&pool, workspace_id).await.unwrap().unwrap();
        assert_eq!(
            OperationalMode::parse(&fetched.mode).unwrap(),
            OperationalMode::Containment
        );
    }

    #[test]
    fn mode_gating() {
        assert!(!OperationalMode::Manual.allows_scheduling());
        assert!(OperationalMode::SemiAutonomous.allows_scheduling());
        assert!(OperationalMode::AutonomousLimited.allows_scheduling());
        assert!(!OperationalMode::Containment.allows_scheduling());
        assert!(OperationalMode::Containment.blocks_publishing());
    }
}
