use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Workspace not found")]
    NotFound,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    Inactive,
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionStatus::Active => write!(f, "active"),
            SubscriptionStatus::Trialing => write!(f, "trialing"),
            SubscriptionStatus::Inactive => write!(f, "inactive"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Workspace {
    pub id: Uuid,
    pub name: String,
    pub subscription_status: String,
    pub plan: String,
    pub paused: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateWorkspace {
    pub name: String,
    pub subscription_status: Option<SubscriptionStatus>,
    pub plan: Option<String>,
}

impl Workspace {
    pub async fn create(pool: &SqlitePool, data: CreateWorkspace) -> Result<Self, WorkspaceError> {
        let id = Uuid::new_v4();
        let status = data
            .subscription_status
            .unwrap_or(SubscriptionStatus::Active)
            .to_string();
        let plan = data.plan.unwrap_or_else(|| "free".to_string());

        let workspace = sqlx::query_as::<_, Workspace>(
            r#"
            INSERT INTO workspaces (id, name, subscription_status, plan)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&data.name)
        .bind(&status)
        .bind(&plan)
        .fetch_one(pool)
        .await?;

        Ok(workspace)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Self, WorkspaceError> {
        sqlx::query_as::<_, Workspace>(r#"SELECT * FROM workspaces WHERE id = ?1"#)
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(WorkspaceError::NotFound)
    }

    /// Workspaces eligible for scheduled automation, oldest first so no
    /// tenant starves behind newer signups.
    pub async fn find_schedulable(pool: &SqlitePool) -> Result<Vec<Self>, WorkspaceError> {
        let workspaces = sqlx::query_as::<_, Workspace>(
            r#"
            SELECT * FROM workspaces
            WHERE subscription_status IN ('active', 'trialing')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(pool)
        .await?;

        Ok(workspaces)
    }

    /// Returns true when the flag actually changed, so callers can apply
    /// the pause idempotently.
    pub async fn set_paused(
        pool: &SqlitePool,
        id: Uuid,
        paused: bool,
    ) -> Result<bool, WorkspaceError> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces SET
                paused = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1 AND paused != ?2
            "#,
        )
        .bind(id)
        .bind(paused)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_subscription_status(
        pool: &SqlitePool,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), WorkspaceError> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces SET
                subscription_status = ?2,
                updated_at = datetime('now', 'subsec')
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .execute(pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(WorkspaceError::NotFound);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::setup_test_pool;

    #[tokio::test]
    async fn schedulable_excludes_inactive() {
        let pool = setup_test_pool().await;

        let active = Workspace::create(
            &pool,
            CreateWorkspace {
                name: "active".into(),
                subscription_status: Some(SubscriptionStatus::Active),
                plan: None,
            },
        )
        .await
        .expect("create failed");

        let trialing = Workspace::create(
            &pool,
            CreateWorkspace {
                name: "trialing".into(),
                subscription_status: Some(SubscriptionStatus::Trialing),
                plan: None,
            },
        )
        .await
        .expect("create failed");

        let churned = Workspace::create(
            &pool,
            CreateWorkspace {
                name: "churned".into(),
                subscription_status: Some(SubscriptionStatus::Inactive),
                plan: None,
            },
        )
        .await
        .expect("create failed");

        let eligible = Workspace::find_schedulable(&pool).await.expect("lookup failed");
        let ids: Vec<Uuid> = eligible.iter().map(|w| w.id).collect();

        assert!(ids.contains(&active.id));
        assert!(ids.contains(&trialing.id));
        assert!(!ids.contains(&churned.id));
    }

    #[tokio::test]
    async fn pause_is_idempotent() {
        let pool = setup_test_pool().await;
        let workspace = Workspace::create(
            &pool,
            CreateWorkspace {
                name: "pausable".into(),
                subscription_status: None,
                plan: None,
            },
        )
        .await
        .expect("create failed");

        assert!(Workspace::set_paused(&pool, workspace.id, true).await.unwrap());
        assert!(!Workspace::set_paused(&pool, workspace.id, true).await.unwrap());

        let reloaded = Workspace::find_by_id(&pool, workspace.id).await.unwrap();
        assert!(reloaded.paused);
    }
}
