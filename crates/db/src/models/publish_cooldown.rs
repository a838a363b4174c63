use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishCooldownError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    Thread,
    Author,
}

impl std::fmt::Display for CooldownScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CooldownScope::Thread => write!(f, "thread"),
            CooldownScope::Author => write!(f, "author"),
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PublishCooldown {
    pub workspace_id: Uuid,
    pub scope: String,
    pub scope_key: String,
    pub cooldown_until: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PublishCooldown {
    /// The active cooldown deadline for a scope, if one is still in force.
    pub async fn active_until(
        pool: &SqlitePool,
        workspace_id: Uuid,
        scope: CooldownScope,
        scope_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, PublishCooldownError> {
        let until: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT cooldown_until FROM publish_cooldowns
            WHERE workspace_id = ?1 AND scope = ?2 AND scope_key = ?3
              AND datetime(cooldown_until) > datetime(?4)
            "#,
        )
        .bind(workspace_id)
        .bind(scope.to_string())
        .bind(scope_key)
        .bind(now)
        .fetch_optional(pool)
        .await?;

        Ok(until)
    }

    pub async fn upsert(
        pool: &SqlitePool,
        workspace_id: Uuid,
        scope: CooldownScope,
        scope_key: &str,
        cooldown_until: DateTime<Utc>,
    ) -> Result<(), PublishCooldownError> {
        sqlx::query(
            r#"
            INSERT INTO publish_cooldowns (workspace_id, scope, scope_key, cooldown_until)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (workspace_id, scope, scope_key) DO UPDATE SET
                cooldown_until = excluded.cooldown_until,
                updated_at = datetime('now', 'subsec')
            "#,
        )
        .bind(workspace_id)
        .bind(scope.to_string())
        .bind(scope_key)
        .bind(cooldown_until)
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_utils::{create_test_workspace, setup_test_pool};
    use chrono::Duration;

    #[tokio::test]
    async fn cooldown_expires_and_upsert_extends() {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let now = Utc::now();

        PublishCooldown::upsert(
            &pool,
            workspace_id,
            CooldownScope::Thread,
            "thread-9",
            now + Duration::minutes(30),
        )
        .await
        .expect("upsert failed");

        let active =
            PublishCooldown::active_until(&pool, workspace_id, CooldownScope::Thread, "thread-9", now)
                .await
                .unwrap();
        assert!(active.is_some());

        // Same key, other scope: unaffected.
        let author =
            PublishCooldown::active_until(&pool, workspace_id, CooldownScope::Author, "thread-9", now)
                .await
                .unwrap();
        assert!(author.is_none());

        // After the window passes, the scope is clear again.
        let later = now + Duration::minutes(31);
        let expired =
            PublishCooldown::active_until(&pool, workspace_id, CooldownScope::Thread, "thread-9", later)
                .await
                .unwrap();
        assert!(expired.is_none());

        // A fresh publish re-arms the same row.
        PublishCooldown::upsert(
            &pool,
            workspace_id,
            CooldownScope::Thread,
            "thread-9",
            later + Duration::minutes(30),
        )
        .await
        .unwrap();
        let rearmed =
            PublishCooldown::active_until(&pool, workspace_id, CooldownScope::Thread, "thread-9", later)
                .await
                .unwrap();
        assert!(rearmed.is_some());
    }
}
