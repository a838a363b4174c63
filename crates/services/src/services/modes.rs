//! Operational mode and pause state per workspace. The relational row is
//! authoritative; the key-value entry is a read-through cache refreshed on
//! read and rewritten on every transition.

use std::sync::Arc;
use std::time::Duration;

use db::{
    DBService,
    models::{
        workspace::{Workspace, WorkspaceError},
        workspace_mode::{OperationalMode, WorkspaceMode, WorkspaceModeError},
    },
};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::cache::{KvError, KvStore};

/// Token a caller must supply to enter autonomous_limited.
pub const AUTONOMOUS_CONFIRM_TOKEN: &str = "confirm-autonomous";

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ModeError {
    #[error(transparent)]
    Mode(#[from] WorkspaceModeError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Cache(#[from] KvError),
    #[error("entering autonomous_limited requires the confirmation token")]
    ConfirmationRequired,
}

#[derive(Clone)]
pub struct ModeService {
    db: DBService,
    kv: Arc<dyn KvStore>,
    namespace: String,
    cache_ttl: Duration,
}

impl ModeService {
    pub fn new(db: DBService, kv: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            db,
            kv,
            namespace: namespace.to_string(),
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    fn mode_key(&self, workspace_id: Uuid) -> String {
        format!("{}:{}:mode", self.namespace, workspace_id)
    }

    fn pause_key(&self, workspace_id: Uuid) -> String {
        format!("{}:{}:paused", self.namespace, workspace_id)
    }

    /// Cache-first; a miss (or an unparseable cached value) falls back to
    /// the database and refreshes the cache. Workspaces with no row yet
    /// are `manual`.
    pub async fn current(&self, workspace_id: Uuid) -> Result<OperationalMode, ModeError> {
        let key = self.mode_key(workspace_id);
        if let Some(cached) = self.kv.get(&key).await? {
            if let Ok(mode) = OperationalMode::parse(&cached) {
                return Ok(mode);
            }
        }

        let mode = match WorkspaceMode::get(&self.db.pool, workspace_id).await? {
            Some(row) => OperationalMode::parse(&row.mode)?,
            None => OperationalMode::default(),
        };
        self.kv
            .set(&key, &mode.to_string(), Some(self.cache_ttl))
            .await?;
        Ok(mode)
    }

    /// The only mutation path for modes. Writes the durable row first,
    /// then invalidates and rewrites the cache.
    pub async fn transition(
        &self,
        workspace_id: Uuid,
        target: OperationalMode,
        actor: &str,
        confirm: Option<&str>,
    ) -> Result<OperationalMode, ModeError> {
        if target == OperationalMode::AutonomousLimited && confirm != Some(AUTONOMOUS_CONFIRM_TOKEN)
        {
            return Err(ModeError::ConfirmationRequired);
        }

        WorkspaceMode::upsert(&self.db.pool, workspace_id, target, actor).await?;

        let key = self.mode_key(workspace_id);
        self.kv.delete(&key).await?;
        self.kv
            .set(&key, &target.to_string(), Some(self.cache_ttl))
            .await?;

        info!(%workspace_id, mode = %target, actor, "operational mode transition");
        Ok(target)
    }

    /// Idempotent: returns whether the durable flag actually flipped.
    pub async fn pause(&self, workspace_id: Uuid) -> Result<bool, ModeError> {
        let changed = Workspace::set_paused(&self.db.pool, workspace_id, true).await?;
        self.kv
            .set(&self.pause_key(workspace_id), "1", Some(self.cache_ttl))
            .await?;
        if changed {
            info!(%workspace_id, "workspace paused");
        }
        Ok(changed)
    }

    pub async fn resume(&self, workspace_id: Uuid) -> Result<bool, ModeError> {
        let changed = Workspace::set_paused(&self.db.pool, workspace_id, false).await?;
        self.kv
            .set(&self.pause_key(workspace_id), "0", Some(self.cache_ttl))
            .await?;
        if changed {
            info!(%workspace_id, "workspace resumed");
        }
        Ok(changed)
    }

    pub async fn is_paused(&self, workspace_id: Uuid) -> Result<bool, ModeError> {
        let key = self.pause_key(workspace_id);
        if let Some(cached) = self.kv.get(&key).await? {
            return Ok(cached == "1");
        }

        let workspace = Workspace::find_by_id(&self.db.pool, workspace_id).await?;
        self.kv
            .set(&key, if workspace.paused { "1" } else { "0" }, Some(self.cache_ttl))
            .await?;
        Ok(workspace.paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::MemoryKv;
    use db::models::test_utils::{create_test_workspace, setup_test_pool};

    async fn service() -> (ModeService, Uuid) {
        let pool = setup_test_pool().await;
        let workspace_id = create_test_workspace(&pool).await;
        let db = DBService { pool };
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        (ModeService::new(db, kv, "testns"), workspace_id)
    }

    #[tokio::test]
    async fn defaults_to_manual_without_a_row() {
        let (modes, workspace_id) = service().await;
        assert_eq!(
            modes.current(workspace_id).await.unwrap(),
            OperationalMode::Manual
        );
    }

    #[tokio::test]
    async fn autonomous_limited_requires_confirmation() {
        let (modes, workspace_id) = service().await;

        let denied = modes
            .transition(workspace_id, OperationalMode::AutonomousLimited, "owner", None)
            .await;
        assert!(matches!(denied, Err(ModeError::ConfirmationRequired)));

        let wrong = modes
            .transition(
                workspace_id,
                OperationalMode::AutonomousLimited,
                "owner",
                Some("yes"),
            )
            .await;
        assert!(matches!(wrong, Err(ModeError::ConfirmationRequired)));

        let granted = modes
            .transition(
                workspace_id,
                OperationalMode::AutonomousLimited,
                "owner",
                Some(AUTONOMOUS_CONFIRM_TOKEN),
            )
            .await
            .unwrap();
        assert_eq!(granted, OperationalMode::AutonomousLimited);
        assert_eq!(
            modes.current(workspace_id).await.unwrap(),
            OperationalMode::AutonomousLimited
        );
    }

    #[tokio::test]
    async fn transition_supersedes_cached_mode() {
        let (modes, workspace_id) = service().await;

        // Warm the cache.
        assert_eq!(
            modes.current(workspace_id).await.unwrap(),
            OperationalMode::Manual
        );

        modes
            .transition(workspace_id, OperationalMode::Containment, "guard", None)
            .await
            .unwrap();
        assert_eq!(
            modes.current(workspace_id).await.unwrap(),
            OperationalMode::Containment
        );
    }

    #[tokio::test]
    async fn stale_cache_is_overridden_by_database() {
        let (modes, workspace_id) = service().await;

        // A divergent cache entry loses to the durable row on the next
        // transition-free read cycle.
        modes
            .kv
            .set(
                &modes.mode_key(workspace_id),
                "not-a-mode",
                Some(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        assert_eq!(
            modes.current(workspace_id).await.unwrap(),
            OperationalMode::Manual
        );
    }

    #[tokio::test]
    async fn pause_roundtrip_is_idempotent() {
        let (modes, workspace_id) = service().await;

        assert!(!modes.is_paused(workspace_id).await.unwrap());
        assert!(modes.pause(workspace_id).await.unwrap());
        assert!(!modes.pause(workspace_id).await.unwrap());
        assert!(modes.is_paused(workspace_id).await.unwrap());
        assert!(modes.resume(workspace_id).await.unwrap());
        assert!(!modes.is_paused(workspace_id).await.unwrap());
    }
}
