//! Per-workspace distributed locks. At most one pipeline run per workspace
//! holds the scheduler lock at any instant; correctness rests on the
//! store's atomic set-if-absent and compare-and-delete, never on
//! single-process assumptions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use super::cache::{KvError, KvStore};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Proof of acquisition. Release only succeeds while the stored token
/// still matches, so a handle that outlived its TTL cannot steal the lock
/// back from a newer holder.
#[derive(Debug, Clone)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(kv: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self::with_ttl(kv, namespace, DEFAULT_LOCK_TTL)
    }

    pub fn with_ttl(kv: Arc<dyn KvStore>, namespace: &str, ttl: Duration) -> Self {
        Self {
            kv,
            namespace: namespace.to_string(),
            ttl,
        }
    }

    fn scheduler_key(&self, workspace_id: Uuid) -> String {
        format!("{}:{}:scheduler:lock", self.namespace, workspace_id)
    }

    fn pipeline_key(&self, workspace_id: Uuid, pipeline: &str) -> String {
        format!(
            "{}:{}:control:run:{}:lock",
            self.namespace, workspace_id, pipeline
        )
    }

    /// `None` means another run holds the lock; the caller skips this
    /// workspace for the cycle. Contention is not an error.
    pub async fn acquire(&self, workspace_id: Uuid) -> Result<Option<LockHandle>, KvError> {
        self.acquire_key(self.scheduler_key(workspace_id)).await
    }

    /// Lock for a command-triggered pipeline run, separate from the
    /// scheduler sweep lock.
    pub async fn acquire_pipeline(
        &self,
        workspace_id: Uuid,
        pipeline: &str,
    ) -> Result<Option<LockHandle>, KvError> {
        self.acquire_key(self.pipeline_key(workspace_id, pipeline)).await
    }

    async fn acquire_key(&self, key: String) -> Result<Option<LockHandle>, KvError> {
        let token = Uuid::new_v4().simple().to_string();
        if self.kv.set_nx(&key, &token, self.ttl).await? {
            debug!(key, "lock acquired");
            Ok(Some(LockHandle { key, token }))
        } else {
            debug!(key, "lock held elsewhere");
            Ok(None)
        }
    }

    /// Returns false when the entry was already gone or re-acquired by
    /// another holder after TTL expiry; either way there is nothing left
    /// to release.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, KvError> {
        let released = self
            .kv
            .compare_and_delete(&handle.key, &handle.token)
            .await?;
        if !released {
            warn!(key = %handle.key, "lock was not held by this token at release");
        }
        Ok(released)
    }

    /// Number of live lock entries in this namespace. The stability guard
    /// reads this as its lock anomaly signal.
    pub async fn active_lock_count(&self) -> Result<usize, KvError> {
        let keys = self
            .kv
            .keys_with_prefix(&format!("{}:", self.namespace))
            .await?;
        Ok(keys.iter().filter(|k| k.ends_with(":lock")).count())
    }
}
