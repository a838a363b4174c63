//! Global, time-boxed publish kill-switch. The TTL means an unacknowledged
//! switch self-heals; acknowledging re-asserts it with a longer TTL
//! without re-evaluating the criteria that tripped it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::cache::{KvError, KvStore};

pub const DEFAULT_KILL_SWITCH_TTL: Duration = Duration::from_secs(3600);
pub const ACKNOWLEDGED_KILL_SWITCH_TTL: Duration = Duration::from_secs(6 * 3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub reason: String,
    pub engaged_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
}

#[derive(Clone)]
pub struct KillSwitch {
    kv: Arc<dyn KvStore>,
    namespace: String,
    ttl: Duration,
    ack_ttl: Duration,
}

impl KillSwitch {
    pub fn new(kv: Arc<dyn KvStore>, namespace: &str) -> Self {
        Self {
            kv,
            namespace: namespace.to_string(),
            ttl: DEFAULT_KILL_SWITCH_TTL,
            ack_ttl: ACKNOWLEDGED_KILL_SWITCH_TTL,
        }
    }

    fn key(&self) -> String {
        format!("{}:global:kill_switch", self.namespace)
    }

    pub async fn engage(&self, reason: &str) -> Result<KillSwitchState, KvError> {
        let state = KillSwitchState {
            reason: reason.to_string(),
            engaged_at: Utc::now(),
            acknowledged_by: None,
        };
        self.write(&state, self.ttl).await?;
        warn!(reason, "global kill switch engaged");
        Ok(state)
    }

    pub async fn current(&self) -> Result<Option<KillSwitchState>, KvError> {
        let Some(raw) = self.kv.get(&self.key()).await? else {
            return Ok(None);
        };
        // An unreadable value still means "engaged"; fail closed.
        let state = serde_json::from_str(&raw).unwrap_or(KillSwitchState {
            reason: raw,
            engaged_at: Utc::now(),
            acknowledged_by: None,
        });
        Ok(Some(state))
    }

    pub async fn is_engaged(&self) -> Result<bool, KvError> {
        Ok(self.current().await?.is_some())
    }

    /// Re-assert the flag with the longer acknowledged TTL. Returns the
    /// updated state, or `None` when there was nothing to acknowledge.
    pub async fn acknowledge(&self, actor: &str) -> Result<Option<KillSwitchState>, KvError> {
        let Some(mut state) = self.current().await? else {
            return Ok(None);
        };
        state.acknowledged_by = Some(actor.to_string());
        self.write(&state, self.ack_ttl).await?;
        info!(actor, "kill switch acknowledged and extended");
        Ok(Some(state))
    }

    pub async fn clear(&self) -> Result<(), KvError> {
        self.kv.delete(&self.key()).await?;
        info!("kill switch cleared");
        Ok(())
    }

    pub async fn remaining_ttl(&self) -> Result<Option<Duration>, KvError> {
        self.kv.ttl(&self.key()).await
    }

    async fn write(&self, state: &KillSwitchState, ttl: Duration) -> Result<(), KvError> {
        let raw = serde_json::to_string(state)
            .map_err(|e| KvError::Backend(format!("serialize kill switch state: {e}")))?;
        self.kv.set(&self.key(), &raw, Some(ttl)).await
    }
}
