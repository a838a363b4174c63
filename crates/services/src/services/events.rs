//! Structured event emission and operator alerting. Both are narrow
//! collaborator interfaces; the default event sink writes to the
//! `workspace_events` table, which the stability guard also reads.

use async_trait::async_trait;
use db::{DBService, models::workspace_event::WorkspaceEvent};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event sink error: {0}")]
    Sink(String),
}

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(
        &self,
        workspace_id: Option<Uuid>,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EventError>;
}

#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<(), AlertError>;

    /// Lightweight health probe for the stability guard.
    async fn healthy(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct DbEventSink {
    db: DBService,
}

impl DbEventSink {
    pub fn new(db: DBService) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EventSink for DbEventSink {
    async fn emit(
        &self,
        workspace_id: Option<Uuid>,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), EventError> {
        WorkspaceEvent::record(&self.db.pool, workspace_id, event_type, payload)
            .await
            .map_err(|e| EventError::Sink(e.to_string()))?;
        Ok(())
    }
}

/// Emit without failing the surrounding operation; event loss is logged,
/// never propagated into the caller's result.
pub async fn emit_best_effort(
    sink: &dyn EventSink,
    workspace_id: Option<Uuid>,
    event_type: &str,
    payload: &serde_json::Value,
) {
    if let Err(e) = sink.emit(workspace_id, event_type, payload).await {
        warn!(event_type, error = %e, "failed to emit event");
    }
}
