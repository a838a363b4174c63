//! Daily plan-limit admission. Limits come from the workspace's plan tier;
//! usage comes from the `usage_daily` aggregate the publish engine
//! increments alongside its audit rows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use db::{
    DBService,
    models::{
        publish_audit::{PublishAuditError, Usage},
        workspace::{Workspace, WorkspaceError},
    },
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A limit of -1 means unlimited.
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Usage(#[from] PublishAuditError),
}

#[derive(Debug, Clone)]
pub struct PlanCatalog {
    limits: HashMap<String, HashMap<String, i64>>,
    fallback_plan: String,
}

impl PlanCatalog {
    /// Built-in tiers. Deployments load real plan configuration from
    /// billing; this catalog is the injected stand-in shape.
    pub fn builtin() -> Self {
        let mut limits = HashMap::new();
        limits.insert(
            "free".to_string(),
            HashMap::from([
                ("publish_reply".to_string(), 5),
                ("publish_post".to_string(), 3),
                ("publish_email".to_string(), 1),
                ("publish_blog".to_string(), 1),
                ("publish_instagram".to_string(), 1),
            ]),
        );
        limits.insert(
            "growth".to_string(),
            HashMap::from([
                ("publish_reply".to_string(), 25),
                ("publish_post".to_string(), 10),
                ("publish_email".to_string(), 5),
                ("publish_blog".to_string(), 3),
                ("publish_instagram".to_string(), 5),
            ]),
        );
        limits.insert(
            "scale".to_string(),
            HashMap::from([
                ("publish_reply".to_string(), UNLIMITED),
                ("publish_post".to_string(), UNLIMITED),
                ("publish_email".to_string(), UNLIMITED),
                ("publish_blog".to_string(), UNLIMITED),
                ("publish_instagram".to_string(), UNLIMITED),
            ]),
        );
        Self {
            limits,
            fallback_plan: "free".to_string(),
        }
    }

    pub fn with_plan(mut self, plan: &str, actions: HashMap<String, i64>) -> Self {
        self.limits.insert(plan.to_string(), actions);
        self
    }

    /// Unknown plans fall back to the most restrictive tier; unknown
    /// actions within a known plan are unlimited (not a counted action).
    pub fn limit(&self, plan: &str, action: &str) -> i64 {
        let actions = self
            .limits
            .get(plan)
            .or_else(|| self.limits.get(&self.fallback_plan));
        match actions {
            Some(actions) => actions.get(action).copied().unwrap_or(UNLIMITED),
            None => UNLIMITED,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDecision {
    pub allowed: bool,
    pub limit: i64,
    pub used: i64,
    pub remaining: i64,
}

#[derive(Clone)]
pub struct PlanLimiter {
    db: DBService,
    catalog: PlanCatalog,
}

impl PlanLimiter {
    pub fn new(db: DBService, catalog: PlanCatalog) -> Self {
        Self { db, catalog }
    }

    pub fn day_key(at: DateTime<Utc>) -> String {
        at.format("%Y-%m-%d").to_string()
    }

    /// Admission is `used + requested <= limit`. Checking never mutates
    /// usage; only a successful send increments it.
    pub async fn check(
        &self,
        workspace_id: Uuid,
        action: &str,
        requested: i64,
        at: DateTime<Utc>,
    ) -> Result<PlanDecision, PlanError> {
        let workspace = Workspace::find_by_id(&self.db.pool, workspace_id).await?;
        let limit = self.catalog.limit(&workspace.plan, action);
        let used =
            Usage::used_on_day(&self.db.pool, workspace_id, action, &Self::day_key(at)).await?;

        if limit == UNLIMITED {
            return Ok(PlanDecision {
                allowed: true,
                limit,
                used,
                remaining: UNLIMITED,
            });
        }

        Ok(PlanDecision {
            allowed: used + requested <= limit,
            limit,
            used,
            remaining: (limit - used).max(0),
        })
    }
}
