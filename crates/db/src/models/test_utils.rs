//! Shared test support: an isolated in-memory database with the full
//! schema, plus helpers for seeding tenants. Used by this crate's model
//! tests and by the services crate's orchestration tests.

use std::str::FromStr;

use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use uuid::Uuid;

use super::workspace::{CreateWorkspace, SubscriptionStatus, Workspace};
use crate::schema;

pub async fn setup_test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("invalid sqlite config")
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("failed to open sqlite memory db");

    schema::ensure(&pool).await.expect("schema bootstrap failed");

    pool
}

pub async fn create_test_workspace(pool: &SqlitePool) -> Uuid {
    create_test_workspace_with(pool, "free", SubscriptionStatus::Active).await
}

pub async fn create_test_workspace_with(
    pool: &SqlitePool,
    plan: &str,
    status: SubscriptionStatus,
) -> Uuid {
    let workspace = Workspace::create(
        pool,
        CreateWorkspace {
            name: format!("test-workspace-{}", Uuid::new_v4().simple()),
            subscription_status: Some(status),
            plan: Some(plan.to_string()),
        },
    )
    .await
    .expect("failed to create test workspace");

    workspace.id
}
