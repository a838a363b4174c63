//! Embedded schema bootstrap.
//!
//! All statements are idempotent so the same bootstrap serves fresh
//! deployments, upgrades that add tables, and the in-memory test pool.

use sqlx::SqlitePool;

pub async fn ensure(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS workspaces (
            id BLOB PRIMARY KEY,
            name TEXT NOT NULL,
            subscription_status TEXT NOT NULL DEFAULT 'active',
            plan TEXT NOT NULL DEFAULT 'free',
            paused INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS workspace_modes (
            workspace_id BLOB PRIMARY KEY REFERENCES workspaces(id) ON DELETE CASCADE,
            mode TEXT NOT NULL DEFAULT 'manual',
            updated_by TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            id BLOB PRIMARY KEY,
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            kind TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending_review',
            content TEXT NOT NULL,
            thread_key TEXT,
            author_key TEXT,
            scheduled_for TEXT,
            window_key TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            idempotency_key TEXT NOT NULL,
            approved_by TEXT,
            approved_at TEXT,
            rejected_by TEXT,
            rejected_at TEXT,
            external_post_id TEXT,
            publish_error TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            UNIQUE (workspace_id, idempotency_key)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS publish_cooldowns (
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            scope TEXT NOT NULL,
            scope_key TEXT NOT NULL,
            cooldown_until TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            PRIMARY KEY (workspace_id, scope, scope_key)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS pipeline_runs (
            id BLOB PRIMARY KEY,
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            pipeline TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'running',
            result TEXT,
            started_at TEXT NOT NULL DEFAULT (datetime('now','subsec')),
            finished_at TEXT,
            UNIQUE (workspace_id, idempotency_key)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS publish_audit (
            id BLOB PRIMARY KEY,
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            queue_item_id BLOB REFERENCES queue_items(id) ON DELETE SET NULL,
            action TEXT NOT NULL,
            status TEXT NOT NULL,
            external_id TEXT,
            error TEXT,
            payload TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS usage_events (
            id BLOB PRIMARY KEY,
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            action TEXT NOT NULL,
            amount INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS usage_daily (
            workspace_id BLOB NOT NULL REFERENCES workspaces(id) ON DELETE CASCADE,
            action TEXT NOT NULL,
            day TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (workspace_id, action, day)
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS workspace_events (
            id BLOB PRIMARY KEY,
            workspace_id BLOB REFERENCES workspaces(id) ON DELETE CASCADE,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now','subsec'))
        );
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_queue_items_status
            ON queue_items(workspace_id, status);
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_publish_audit_created
            ON publish_audit(workspace_id, created_at);
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS idx_workspace_events_type
            ON workspace_events(event_type, created_at);
        "#,
    ];

    for statement in statements {
        sqlx::query(statement).execute(pool).await?;
    }

    Ok(())
}
