//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//! Timestamps are integer epoch milliseconds; sets are JSON text arrays.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "delegates",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delegates (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                host_name TEXT NOT NULL,
                ip TEXT NOT NULL,
                description TEXT,
                version TEXT,
                supported_task_types TEXT NOT NULL DEFAULT '[]',
                include_scopes TEXT NOT NULL DEFAULT '[]',
                exclude_scopes TEXT NOT NULL DEFAULT '[]',
                connected INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'enabled',
                last_heartbeat INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delegates_account ON delegates(account_id);
            CREATE INDEX IF NOT EXISTS idx_delegates_host ON delegates(account_id, host_name);
            CREATE INDEX IF NOT EXISTS idx_delegates_heartbeat ON delegates(connected, last_heartbeat);
        "#,
    },
    Migration {
        version: 2,
        name: "delegate_tasks",
        sql: r#"
            CREATE TABLE IF NOT EXISTS delegate_tasks (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                app_id TEXT,
                env_id TEXT,
                infrastructure_mapping_id TEXT,
                task_type TEXT NOT NULL,
                task_group TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT 'null',
                target TEXT NOT NULL DEFAULT '{"kind":"unscoped"}',
                is_async INTEGER NOT NULL DEFAULT 0,
                wait_id TEXT,
                delegate_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                validating_delegate_ids TEXT NOT NULL DEFAULT '[]',
                validation_complete_delegate_ids TEXT NOT NULL DEFAULT '[]',
                validation_started_at INTEGER,
                notify_response TEXT,
                timeout_ms INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_delegate_tasks_queue ON delegate_tasks(account_id, status, is_async);
            CREATE INDEX IF NOT EXISTS idx_delegate_tasks_delegate ON delegate_tasks(account_id, delegate_id);
            CREATE INDEX IF NOT EXISTS idx_delegate_tasks_created ON delegate_tasks(created_at);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!(
        version = get_current_version(conn).await?,
        "Database migrations complete"
    );
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
