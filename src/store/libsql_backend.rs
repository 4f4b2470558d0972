//! libSQL backend: async `DelegateStore` and `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Every guarded mutation is a
//! single `UPDATE ... WHERE <guard> RETURNING` statement, so the guard check
//! and the write cannot interleave with another caller.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use uuid::Uuid;

use crate::delegates::model::{Delegate, DelegateScope, DelegateStatus};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{DelegateStore, TaskStore};
use crate::tasks::model::{DelegateTask, TaskResponse, TaskStatus};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Run all pending schema migrations.
    pub async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_delegates<P: IntoParams + Send>(
        &self,
        op: &str,
        sql: &str,
        params: P,
    ) -> Result<Vec<Delegate>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut delegates = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            delegates.push(row_to_delegate(&row)?);
        }
        Ok(delegates)
    }

    async fn query_tasks<P: IntoParams + Send>(
        &self,
        op: &str,
        sql: &str,
        params: P,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(field: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn text(row: &libsql::Row, idx: i32, field: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

fn integer(row: &libsql::Row, idx: i32, field: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{field}: {e}")))
}

/// SQL expression adding `param` to the JSON array in `column`, without duplicates.
fn add_to_set(column: &str, param: &str) -> String {
    format!(
        "CASE WHEN EXISTS (SELECT 1 FROM json_each({column}) WHERE value = {param}) \
         THEN {column} ELSE json_insert({column}, '$[#]', {param}) END"
    )
}

// ── Delegates ───────────────────────────────────────────────────────

/// Column list for delegate SELECT/RETURNING (13 columns).
const DELEGATE_COLUMNS: &str = "id, account_id, host_name, ip, description, version, supported_task_types, include_scopes, exclude_scopes, connected, status, last_heartbeat, created_at";

fn row_to_delegate(row: &libsql::Row) -> Result<Delegate, DatabaseError> {
    let status_str = text(row, 10, "delegate.status")?;
    let status: DelegateStatus = status_str.parse().map_err(DatabaseError::Serialization)?;

    Ok(Delegate {
        id: text(row, 0, "delegate.id")?,
        account_id: text(row, 1, "delegate.account_id")?,
        host_name: text(row, 2, "delegate.host_name")?,
        ip: text(row, 3, "delegate.ip")?,
        description: row.get::<String>(4).ok(),
        version: row.get::<String>(5).ok(),
        supported_task_types: from_json(
            "delegate.supported_task_types",
            &text(row, 6, "delegate.supported_task_types")?,
        )?,
        include_scopes: from_json(
            "delegate.include_scopes",
            &text(row, 7, "delegate.include_scopes")?,
        )?,
        exclude_scopes: from_json(
            "delegate.exclude_scopes",
            &text(row, 8, "delegate.exclude_scopes")?,
        )?,
        connected: integer(row, 9, "delegate.connected")? != 0,
        status,
        last_heartbeat: from_millis(integer(row, 11, "delegate.last_heartbeat")?),
        created_at: from_millis(integer(row, 12, "delegate.created_at")?),
    })
}

#[async_trait]
impl DelegateStore for LibSqlBackend {
    async fn find_delegate_by_host(
        &self,
        account_id: &str,
        host_name: &str,
        ip: Option<&str>,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let found = match ip {
            Some(ip) => {
                self.query_delegates(
                    "find_delegate_by_host",
                    &format!(
                        "SELECT {DELEGATE_COLUMNS} FROM delegates \
                         WHERE account_id = ?1 AND host_name = ?2 AND ip = ?3 \
                         ORDER BY created_at ASC LIMIT 1"
                    ),
                    params![account_id, host_name, ip],
                )
                .await?
            }
            None => {
                self.query_delegates(
                    "find_delegate_by_host",
                    &format!(
                        "SELECT {DELEGATE_COLUMNS} FROM delegates \
                         WHERE account_id = ?1 AND host_name = ?2 \
                         ORDER BY created_at ASC LIMIT 1"
                    ),
                    params![account_id, host_name],
                )
                .await?
            }
        };
        Ok(found.into_iter().next())
    }

    async fn insert_delegate(&self, delegate: &Delegate) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO delegates (id, account_id, host_name, ip, description, version, supported_task_types, include_scopes, exclude_scopes, connected, status, last_heartbeat, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    delegate.id.as_str(),
                    delegate.account_id.as_str(),
                    delegate.host_name.as_str(),
                    delegate.ip.as_str(),
                    delegate.description.as_deref(),
                    delegate.version.as_deref(),
                    to_json(&delegate.supported_task_types)?,
                    to_json(&delegate.include_scopes)?,
                    to_json(&delegate.exclude_scopes)?,
                    delegate.connected as i64,
                    delegate.status.as_str(),
                    delegate.last_heartbeat.timestamp_millis(),
                    delegate.created_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_delegate: {e}")))?;
        debug!(delegate_id = %delegate.id, account_id = %delegate.account_id, "Delegate inserted");
        Ok(())
    }

    async fn update_delegate_registration(
        &self,
        delegate: &Delegate,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let updated = self
            .query_delegates(
                "update_delegate_registration",
                &format!(
                    "UPDATE delegates SET host_name = ?3, ip = ?4, description = ?5, version = ?6, \
                     supported_task_types = ?7, connected = 1, last_heartbeat = ?8 \
                     WHERE account_id = ?1 AND id = ?2 RETURNING {DELEGATE_COLUMNS}"
                ),
                params![
                    delegate.account_id.as_str(),
                    delegate.id.as_str(),
                    delegate.host_name.as_str(),
                    delegate.ip.as_str(),
                    delegate.description.as_deref(),
                    delegate.version.as_deref(),
                    to_json(&delegate.supported_task_types)?,
                    delegate.last_heartbeat.timestamp_millis(),
                ],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn get_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let found = self
            .query_delegates(
                "get_delegate",
                &format!("SELECT {DELEGATE_COLUMNS} FROM delegates WHERE account_id = ?1 AND id = ?2"),
                params![account_id, delegate_id],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn record_heartbeat(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let updated = self
            .query_delegates(
                "record_heartbeat",
                &format!(
                    "UPDATE delegates SET last_heartbeat = MAX(last_heartbeat, ?3), connected = 1 \
                     WHERE account_id = ?1 AND id = ?2 RETURNING {DELEGATE_COLUMNS}"
                ),
                params![account_id, delegate_id, at.timestamp_millis()],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn update_delegate_status(
        &self,
        account_id: &str,
        delegate_id: &str,
        status: DelegateStatus,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let updated = self
            .query_delegates(
                "update_delegate_status",
                &format!(
                    "UPDATE delegates SET status = ?3 \
                     WHERE account_id = ?1 AND id = ?2 RETURNING {DELEGATE_COLUMNS}"
                ),
                params![account_id, delegate_id, status.as_str()],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn update_delegate_scopes(
        &self,
        account_id: &str,
        delegate_id: &str,
        include: &[DelegateScope],
        exclude: &[DelegateScope],
    ) -> Result<Option<Delegate>, DatabaseError> {
        let updated = self
            .query_delegates(
                "update_delegate_scopes",
                &format!(
                    "UPDATE delegates SET include_scopes = ?3, exclude_scopes = ?4 \
                     WHERE account_id = ?1 AND id = ?2 RETURNING {DELEGATE_COLUMNS}"
                ),
                params![account_id, delegate_id, to_json(include)?, to_json(exclude)?],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn delete_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<Delegate>, DatabaseError> {
        let deleted = self
            .query_delegates(
                "delete_delegate",
                &format!(
                    "DELETE FROM delegates WHERE account_id = ?1 AND id = ?2 RETURNING {DELEGATE_COLUMNS}"
                ),
                params![account_id, delegate_id],
            )
            .await?;
        Ok(deleted.into_iter().next())
    }

    async fn list_delegates(&self, account_id: &str) -> Result<Vec<Delegate>, DatabaseError> {
        self.query_delegates(
            "list_delegates",
            &format!(
                "SELECT {DELEGATE_COLUMNS} FROM delegates WHERE account_id = ?1 ORDER BY created_at ASC"
            ),
            params![account_id],
        )
        .await
    }

    async fn list_live_delegates(
        &self,
        account_id: &str,
        task_type: &str,
        heartbeat_after: DateTime<Utc>,
    ) -> Result<Vec<Delegate>, DatabaseError> {
        self.query_delegates(
            "list_live_delegates",
            &format!(
                "SELECT {DELEGATE_COLUMNS} FROM delegates \
                 WHERE account_id = ?1 AND connected = 1 AND status = 'enabled' \
                 AND last_heartbeat > ?2 \
                 AND EXISTS (SELECT 1 FROM json_each(supported_task_types) WHERE value = ?3) \
                 ORDER BY created_at ASC"
            ),
            params![account_id, heartbeat_after.timestamp_millis(), task_type],
        )
        .await
    }

    async fn disconnect_stale_delegates(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Delegate>, DatabaseError> {
        self.query_delegates(
            "disconnect_stale_delegates",
            &format!(
                "UPDATE delegates SET connected = 0 \
                 WHERE connected = 1 AND last_heartbeat < ?1 RETURNING {DELEGATE_COLUMNS}"
            ),
            params![heartbeat_before.timestamp_millis()],
        )
        .await
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// Column list for task SELECT/RETURNING (20 columns).
const TASK_COLUMNS: &str = "id, account_id, app_id, env_id, infrastructure_mapping_id, task_type, task_group, parameters, target, is_async, wait_id, delegate_id, status, validating_delegate_ids, validation_complete_delegate_ids, validation_started_at, notify_response, timeout_ms, created_at, last_updated_at";

/// Guard shared by every write that must only land on an unassigned task.
const UNASSIGNED_GUARD: &str = "account_id = ?1 AND id = ?2 AND status = 'queued' AND delegate_id IS NULL";

fn row_to_task(row: &libsql::Row) -> Result<DelegateTask, DatabaseError> {
    let id_str = text(row, 0, "task.id")?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Query(format!("task.id parse: {e}")))?;

    let status: TaskStatus = text(row, 12, "task.status")?
        .parse()
        .map_err(DatabaseError::Serialization)?;

    let notify_response: Option<TaskResponse> = match row.get::<String>(16).ok() {
        Some(raw) if !raw.is_empty() => Some(from_json("task.notify_response", &raw)?),
        _ => None,
    };

    Ok(DelegateTask {
        id,
        account_id: text(row, 1, "task.account_id")?,
        app_id: row.get::<String>(2).ok(),
        env_id: row.get::<String>(3).ok(),
        infrastructure_mapping_id: row.get::<String>(4).ok(),
        task_type: text(row, 5, "task.task_type")?,
        task_group: text(row, 6, "task.task_group")?,
        parameters: from_json("task.parameters", &text(row, 7, "task.parameters")?)?,
        target: from_json("task.target", &text(row, 8, "task.target")?)?,
        is_async: integer(row, 9, "task.is_async")? != 0,
        wait_id: row.get::<String>(10).ok(),
        delegate_id: row.get::<String>(11).ok(),
        status,
        validating_delegate_ids: from_json(
            "task.validating_delegate_ids",
            &text(row, 13, "task.validating_delegate_ids")?,
        )?,
        validation_complete_delegate_ids: from_json(
            "task.validation_complete_delegate_ids",
            &text(row, 14, "task.validation_complete_delegate_ids")?,
        )?,
        validation_started_at: row.get::<i64>(15).ok().map(from_millis),
        notify_response,
        timeout: integer(row, 17, "task.timeout_ms")?.max(0) as u64,
        created_at: from_millis(integer(row, 18, "task.created_at")?),
        last_updated_at: from_millis(integer(row, 19, "task.last_updated_at")?),
    })
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn insert_task(&self, task: &DelegateTask) -> Result<(), DatabaseError> {
        let notify_response = match &task.notify_response {
            Some(response) => Some(to_json(response)?),
            None => None,
        };

        let timeout = i64::try_from(task.timeout).map_err(|_| {
            DatabaseError::Serialization(format!("task timeout {}ms out of range", task.timeout))
        })?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO delegate_tasks ({TASK_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
                ),
                params![
                    task.id.to_string(),
                    task.account_id.as_str(),
                    task.app_id.as_deref(),
                    task.env_id.as_deref(),
                    task.infrastructure_mapping_id.as_deref(),
                    task.task_type.as_str(),
                    task.task_group.as_str(),
                    to_json(&task.parameters)?,
                    to_json(&task.target)?,
                    task.is_async as i64,
                    task.wait_id.as_deref(),
                    task.delegate_id.as_deref(),
                    task.status.as_str(),
                    to_json(&task.validating_delegate_ids)?,
                    to_json(&task.validation_complete_delegate_ids)?,
                    task.validation_started_at.map(|t| t.timestamp_millis()),
                    notify_response,
                    timeout,
                    task.created_at.timestamp_millis(),
                    task.last_updated_at.timestamp_millis(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;
        debug!(task_id = %task.id, task_type = %task.task_type, "Task inserted");
        Ok(())
    }

    async fn get_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let found = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM delegate_tasks WHERE account_id = ?1 AND id = ?2"),
                params![account_id, task_id.to_string()],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn get_unassigned_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let found = self
            .query_tasks(
                "get_unassigned_task",
                &format!("SELECT {TASK_COLUMNS} FROM delegate_tasks WHERE {UNASSIGNED_GUARD}"),
                params![account_id, task_id.to_string()],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn begin_validation(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let validating = add_to_set("validating_delegate_ids", "?3");
        let updated = self
            .query_tasks(
                "begin_validation",
                &format!(
                    "UPDATE delegate_tasks SET validating_delegate_ids = {validating}, \
                     validation_started_at = COALESCE(validation_started_at, ?4), \
                     last_updated_at = ?4 \
                     WHERE {UNASSIGNED_GUARD} RETURNING {TASK_COLUMNS}"
                ),
                params![account_id, task_id.to_string(), delegate_id, at.timestamp_millis()],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn mark_validation_complete(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let complete = add_to_set("validation_complete_delegate_ids", "?3");
        let updated = self
            .query_tasks(
                "mark_validation_complete",
                &format!(
                    "UPDATE delegate_tasks SET validation_complete_delegate_ids = {complete}, \
                     last_updated_at = ?4 \
                     WHERE {UNASSIGNED_GUARD} RETURNING {TASK_COLUMNS}"
                ),
                params![account_id, task_id.to_string(), delegate_id, at.timestamp_millis()],
            )
            .await?;
        Ok(updated.into_iter().next())
    }

    async fn claim_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let claimed = self
            .query_tasks(
                "claim_task",
                &format!(
                    "UPDATE delegate_tasks SET delegate_id = ?3, status = 'started', \
                     validating_delegate_ids = '[]', validation_complete_delegate_ids = '[]', \
                     last_updated_at = ?4 \
                     WHERE {UNASSIGNED_GUARD} RETURNING {TASK_COLUMNS}"
                ),
                params![account_id, task_id.to_string(), delegate_id, at.timestamp_millis()],
            )
            .await?;
        Ok(claimed.into_iter().next())
    }

    async fn start_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let started = self
            .query_tasks(
                "start_task",
                &format!(
                    "UPDATE delegate_tasks SET status = 'started', last_updated_at = ?4 \
                     WHERE account_id = ?1 AND id = ?2 AND delegate_id = ?3 \
                     AND status IN ('queued', 'started') RETURNING {TASK_COLUMNS}"
                ),
                params![account_id, task_id.to_string(), delegate_id, at.timestamp_millis()],
            )
            .await?;
        Ok(started.into_iter().next())
    }

    async fn complete_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        response: &TaskResponse,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let completed = self
            .query_tasks(
                "complete_task",
                &format!(
                    "UPDATE delegate_tasks SET notify_response = ?3, status = ?4, last_updated_at = ?5 \
                     WHERE account_id = ?1 AND id = ?2 AND status IN ('queued', 'started') \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![
                    account_id,
                    task_id.to_string(),
                    to_json(response)?,
                    status.as_str(),
                    at.timestamp_millis(),
                ],
            )
            .await?;
        Ok(completed.into_iter().next())
    }

    async fn abort_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let aborted = self
            .query_tasks(
                "abort_task",
                &format!(
                    "UPDATE delegate_tasks SET status = 'aborted', last_updated_at = ?3 \
                     WHERE account_id = ?1 AND id = ?2 AND is_async = 1 \
                     AND status IN ('queued', 'started') RETURNING {TASK_COLUMNS}"
                ),
                params![account_id, task_id.to_string(), at.timestamp_millis()],
            )
            .await?;
        Ok(aborted.into_iter().next())
    }

    async fn delete_task(&self, account_id: &str, task_id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM delegate_tasks WHERE account_id = ?1 AND id = ?2",
                params![account_id, task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(count > 0)
    }

    async fn list_queued_tasks(
        &self,
        account_id: &str,
        is_async: bool,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.query_tasks(
            "list_queued_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM delegate_tasks \
                 WHERE account_id = ?1 AND status = 'queued' AND delegate_id IS NULL AND is_async = ?2 \
                 ORDER BY created_at ASC"
            ),
            params![account_id, is_async as i64],
        )
        .await
    }

    async fn take_abort_events(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.query_tasks(
            "take_abort_events",
            &format!(
                "UPDATE delegate_tasks SET delegate_id = NULL, last_updated_at = ?3 \
                 WHERE account_id = ?1 AND delegate_id = ?2 AND status = 'aborted' AND is_async = 1 \
                 RETURNING {TASK_COLUMNS}"
            ),
            params![account_id, delegate_id, at.timestamp_millis()],
        )
        .await
    }

    async fn list_delegate_tasks(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.query_tasks(
            "list_delegate_tasks",
            &format!(
                "SELECT {TASK_COLUMNS} FROM delegate_tasks \
                 WHERE account_id = ?1 AND delegate_id = ?2 AND status IN ('queued', 'started') \
                 ORDER BY created_at ASC"
            ),
            params![account_id, delegate_id],
        )
        .await
    }

    async fn task_ids_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id FROM delegate_tasks WHERE created_at < ?1 ORDER BY created_at ASC LIMIT ?2",
                params![cutoff.timestamp_millis(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_ids_created_before: {e}")))?;

        let mut ids = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("task_ids_created_before row: {e}")))?
        {
            let id_str = text(&row, 0, "task.id")?;
            let id = Uuid::parse_str(&id_str)
                .map_err(|e| DatabaseError::Query(format!("task.id parse: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn delete_tasks(&self, ids: &[Uuid]) -> Result<usize, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let id_list: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let count = self
            .conn()
            .execute(
                "DELETE FROM delegate_tasks WHERE id IN (SELECT value FROM json_each(?1))",
                params![to_json(&id_list)?],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_tasks: {e}")))?;
        Ok(count as usize)
    }
}
