//! Store traits: the single async interface the broker uses for persistence.
//!
//! Every mutation is one conditional write keyed by natural identity plus a
//! state guard. Methods that return `Option` report `None` when the guard did
//! not match, which callers treat as "someone else got there first".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::delegates::model::{Delegate, DelegateScope, DelegateStatus};
use crate::error::DatabaseError;
use crate::tasks::model::{DelegateTask, TaskResponse, TaskStatus};

/// Registered delegates and their liveness.
#[async_trait]
pub trait DelegateStore: Send + Sync {
    /// Find a delegate by registration identity. `ip = None` matches on host name only.
    async fn find_delegate_by_host(
        &self,
        account_id: &str,
        host_name: &str,
        ip: Option<&str>,
    ) -> Result<Option<Delegate>, DatabaseError>;

    async fn insert_delegate(&self, delegate: &Delegate) -> Result<(), DatabaseError>;

    /// Refresh registration fields of an existing delegate and mark it connected.
    /// Identity and operator status are kept.
    async fn update_delegate_registration(
        &self,
        delegate: &Delegate,
    ) -> Result<Option<Delegate>, DatabaseError>;

    async fn get_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<Delegate>, DatabaseError>;

    /// Set `last_heartbeat = at` and `connected = true`.
    async fn record_heartbeat(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Delegate>, DatabaseError>;

    async fn update_delegate_status(
        &self,
        account_id: &str,
        delegate_id: &str,
        status: DelegateStatus,
    ) -> Result<Option<Delegate>, DatabaseError>;

    async fn update_delegate_scopes(
        &self,
        account_id: &str,
        delegate_id: &str,
        include: &[DelegateScope],
        exclude: &[DelegateScope],
    ) -> Result<Option<Delegate>, DatabaseError>;

    /// Delete and return the removed delegate.
    async fn delete_delegate(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Option<Delegate>, DatabaseError>;

    async fn list_delegates(&self, account_id: &str) -> Result<Vec<Delegate>, DatabaseError>;

    /// Connected, enabled delegates supporting `task_type` whose last
    /// heartbeat is after `heartbeat_after`.
    async fn list_live_delegates(
        &self,
        account_id: &str,
        task_type: &str,
        heartbeat_after: DateTime<Utc>,
    ) -> Result<Vec<Delegate>, DatabaseError>;

    /// Flip every connected delegate with a heartbeat before `heartbeat_before`
    /// to disconnected and return the ones changed.
    async fn disconnect_stale_delegates(
        &self,
        heartbeat_before: DateTime<Utc>,
    ) -> Result<Vec<Delegate>, DatabaseError>;
}

/// Durable task queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &DelegateTask) -> Result<(), DatabaseError>;

    async fn get_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// The task, only if it is queued with no delegate.
    async fn get_unassigned_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Add `delegate_id` to the validating set and stamp `validation_started_at`
    /// if unset. Guarded on the task being unassigned.
    async fn begin_validation(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Add `delegate_id` to the validation-complete set. Guarded on the task
    /// being unassigned.
    async fn mark_validation_complete(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Atomically assign an unassigned task to `delegate_id`, set it Started
    /// and clear both validation sets. At most one caller ever gets `Some`.
    async fn claim_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Owner acknowledgement: status = Started where `delegate_id` is the owner.
    async fn start_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Store the response and a terminal status on a non-terminal task.
    async fn complete_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        response: &TaskResponse,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    /// Flip an async Queued or Started task to Aborted.
    async fn abort_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError>;

    async fn delete_task(&self, account_id: &str, task_id: Uuid) -> Result<bool, DatabaseError>;

    /// Unassigned queued tasks of one mode, oldest first.
    async fn list_queued_tasks(
        &self,
        account_id: &str,
        is_async: bool,
    ) -> Result<Vec<DelegateTask>, DatabaseError>;

    /// Select aborted async tasks held by `delegate_id` and clear their
    /// delegate in the same statement so each is delivered once.
    async fn take_abort_events(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<DelegateTask>, DatabaseError>;

    /// Non-terminal tasks currently held by a delegate.
    async fn list_delegate_tasks(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<DelegateTask>, DatabaseError>;

    async fn task_ids_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    /// Delete by id. Returns the number of rows removed.
    async fn delete_tasks(&self, ids: &[Uuid]) -> Result<usize, DatabaseError>;
}
