//! Task queue with at-most-once assignment.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use super::model::{DelegateTask, TaskStatus};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::TaskStore;

pub struct TaskQueue {
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(tasks: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { tasks, clock }
    }

    /// Persist a task as queued and unassigned.
    pub async fn enqueue(&self, mut task: DelegateTask) -> Result<DelegateTask> {
        let now = self.clock.now();
        task.status = TaskStatus::Queued;
        task.delegate_id = None;
        task.validating_delegate_ids.clear();
        task.validation_complete_delegate_ids.clear();
        task.validation_started_at = None;
        task.notify_response = None;
        task.created_at = now;
        task.last_updated_at = now;

        self.tasks.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            account_id = %task.account_id,
            task_type = %task.task_type,
            is_async = task.is_async,
            "Task queued"
        );
        Ok(task)
    }

    /// Assign the task to `delegate_id` if nobody holds it yet.
    ///
    /// `None` means the claim was lost (or the task is gone); it is not an error.
    pub async fn claim(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        let claimed = self
            .tasks
            .claim_task(account_id, task_id, delegate_id, self.clock.now())
            .await?;
        match &claimed {
            Some(_) => info!(task_id = %task_id, delegate_id = %delegate_id, "Task assigned"),
            None => debug!(task_id = %task_id, delegate_id = %delegate_id, "Claim lost"),
        }
        Ok(claimed)
    }

    /// The owning delegate acknowledges it is running the task.
    pub async fn start(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        let started = self
            .tasks
            .start_task(account_id, task_id, delegate_id, self.clock.now())
            .await?;
        if started.is_none() {
            debug!(task_id = %task_id, delegate_id = %delegate_id, "Start ignored: not the owner");
        }
        Ok(started)
    }

    pub async fn get(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        Ok(self.tasks.get_task(account_id, task_id).await?)
    }
}
