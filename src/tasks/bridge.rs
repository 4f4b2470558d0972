//! Execution bridge: how callers submit tasks and how results come back.
//!
//! Async submissions return immediately and the response goes to the waiter
//! registered under the task's wait id. Sync submissions block the caller,
//! polling the store until the task is terminal or its timeout elapses.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{DelegateTask, TaskResponse, TaskStatus};
use super::queue::TaskQueue;
use super::waiters::WaitNotifier;
use crate::clock::Clock;
use crate::delegates::EligibilityFilter;
use crate::error::{BrokerError, Result};
use crate::push::{PushChannel, PushMessage};
use crate::store::TaskStore;

pub struct ExecutionBridge {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    eligibility: Arc<EligibilityFilter>,
    push: Arc<dyn PushChannel>,
    waiters: Arc<dyn WaitNotifier>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl ExecutionBridge {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<TaskQueue>,
        eligibility: Arc<EligibilityFilter>,
        push: Arc<dyn PushChannel>,
        waiters: Arc<dyn WaitNotifier>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            tasks,
            queue,
            eligibility,
            push,
            waiters,
            clock,
            poll_interval,
        }
    }

    /// Queue a fire-and-forget task. Returns its id.
    pub async fn submit_async(&self, mut task: DelegateTask) -> Result<DelegateTask> {
        validate(&task)?;
        task.is_async = true;
        if task.wait_id.as_deref().is_none_or(|w| w.trim().is_empty()) {
            task.wait_id = Some(Uuid::new_v4().to_string());
        }
        self.queue_and_announce(task).await
    }

    /// Queue a task and block until it finishes or times out.
    pub async fn submit_sync(&self, mut task: DelegateTask) -> Result<TaskResponse> {
        validate(&task)?;
        task.is_async = false;
        let timeout = task.timeout_duration();
        let task = self.queue_and_announce(task).await?;
        let task_id = task.id;

        let finished = match tokio::time::timeout(
            timeout,
            self.wait_for_terminal(&task.account_id, task_id),
        )
        .await
        {
            Ok(outcome) => outcome?,
            Err(_) => {
                warn!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "Sync task timed out");
                return Err(BrokerError::ExecutionTimeout { task_id, timeout }.into());
            }
        };

        if let Err(e) = self.tasks.delete_task(&finished.account_id, task_id).await {
            warn!(task_id = %task_id, error = %e, "Failed to delete finished sync task");
        }

        match finished.notify_response {
            Some(response) => {
                info!(task_id = %task_id, status = %finished.status, "Sync task completed");
                Ok(response)
            }
            None => Err(BrokerError::NoResponse { task_id }.into()),
        }
    }

    /// A delegate reports the outcome of a task.
    pub async fn submit_result(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        response: TaskResponse,
    ) -> Result<()> {
        let Some(task) = self.tasks.get_task(account_id, task_id).await? else {
            warn!(task_id = %task_id, delegate_id = %delegate_id, "Result for unknown task ignored");
            return Ok(());
        };

        if task.delegate_id.as_deref().is_some_and(|holder| holder != delegate_id) {
            warn!(
                task_id = %task_id,
                delegate_id = %delegate_id,
                holder = ?task.delegate_id,
                "Result reported by a delegate that does not hold the task"
            );
        }

        if task.is_async {
            match task.wait_id.as_deref() {
                Some(wait_id) => {
                    if let Err(e) = self.waiters.notify(wait_id, response).await {
                        warn!(task_id = %task_id, wait_id = %wait_id, error = %e, "Failed to notify waiter");
                    }
                }
                None => error!(task_id = %task_id, "Async task has no wait id, response dropped"),
            }
            self.tasks.delete_task(account_id, task_id).await?;
            info!(task_id = %task_id, delegate_id = %delegate_id, "Async task completed");
        } else {
            let status = if response.failed {
                TaskStatus::Error
            } else {
                TaskStatus::Finished
            };
            let completed = self
                .tasks
                .complete_task(account_id, task_id, &response, status, self.clock.now())
                .await?;
            match completed {
                Some(_) => debug!(task_id = %task_id, status = %status, "Sync task response stored"),
                None => warn!(task_id = %task_id, "Sync task already terminal, response ignored"),
            }
        }
        Ok(())
    }

    pub async fn task_status(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        self.queue.get(account_id, task_id).await
    }

    pub async fn delegate_tasks(&self, account_id: &str, delegate_id: &str) -> Result<Vec<DelegateTask>> {
        Ok(self.tasks.list_delegate_tasks(account_id, delegate_id).await?)
    }

    async fn queue_and_announce(&self, task: DelegateTask) -> Result<DelegateTask> {
        self.eligibility.check_and_alert(&task).await;
        let task = self.queue.enqueue(task).await?;
        let message = PushMessage::TaskQueued {
            task_id: task.id,
            sync: !task.is_async,
        };
        if let Err(e) = self.push.broadcast(&task.account_id, message).await {
            warn!(task_id = %task.id, error = %e, "Failed to push task");
        }
        Ok(task)
    }

    /// Poll until the task is terminal. Store errors are retried on the next tick.
    async fn wait_for_terminal(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        let mut tick = tokio::time::interval(self.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            match self.tasks.get_task(account_id, task_id).await {
                Ok(None) => return Err(BrokerError::TaskVanished { task_id }.into()),
                Ok(Some(task)) if task.status.is_terminal() => return Ok(task),
                Ok(Some(_)) => {}
                Err(e) => warn!(task_id = %task_id, error = %e, "Polling sync task failed"),
            }
        }
    }
}

fn validate(task: &DelegateTask) -> Result<()> {
    if task.account_id.trim().is_empty() {
        return Err(BrokerError::InvalidTask("account id is required".into()).into());
    }
    if task.task_type.trim().is_empty() {
        return Err(BrokerError::InvalidTask("task type is required".into()).into());
    }
    if task.timeout == 0 {
        return Err(BrokerError::InvalidTask("timeout must be positive".into()).into());
    }
    if i64::try_from(task.timeout).is_err() {
        return Err(BrokerError::InvalidTask(format!("timeout {}ms is out of range", task.timeout)).into());
    }
    Ok(())
}
