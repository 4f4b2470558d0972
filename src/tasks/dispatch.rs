//! Event dispatch: what a polling delegate should look at, and abort requests.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{AbortEvent, DelegateTask, PolledEvents, TaskEvent};
use crate::clock::Clock;
use crate::error::Result;
use crate::push::{PushChannel, PushMessage};
use crate::store::TaskStore;

pub struct EventDispatcher {
    tasks: Arc<dyn TaskStore>,
    push: Arc<dyn PushChannel>,
    clock: Arc<dyn Clock>,
}

impl EventDispatcher {
    pub fn new(tasks: Arc<dyn TaskStore>, push: Arc<dyn PushChannel>, clock: Arc<dyn Clock>) -> Self {
        Self { tasks, push, clock }
    }

    /// Pending work for a delegate: queued sync tasks first, then (unless
    /// `sync_only`) queued async tasks and aborts of tasks it holds.
    ///
    /// Abort events are cleared as they are read and are delivered once.
    pub async fn poll_events(
        &self,
        account_id: &str,
        delegate_id: &str,
        sync_only: bool,
    ) -> Result<PolledEvents> {
        let mut events = PolledEvents::default();

        let sync_tasks = self.tasks.list_queued_tasks(account_id, false).await?;
        events.task_events.extend(sync_tasks.iter().map(task_event));

        if !sync_only {
            let async_tasks = self.tasks.list_queued_tasks(account_id, true).await?;
            events.task_events.extend(async_tasks.iter().map(task_event));

            let aborted = self
                .tasks
                .take_abort_events(account_id, delegate_id, self.clock.now())
                .await?;
            events.abort_events.extend(aborted.iter().map(|t| AbortEvent {
                account_id: t.account_id.clone(),
                task_id: t.id,
            }));
        }

        if !events.is_empty() {
            debug!(
                delegate_id = %delegate_id,
                tasks = events.task_events.len(),
                aborts = events.abort_events.len(),
                "Events dispatched"
            );
        }
        Ok(events)
    }

    /// Request an abort of an async task.
    ///
    /// `None` when there is nothing to abort: the task is missing, sync, or
    /// already terminal. That is not an error.
    pub async fn abort(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        let Some(aborted) = self
            .tasks
            .abort_task(account_id, task_id, self.clock.now())
            .await?
        else {
            debug!(task_id = %task_id, "No abortable task, abort ignored");
            return Ok(None);
        };

        info!(task_id = %task_id, delegate_id = ?aborted.delegate_id, "Task aborted");
        if let Err(e) = self
            .push
            .broadcast(account_id, PushMessage::TaskAborted { task_id })
            .await
        {
            warn!(task_id = %task_id, error = %e, "Failed to push abort");
        }
        Ok(Some(aborted))
    }
}

fn task_event(task: &DelegateTask) -> TaskEvent {
    TaskEvent {
        account_id: task.account_id.clone(),
        task_id: task.id,
        sync: !task.is_async,
    }
}
