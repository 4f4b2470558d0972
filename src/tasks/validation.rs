//! Probe-then-claim: a delegate proves it can reach a task's target before
//! the task is committed to it.
//!
//! Whitelisted delegates claim directly. Everyone else is recorded as
//! validating and probes out of band, then reports. A positive report claims.
//! When every validating delegate has reported (or the validation timeout
//! passed) and nobody live is whitelisted, `proceed_anyway` force-claims so
//! the task does not sit queued forever.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::model::{ConnectionResult, DelegateTask};
use super::queue::TaskQueue;
use crate::assign::AssignDelegateService;
use crate::clock::{Clock, to_chrono};
use crate::config::ProceedAnywayPolicy;
use crate::delegates::EligibilityFilter;
use crate::error::Result;
use crate::store::TaskStore;

/// Validation is over when every validating delegate reported, or when it
/// started more than `timeout` ago.
pub fn validation_complete(task: &DelegateTask, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
    let all_reported = !task.validating_delegate_ids.is_empty()
        && task
            .validating_delegate_ids
            .iter()
            .all(|id| task.validation_complete_delegate_ids.contains(id));
    let timed_out = task
        .validation_started_at
        .is_some_and(|started| now - started > timeout);
    all_reported || timed_out
}

pub struct ValidationCoordinator {
    tasks: Arc<dyn TaskStore>,
    queue: Arc<TaskQueue>,
    eligibility: Arc<EligibilityFilter>,
    assigner: Arc<dyn AssignDelegateService>,
    clock: Arc<dyn Clock>,
    validation_timeout: chrono::Duration,
    policy: ProceedAnywayPolicy,
}

impl ValidationCoordinator {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        queue: Arc<TaskQueue>,
        eligibility: Arc<EligibilityFilter>,
        assigner: Arc<dyn AssignDelegateService>,
        clock: Arc<dyn Clock>,
        validation_timeout: std::time::Duration,
        policy: ProceedAnywayPolicy,
    ) -> Self {
        Self {
            tasks,
            queue,
            eligibility,
            assigner,
            clock,
            validation_timeout: to_chrono(validation_timeout),
            policy,
        }
    }

    /// A delegate asks for a task it learned about.
    ///
    /// Returns the claimed task (`delegate_id` set to the caller), the
    /// still-unassigned task when the caller must validate first, or `None`.
    pub async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        let Some(task) = self.tasks.get_unassigned_task(account_id, task_id).await? else {
            debug!(task_id = %task_id, delegate_id = %delegate_id, "Acquire: task not available");
            return Ok(None);
        };

        if !self.eligibility.qualifies(delegate_id, &task).await? {
            info!(task_id = %task_id, delegate_id = %delegate_id, "Acquire: delegate no longer qualifies");
            self.eligibility.check_and_alert(&task).await;
            return Ok(None);
        }

        let whitelisted = match self.assigner.is_whitelisted(&task, delegate_id).await {
            Ok(whitelisted) => whitelisted,
            Err(e) => {
                warn!(task_id = %task_id, delegate_id = %delegate_id, error = %e, "Whitelist lookup failed");
                false
            }
        };
        if whitelisted {
            return self.queue.claim(account_id, delegate_id, task_id).await;
        }

        let validating = self
            .tasks
            .begin_validation(account_id, task_id, delegate_id, self.clock.now())
            .await?;
        if validating.is_some() {
            info!(task_id = %task_id, delegate_id = %delegate_id, "Validation started");
        }
        Ok(validating)
    }

    /// A delegate reports its connectivity probe results.
    pub async fn report_validation_result(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        mut results: Vec<ConnectionResult>,
    ) -> Result<Option<DelegateTask>> {
        for result in &mut results {
            result.account_id = account_id.to_string();
            result.delegate_id = delegate_id.to_string();
        }
        if let Err(e) = self.assigner.save_connection_results(&results).await {
            warn!(task_id = %task_id, delegate_id = %delegate_id, error = %e, "Failed to save connection results");
        }

        let Some(_) = self
            .tasks
            .mark_validation_complete(account_id, task_id, delegate_id, self.clock.now())
            .await?
        else {
            debug!(task_id = %task_id, delegate_id = %delegate_id, "Report after task left the queue");
            return Ok(None);
        };

        let validated = results.iter().any(|r| r.validated);
        info!(task_id = %task_id, delegate_id = %delegate_id, validated, "Validation reported");
        if validated {
            self.queue.claim(account_id, delegate_id, task_id).await
        } else {
            Ok(None)
        }
    }

    /// Force-claim a task whose validation finished without any live
    /// whitelisted delegate.
    pub async fn proceed_anyway(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        if self.policy == ProceedAnywayPolicy::Deny {
            debug!(task_id = %task_id, "Proceed anyway disabled by policy");
            return Ok(None);
        }

        let Some(task) = self.tasks.get_unassigned_task(account_id, task_id).await? else {
            return Ok(None);
        };

        if !validation_complete(&task, self.clock.now(), self.validation_timeout) {
            debug!(task_id = %task_id, delegate_id = %delegate_id, "Proceed anyway: validation still running");
            return Ok(None);
        }

        let whitelisted = self.assigner.connected_whitelisted_delegates(&task).await?;
        if !whitelisted.is_empty() {
            debug!(
                task_id = %task_id,
                whitelisted = whitelisted.len(),
                "Proceed anyway: whitelisted delegates are connected"
            );
            return Ok(None);
        }

        info!(task_id = %task_id, delegate_id = %delegate_id, "No whitelisted delegate, proceeding anyway");
        self.queue.claim(account_id, delegate_id, task_id).await
    }
}
