//! Which delegates may take a task right now.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::alerts::{AlertKind, AlertService};
use crate::assign::AssignDelegateService;
use crate::clock::{Clock, to_chrono};
use crate::error::Result;
use crate::store::DelegateStore;
use crate::tasks::model::DelegateTask;

pub struct EligibilityFilter {
    delegates: Arc<dyn DelegateStore>,
    assigner: Arc<dyn AssignDelegateService>,
    alerts: Arc<dyn AlertService>,
    clock: Arc<dyn Clock>,
    max_heartbeat_age: chrono::Duration,
}

impl EligibilityFilter {
    pub fn new(
        delegates: Arc<dyn DelegateStore>,
        assigner: Arc<dyn AssignDelegateService>,
        alerts: Arc<dyn AlertService>,
        clock: Arc<dyn Clock>,
        max_heartbeat_age: std::time::Duration,
    ) -> Self {
        Self {
            delegates,
            assigner,
            alerts,
            clock,
            max_heartbeat_age: to_chrono(max_heartbeat_age),
        }
    }

    /// Live delegates that support the task type and whose scopes admit it.
    ///
    /// Opens a "no active delegates" alert when nobody is live, and a
    /// "no eligible delegates" alert when every live delegate is scoped away.
    pub async fn eligible_delegates(&self, task: &DelegateTask) -> Result<Vec<String>> {
        let cutoff = self.clock.now() - self.max_heartbeat_age;
        let live = self
            .delegates
            .list_live_delegates(&task.account_id, &task.task_type, cutoff)
            .await?;

        if live.is_empty() {
            self.raise(&task.account_id, AlertKind::NoActiveDelegates).await;
            return Ok(Vec::new());
        }

        let mut eligible = Vec::with_capacity(live.len());
        for delegate in live {
            if self.assigner.can_assign(&delegate.id, task).await? {
                eligible.push(delegate.id);
            }
        }

        if eligible.is_empty() {
            self.raise(
                &task.account_id,
                AlertKind::NoEligibleDelegates {
                    task_type: task.task_type.clone(),
                    task_group: task.task_group.clone(),
                    app_id: task.app_id.clone(),
                    env_id: task.env_id.clone(),
                    infrastructure_mapping_id: task.infrastructure_mapping_id.clone(),
                },
            )
            .await;
        }

        debug!(task_id = %task.id, eligible = eligible.len(), "Eligible delegates computed");
        Ok(eligible)
    }

    /// Advisory form used on submission: never fails the caller.
    pub async fn check_and_alert(&self, task: &DelegateTask) -> Vec<String> {
        match self.eligible_delegates(task).await {
            Ok(eligible) => eligible,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Eligibility check failed");
                Vec::new()
            }
        }
    }

    /// Whether one delegate still qualifies: live, supports the type, scopes admit.
    pub async fn qualifies(&self, delegate_id: &str, task: &DelegateTask) -> Result<bool> {
        let Some(delegate) = self
            .delegates
            .get_delegate(&task.account_id, delegate_id)
            .await?
        else {
            return Ok(false);
        };
        if !delegate.is_live(self.clock.now(), self.max_heartbeat_age)
            || !delegate.supports(&task.task_type)
        {
            return Ok(false);
        }
        self.assigner.can_assign(delegate_id, task).await
    }

    async fn raise(&self, account_id: &str, kind: AlertKind) {
        if let Err(e) = self.alerts.open_alert(account_id, kind).await {
            warn!(account_id = %account_id, error = %e, "Failed to open alert");
        }
    }
}
