//! Retention sweeper: deletes tasks older than the retention horizon in
//! bounded batches within a wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, to_chrono};
use crate::store::TaskStore;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub deleted: usize,
    pub batches: usize,
    pub failed_batches: usize,
    /// The budget ran out before the sweep finished.
    pub timed_out: bool,
}

pub struct RetentionSweeper {
    tasks: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    batch_limit: usize,
    budget: Duration,
    pause: Duration,
}

impl RetentionSweeper {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        batch_limit: usize,
        budget: Duration,
        pause: Duration,
    ) -> Self {
        Self {
            tasks,
            clock,
            batch_limit: batch_limit.max(1),
            budget,
            pause,
        }
    }

    /// Delete every task created more than `retention` ago.
    ///
    /// Never runs longer than the budget. A failed batch is logged and the
    /// sweep moves on after the usual pause.
    pub async fn delete_old_tasks(&self, retention: Duration) -> SweepReport {
        let cutoff = self.clock.now() - to_chrono(retention);
        let mut report = SweepReport::default();

        if tokio::time::timeout(self.budget, self.sweep(cutoff, &mut report))
            .await
            .is_err()
        {
            report.timed_out = true;
            warn!(budget_secs = self.budget.as_secs(), "Retention sweep hit its time budget");
        }

        info!(
            deleted = report.deleted,
            batches = report.batches,
            failed_batches = report.failed_batches,
            timed_out = report.timed_out,
            "Retention sweep finished"
        );
        report
    }

    async fn sweep(&self, cutoff: chrono::DateTime<chrono::Utc>, report: &mut SweepReport) {
        loop {
            match self.tasks.task_ids_created_before(cutoff, self.batch_limit).await {
                Ok(ids) if ids.is_empty() => return,
                Ok(ids) => {
                    let selected = ids.len();
                    match self.tasks.delete_tasks(&ids).await {
                        Ok(deleted) => {
                            report.batches += 1;
                            report.deleted += deleted;
                            debug!(selected, deleted, "Retention batch deleted");
                        }
                        Err(e) => {
                            report.failed_batches += 1;
                            warn!(selected, error = %e, "Retention batch delete failed");
                        }
                    }
                    if selected < self.batch_limit {
                        return;
                    }
                }
                Err(e) => {
                    report.failed_batches += 1;
                    warn!(error = %e, "Retention batch select failed");
                }
            }
            tokio::time::sleep(self.pause).await;
        }
    }
}

/// Spawn the retention background loop. The first sweep runs immediately.
pub fn spawn_retention_loop(
    sweeper: Arc<RetentionSweeper>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            retention_secs = retention.as_secs(),
            interval_secs = interval.as_secs(),
            "Retention loop started"
        );
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            sweeper.delete_old_tasks(retention).await;
        }
    })
}
