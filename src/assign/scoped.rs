//! Default `AssignDelegateService`: scope matching over the delegate store
//! plus the cached whitelist.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::AssignDelegateService;
use super::cache::ConnectionResultCache;
use crate::clock::{Clock, to_chrono};
use crate::error::Result;
use crate::store::DelegateStore;
use crate::tasks::model::{ConnectionResult, DelegateTask};

pub struct ScopedAssigner {
    delegates: Arc<dyn DelegateStore>,
    cache: Arc<ConnectionResultCache>,
    clock: Arc<dyn Clock>,
    max_heartbeat_age: chrono::Duration,
}

impl ScopedAssigner {
    pub fn new(
        delegates: Arc<dyn DelegateStore>,
        cache: Arc<ConnectionResultCache>,
        clock: Arc<dyn Clock>,
        max_heartbeat_age: std::time::Duration,
    ) -> Self {
        Self {
            delegates,
            cache,
            clock,
            max_heartbeat_age: to_chrono(max_heartbeat_age),
        }
    }
}

#[async_trait]
impl AssignDelegateService for ScopedAssigner {
    async fn can_assign(&self, delegate_id: &str, task: &DelegateTask) -> Result<bool> {
        let Some(delegate) = self
            .delegates
            .get_delegate(&task.account_id, delegate_id)
            .await?
        else {
            return Ok(false);
        };
        Ok(delegate.scopes_allow(task))
    }

    async fn is_whitelisted(&self, task: &DelegateTask, delegate_id: &str) -> Result<bool> {
        let criteria = task.criteria();
        let whitelisted = self.cache.all_validated(delegate_id, &criteria).await;
        debug!(
            task_id = %task.id,
            delegate_id = %delegate_id,
            whitelisted,
            "Whitelist check"
        );
        Ok(whitelisted)
    }

    async fn save_connection_results(&self, results: &[ConnectionResult]) -> Result<()> {
        self.cache.save(results).await;
        Ok(())
    }

    async fn connected_whitelisted_delegates(&self, task: &DelegateTask) -> Result<Vec<String>> {
        let cutoff = self.clock.now() - self.max_heartbeat_age;
        let live = self
            .delegates
            .list_live_delegates(&task.account_id, &task.task_type, cutoff)
            .await?;

        let criteria = task.criteria();
        let mut whitelisted = Vec::new();
        for delegate in live {
            if delegate.scopes_allow(task) && self.cache.all_validated(&delegate.id, &criteria).await
            {
                whitelisted.push(delegate.id);
            }
        }
        Ok(whitelisted)
    }

    async fn clear_connection_results(&self, delegate_id: &str) -> Result<()> {
        self.cache.clear_delegate(delegate_id);
        Ok(())
    }
}
