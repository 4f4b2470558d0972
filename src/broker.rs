//! The broker facade: wires every component from one config and one set of
//! collaborators, and exposes the delegate and caller operations.

use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::alerts::{AlertLog, AlertService};
use crate::assign::{AssignDelegateService, ConnectionResultCache, ScopedAssigner};
use crate::clock::Clock;
use crate::config::BrokerConfig;
use crate::delegates::{
    Delegate, DelegateRegistration, DelegateRegistry, DelegateScope, DelegateStatus,
    EligibilityFilter, spawn_liveness_monitor,
};
use crate::error::Result;
use crate::push::{PushChannel, PushHub};
use crate::store::{DelegateStore, LibSqlBackend, TaskStore};
use crate::tasks::{
    ConnectionResult, DelegateTask, EventDispatcher, ExecutionBridge, PolledEvents,
    RetentionSweeper, SweepReport, TaskQueue, TaskResponse, ValidationCoordinator, WaitNotifier,
    WaitRegistry, spawn_retention_loop,
};

/// External collaborators the broker consumes.
pub struct BrokerDeps {
    pub delegates: Arc<dyn DelegateStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub assigner: Arc<dyn AssignDelegateService>,
    pub alerts: Arc<dyn AlertService>,
    pub push: Arc<dyn PushChannel>,
    pub waiters: Arc<dyn WaitNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// Concrete in-process collaborators built by [`BrokerDeps::local`], kept so
/// the caller can serve the push stream, register waiters and read alerts.
#[derive(Clone)]
pub struct LocalServices {
    pub alerts: Arc<AlertLog>,
    pub push: Arc<PushHub>,
    pub waiters: Arc<WaitRegistry>,
    pub cache: Arc<ConnectionResultCache>,
}

impl BrokerDeps {
    /// Default collaborators over a libSQL store.
    pub fn local(
        store: Arc<LibSqlBackend>,
        config: &BrokerConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, LocalServices) {
        let cache = Arc::new(ConnectionResultCache::new(
            config.whitelist_capacity,
            config.whitelist_ttl,
            clock.clone(),
        ));
        let assigner = Arc::new(ScopedAssigner::new(
            store.clone(),
            cache.clone(),
            clock.clone(),
            config.max_heartbeat_age,
        ));
        let services = LocalServices {
            alerts: Arc::new(AlertLog::new()),
            push: PushHub::new(),
            waiters: Arc::new(WaitRegistry::new(
                config.wait_buffer_capacity,
                config.wait_buffer_ttl,
            )),
            cache,
        };

        let deps = Self {
            delegates: store.clone(),
            tasks: store,
            assigner,
            alerts: services.alerts.clone(),
            push: services.push.clone(),
            waiters: services.waiters.clone(),
            clock,
        };
        (deps, services)
    }
}

pub struct DelegateBroker {
    config: BrokerConfig,
    registry: Arc<DelegateRegistry>,
    eligibility: Arc<EligibilityFilter>,
    queue: Arc<TaskQueue>,
    validation: ValidationCoordinator,
    bridge: ExecutionBridge,
    dispatcher: EventDispatcher,
    sweeper: Arc<RetentionSweeper>,
}

impl DelegateBroker {
    pub fn new(config: BrokerConfig, deps: BrokerDeps) -> Self {
        let registry = Arc::new(DelegateRegistry::new(
            deps.delegates.clone(),
            deps.assigner.clone(),
            deps.alerts.clone(),
            deps.push.clone(),
            deps.clock.clone(),
        ));
        let eligibility = Arc::new(EligibilityFilter::new(
            deps.delegates.clone(),
            deps.assigner.clone(),
            deps.alerts.clone(),
            deps.clock.clone(),
            config.max_heartbeat_age,
        ));
        let queue = Arc::new(TaskQueue::new(deps.tasks.clone(), deps.clock.clone()));
        let validation = ValidationCoordinator::new(
            deps.tasks.clone(),
            queue.clone(),
            eligibility.clone(),
            deps.assigner.clone(),
            deps.clock.clone(),
            config.validation_timeout,
            config.proceed_anyway,
        );
        let bridge = ExecutionBridge::new(
            deps.tasks.clone(),
            queue.clone(),
            eligibility.clone(),
            deps.push.clone(),
            deps.waiters,
            deps.clock.clone(),
            config.sync_poll_interval,
        );
        let dispatcher = EventDispatcher::new(deps.tasks.clone(), deps.push, deps.clock.clone());
        let sweeper = Arc::new(RetentionSweeper::new(
            deps.tasks,
            deps.clock,
            config.sweep_batch_limit,
            config.sweep_budget,
            config.sweep_pause,
        ));

        Self {
            config,
            registry,
            eligibility,
            queue,
            validation,
            bridge,
            dispatcher,
            sweeper,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Start the liveness monitor and the retention loop.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            spawn_liveness_monitor(
                self.registry.clone(),
                self.config.liveness_interval,
                self.config.max_heartbeat_age,
            ),
            spawn_retention_loop(
                self.sweeper.clone(),
                self.config.retention,
                self.config.retention_interval,
            ),
        ]
    }

    // ── Delegates ───────────────────────────────────────────────────────

    pub async fn register_delegate(&self, registration: DelegateRegistration) -> Result<Delegate> {
        self.registry.register(registration).await
    }

    pub async fn heartbeat(&self, account_id: &str, delegate_id: &str) -> Result<Delegate> {
        self.registry.heartbeat(account_id, delegate_id).await
    }

    pub async fn get_delegate(&self, account_id: &str, delegate_id: &str) -> Result<Option<Delegate>> {
        self.registry.get(account_id, delegate_id).await
    }

    pub async fn list_delegates(&self, account_id: &str) -> Result<Vec<Delegate>> {
        self.registry.list(account_id).await
    }

    pub async fn set_delegate_status(
        &self,
        account_id: &str,
        delegate_id: &str,
        status: DelegateStatus,
    ) -> Result<Delegate> {
        self.registry.set_status(account_id, delegate_id, status).await
    }

    pub async fn update_scopes(
        &self,
        account_id: &str,
        delegate_id: &str,
        include: Vec<DelegateScope>,
        exclude: Vec<DelegateScope>,
    ) -> Result<Delegate> {
        self.registry
            .update_scopes(account_id, delegate_id, include, exclude)
            .await
    }

    pub async fn delete_delegate(&self, account_id: &str, delegate_id: &str) -> Result<Delegate> {
        self.registry.delete(account_id, delegate_id).await
    }

    pub async fn clear_cache(&self, delegate_id: &str) {
        self.registry.clear_cache(delegate_id).await
    }

    pub async fn mark_down_delegates(&self) -> Result<Vec<Delegate>> {
        self.registry
            .mark_down_delegates(self.config.max_heartbeat_age)
            .await
    }

    pub async fn eligible_delegates(&self, task: &DelegateTask) -> Result<Vec<String>> {
        self.eligibility.eligible_delegates(task).await
    }

    // ── Callers ─────────────────────────────────────────────────────────

    pub async fn queue_task(&self, task: DelegateTask) -> Result<DelegateTask> {
        self.bridge.submit_async(task).await
    }

    pub async fn execute_task(&self, task: DelegateTask) -> Result<TaskResponse> {
        self.bridge.submit_sync(task).await
    }

    pub async fn task_status(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        self.bridge.task_status(account_id, task_id).await
    }

    pub async fn abort_task(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        self.dispatcher.abort(account_id, task_id).await
    }

    // ── Delegate protocol ───────────────────────────────────────────────

    pub async fn poll_events(
        &self,
        account_id: &str,
        delegate_id: &str,
        sync_only: bool,
    ) -> Result<PolledEvents> {
        self.dispatcher
            .poll_events(account_id, delegate_id, sync_only)
            .await
    }

    pub async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        self.validation
            .acquire_task(account_id, delegate_id, task_id)
            .await
    }

    pub async fn report_validation_result(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        results: Vec<ConnectionResult>,
    ) -> Result<Option<DelegateTask>> {
        self.validation
            .report_validation_result(account_id, delegate_id, task_id, results)
            .await
    }

    pub async fn proceed_anyway(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        self.validation
            .proceed_anyway(account_id, delegate_id, task_id)
            .await
    }

    pub async fn start_task(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>> {
        self.queue.start(account_id, delegate_id, task_id).await
    }

    pub async fn submit_result(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        response: TaskResponse,
    ) -> Result<()> {
        self.bridge
            .submit_result(account_id, delegate_id, task_id, response)
            .await
    }

    pub async fn delegate_tasks(&self, account_id: &str, delegate_id: &str) -> Result<Vec<DelegateTask>> {
        self.bridge.delegate_tasks(account_id, delegate_id).await
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    pub async fn delete_old_tasks(&self, retention: std::time::Duration) -> SweepReport {
        self.sweeper.delete_old_tasks(retention).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::tasks::TaskStatus;

    async fn broker() -> (DelegateBroker, LocalServices) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let config = BrokerConfig::default();
        let (deps, services) =
            BrokerDeps::local(store, &config, Arc::new(ManualClock::new(Utc::now())));
        (DelegateBroker::new(config, deps), services)
    }

    fn registration(host: &str) -> DelegateRegistration {
        DelegateRegistration {
            account_id: "acct".into(),
            host_name: host.into(),
            ip: "10.0.0.1".into(),
            supported_task_types: vec!["EXEC".into()],
            version: None,
            description: None,
        }
    }

    #[tokio::test]
    async fn unscoped_task_is_claimed_on_acquire() {
        let (broker, _) = broker().await;
        let delegate = broker.register_delegate(registration("host-a")).await.unwrap();
        let task = broker.queue_task(DelegateTask::new("acct", "EXEC")).await.unwrap();

        let claimed = broker
            .acquire_task("acct", &delegate.id, task.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.delegate_id.as_deref(), Some(delegate.id.as_str()));
        assert_eq!(claimed.status, TaskStatus::Started);

        let held = broker.delegate_tasks("acct", &delegate.id).await.unwrap();
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_delegate_cannot_acquire() {
        let (broker, services) = broker().await;
        let mut reg = registration("host-b");
        reg.supported_task_types = vec!["SHELL".into()];
        let delegate = broker.register_delegate(reg).await.unwrap();
        let task = broker.queue_task(DelegateTask::new("acct", "EXEC")).await.unwrap();

        assert!(broker.acquire_task("acct", &delegate.id, task.id).await.unwrap().is_none());
        assert!(!services.alerts.open_alerts("acct").await.is_empty());
    }
}
