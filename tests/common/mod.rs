//! Shared fixtures for broker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use delegate_broker::clock::ManualClock;
use delegate_broker::delegates::DelegateRegistration;
use delegate_broker::error::DatabaseError;
use delegate_broker::store::{LibSqlBackend, TaskStore};
use delegate_broker::tasks::{DelegateTask, TaskResponse, TaskStatus};
use delegate_broker::{BrokerConfig, BrokerDeps, DelegateBroker, LocalServices};

pub const ACCOUNT: &str = "kmpySmUISimoRrJL6NL73w";

pub struct Fixture {
    pub broker: Arc<DelegateBroker>,
    pub services: LocalServices,
    pub store: Arc<LibSqlBackend>,
    pub clock: Arc<ManualClock>,
}

pub async fn fixture(config: BrokerConfig) -> Fixture {
    let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (deps, services) = BrokerDeps::local(store.clone(), &config, clock.clone());
    Fixture {
        broker: Arc::new(DelegateBroker::new(config, deps)),
        services,
        store,
        clock,
    }
}

pub fn registration(host_name: &str, ip: &str, task_types: &[&str]) -> DelegateRegistration {
    DelegateRegistration {
        account_id: ACCOUNT.into(),
        host_name: host_name.into(),
        ip: ip.into(),
        supported_task_types: task_types.iter().map(|t| t.to_string()).collect(),
        version: Some("1.0.0".into()),
        description: None,
    }
}

/// Task store whose bulk deletes fail a configurable number of times, and
/// which can optionally lose stored delegate responses on read.
pub struct FlakyTaskStore {
    inner: Arc<LibSqlBackend>,
    failures_left: AtomicUsize,
    lose_responses: bool,
    pub delete_calls: AtomicUsize,
}

impl FlakyTaskStore {
    pub fn new(inner: Arc<LibSqlBackend>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
            lose_responses: false,
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Tasks read back through this store never carry a response.
    pub fn losing_responses(mut self) -> Self {
        self.lose_responses = true;
        self
    }
}

#[async_trait]
impl TaskStore for FlakyTaskStore {
    async fn insert_task(&self, task: &DelegateTask) -> Result<(), DatabaseError> {
        self.inner.insert_task(task).await
    }

    async fn get_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        let task = self.inner.get_task(account_id, task_id).await?;
        Ok(task.map(|mut task| {
            if self.lose_responses {
                task.notify_response = None;
            }
            task
        }))
    }

    async fn get_unassigned_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner.get_unassigned_task(account_id, task_id).await
    }

    async fn begin_validation(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner
            .begin_validation(account_id, task_id, delegate_id, at)
            .await
    }

    async fn mark_validation_complete(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner
            .mark_validation_complete(account_id, task_id, delegate_id, at)
            .await
    }

    async fn claim_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner.claim_task(account_id, task_id, delegate_id, at).await
    }

    async fn start_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner.start_task(account_id, task_id, delegate_id, at).await
    }

    async fn complete_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        response: &TaskResponse,
        status: TaskStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner
            .complete_task(account_id, task_id, response, status, at)
            .await
    }

    async fn abort_task(
        &self,
        account_id: &str,
        task_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<DelegateTask>, DatabaseError> {
        self.inner.abort_task(account_id, task_id, at).await
    }

    async fn delete_task(&self, account_id: &str, task_id: Uuid) -> Result<bool, DatabaseError> {
        self.inner.delete_task(account_id, task_id).await
    }

    async fn list_queued_tasks(
        &self,
        account_id: &str,
        is_async: bool,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.inner.list_queued_tasks(account_id, is_async).await
    }

    async fn take_abort_events(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.inner.take_abort_events(account_id, delegate_id, at).await
    }

    async fn list_delegate_tasks(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<DelegateTask>, DatabaseError> {
        self.inner.list_delegate_tasks(account_id, delegate_id).await
    }

    async fn task_ids_created_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        self.inner.task_ids_created_before(cutoff, limit).await
    }

    async fn delete_tasks(&self, ids: &[Uuid]) -> Result<usize, DatabaseError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DatabaseError::Query("delete_tasks: injected failure".into()));
        }
        self.inner.delete_tasks(ids).await
    }
}
