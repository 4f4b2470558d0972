//! Async result delivery: responses for async tasks are handed to whoever
//! waits on the task's wait id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use super::model::TaskResponse;

/// Receives async task responses, keyed by wait id.
#[async_trait]
pub trait WaitNotifier: Send + Sync {
    async fn notify(&self, wait_id: &str, response: TaskResponse) -> anyhow::Result<()>;
}

/// One-shot waiter per wait id.
///
/// A response that arrives before anyone registers is buffered and handed to
/// the first registration. The buffer is bounded: unclaimed responses expire
/// after `ttl` and the least useful are evicted past `capacity`.
pub struct WaitRegistry {
    waiters: Mutex<HashMap<String, oneshot::Sender<TaskResponse>>>,
    early: Cache<String, TaskResponse>,
}

impl WaitRegistry {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let early = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self {
            waiters: Mutex::new(HashMap::new()),
            early,
        }
    }

    /// Wait for the response to `wait_id`.
    pub async fn register(&self, wait_id: &str) -> oneshot::Receiver<TaskResponse> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        match self.early.get(wait_id).await {
            Some(response) => {
                self.early.invalidate(wait_id).await;
                let _ = tx.send(response);
            }
            None => {
                waiters.insert(wait_id.to_string(), tx);
            }
        }
        rx
    }

    /// Register and wait up to `timeout`. `None` if nothing arrived in time.
    pub async fn wait_for(&self, wait_id: &str, timeout: Duration) -> Option<TaskResponse> {
        let rx = self.register(wait_id).await;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Some(response),
            Ok(Err(_)) => None,
            Err(_) => {
                self.cancel(wait_id).await;
                None
            }
        }
    }

    /// Drop the waiter registered for `wait_id`, if any.
    pub async fn cancel(&self, wait_id: &str) {
        if self.waiters.lock().await.remove(wait_id).is_some() {
            debug!(wait_id = %wait_id, "Waiter cancelled");
        }
    }

    /// Number of registered waiters still waiting.
    pub async fn pending(&self) -> usize {
        self.waiters.lock().await.len()
    }

    /// Number of buffered responses nobody has collected yet.
    pub async fn buffered(&self) -> u64 {
        self.early.run_pending_tasks().await;
        self.early.entry_count()
    }
}

#[async_trait]
impl WaitNotifier for WaitRegistry {
    async fn notify(&self, wait_id: &str, response: TaskResponse) -> anyhow::Result<()> {
        // Hold the waiter map so a concurrent register sees either the
        // waiter or the buffered response, never neither.
        let mut waiters = self.waiters.lock().await;
        let response = match waiters.remove(wait_id) {
            Some(tx) => match tx.send(response) {
                Ok(()) => return Ok(()),
                Err(response) => {
                    debug!(wait_id = %wait_id, "Waiter dropped before response arrived, buffering");
                    response
                }
            },
            None => {
                debug!(wait_id = %wait_id, "No waiter registered yet, buffering response");
                response
            }
        };
        self.early.insert(wait_id.to_string(), response).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> WaitRegistry {
        WaitRegistry::new(100, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn registered_waiter_receives_response() {
        let registry = registry();
        let rx = registry.register("w1").await;
        assert_eq!(registry.pending().await, 1);

        registry.notify("w1", TaskResponse::ok("done")).await.unwrap();
        assert_eq!(rx.await.unwrap(), TaskResponse::ok("done"));
        assert_eq!(registry.pending().await, 0);
    }

    #[tokio::test]
    async fn early_response_is_buffered() {
        let registry = registry();
        registry.notify("w1", TaskResponse::ok("early")).await.unwrap();

        let rx = registry.register("w1").await;
        assert_eq!(rx.await.unwrap(), TaskResponse::ok("early"));
    }

    #[tokio::test]
    async fn unclaimed_responses_stay_bounded() {
        let registry = registry();
        for i in 0..5000 {
            registry
                .notify(&format!("wait-{i}"), TaskResponse::ok(i))
                .await
                .unwrap();
        }
        let buffered = registry.buffered().await;
        assert!(buffered <= 100, "buffer grew to {buffered}");
        assert_eq!(registry.pending().await, 0);
    }

    #[tokio::test]
    async fn unclaimed_responses_expire() {
        let registry = WaitRegistry::new(100, Duration::from_millis(50));
        registry.notify("w1", TaskResponse::ok("late")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(registry.buffered().await, 0);
        assert!(registry.wait_for("w1", Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn timed_out_wait_is_cancelled() {
        let registry = registry();
        assert!(registry.wait_for("w1", Duration::from_millis(20)).await.is_none());
        assert_eq!(registry.pending().await, 0);

        // A response arriving afterwards is buffered for the next wait.
        registry.notify("w1", TaskResponse::ok("done")).await.unwrap();
        assert_eq!(
            registry.wait_for("w1", Duration::from_millis(20)).await,
            Some(TaskResponse::ok("done"))
        );
    }

    #[tokio::test]
    async fn response_for_dropped_waiter_is_kept() {
        let registry = registry();
        drop(registry.register("w1").await);

        registry.notify("w1", TaskResponse::ok("done")).await.unwrap();
        assert_eq!(registry.buffered().await, 1);
        assert_eq!(
            registry.wait_for("w1", Duration::from_millis(20)).await,
            Some(TaskResponse::ok("done"))
        );
    }
}
