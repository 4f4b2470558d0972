//! Push hints to delegates, keyed by account.
//!
//! Push is best effort: a delegate that misses a message still finds the
//! task on its next poll.

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Messages pushed to the delegates of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A task is waiting to be acquired.
    TaskQueued { task_id: Uuid, sync: bool },
    /// An async task was aborted; its holder should stop.
    TaskAborted { task_id: Uuid },
    /// A delegate re-registered; other instances on the same host should yield.
    DelegateReconnected { delegate_id: String },
}

/// A push message addressed to one account's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub account_id: String,
    #[serde(flatten)]
    pub message: PushMessage,
}

/// Fan-out transport consumed by the broker.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn broadcast(&self, account_id: &str, message: PushMessage) -> anyhow::Result<()>;
}

/// In-process hub backed by a tokio broadcast channel.
pub struct PushHub {
    tx: broadcast::Sender<PushEnvelope>,
}

impl PushHub {
    pub fn new() -> Arc<Self> {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(capacity);
        Arc::new(Self { tx })
    }

    /// Subscribe to every account's messages. Each stream client calls this
    /// and filters by account.
    pub fn subscribe(&self) -> broadcast::Receiver<PushEnvelope> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl PushChannel for PushHub {
    async fn broadcast(&self, account_id: &str, message: PushMessage) -> anyhow::Result<()> {
        debug!(account_id = %account_id, message = ?message, "Push");
        // Ok if nobody is listening
        let _ = self.tx.send(PushEnvelope {
            account_id: account_id.to_string(),
            message,
        });
        Ok(())
    }
}
