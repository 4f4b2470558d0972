//! Capability/scope matching and the connectivity whitelist.

pub mod cache;
pub mod scoped;

use async_trait::async_trait;

use crate::error::Result;
use crate::tasks::model::{ConnectionResult, DelegateTask};

pub use cache::ConnectionResultCache;
pub use scoped::ScopedAssigner;

/// Decides which delegates may take a task and remembers which ones have
/// proven they can reach its target.
#[async_trait]
pub trait AssignDelegateService: Send + Sync {
    /// Whether the delegate's scopes admit the task.
    async fn can_assign(&self, delegate_id: &str, task: &DelegateTask) -> Result<bool>;

    /// Whether the delegate has a fresh validated result for every criterion
    /// of the task. Tasks without criteria are whitelisted for everyone.
    async fn is_whitelisted(&self, task: &DelegateTask, delegate_id: &str) -> Result<bool>;

    async fn save_connection_results(&self, results: &[ConnectionResult]) -> Result<()>;

    /// Live delegates that can take the task and are whitelisted for it.
    async fn connected_whitelisted_delegates(&self, task: &DelegateTask) -> Result<Vec<String>>;

    async fn clear_connection_results(&self, delegate_id: &str) -> Result<()>;
}
