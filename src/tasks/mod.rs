//! Tasks: queueing, probe-then-claim validation, sync/async execution,
//! event dispatch and retention.

pub mod bridge;
pub mod dispatch;
pub mod model;
pub mod queue;
pub mod retention;
pub mod validation;
pub mod waiters;

pub use bridge::ExecutionBridge;
pub use dispatch::EventDispatcher;
pub use model::{
    AbortEvent, ConnectionResult, DelegateTask, PolledEvents, TaskEvent, TaskResponse, TaskStatus,
    TaskTarget,
};
pub use queue::TaskQueue;
pub use retention::{RetentionSweeper, SweepReport, spawn_retention_loop};
pub use validation::ValidationCoordinator;
pub use waiters::{WaitNotifier, WaitRegistry};
