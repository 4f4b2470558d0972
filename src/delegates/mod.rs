//! Delegates: registered worker agents, who may take which task, and who is alive.

pub mod eligibility;
pub mod liveness;
pub mod model;
pub mod registry;

pub use eligibility::EligibilityFilter;
pub use liveness::spawn_liveness_monitor;
pub use model::{Delegate, DelegateRegistration, DelegateScope, DelegateStatus};
pub use registry::DelegateRegistry;
