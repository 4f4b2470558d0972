//! Delegate broker: queues remote tasks and hands each one to exactly one
//! polling delegate that has proven it can reach the task's target.

pub mod alerts;
pub mod api;
pub mod assign;
pub mod broker;
pub mod clock;
pub mod config;
pub mod delegates;
pub mod error;
pub mod push;
pub mod store;
pub mod tasks;

pub use broker::{BrokerDeps, DelegateBroker, LocalServices};
pub use config::BrokerConfig;
pub use error::{Error, Result};
