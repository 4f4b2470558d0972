//! Task data model: queued units of work, their lifecycle and the events
//! delegates poll for.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default execution timeout for a task (10 minutes).
pub const DEFAULT_TASK_TIMEOUT_MS: u64 = 10 * 60 * 1000;

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Finished,
    Error,
    Aborted,
}

impl TaskStatus {
    /// Terminal tasks are never reassigned.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "aborted" => Ok(Self::Aborted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// What a delegate must be able to reach to run a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskTarget {
    /// No connectivity requirement; any capable delegate may run it.
    #[default]
    Unscoped,
    Host { host: String, port: u16 },
    Http { url: String },
    KubernetesCluster { master_url: String },
    CloudRegion { provider: String, region: String },
}

impl TaskTarget {
    /// Connectivity criteria a delegate must have validated.
    ///
    /// An empty list means the task is whitelisted for every delegate.
    pub fn criteria(&self) -> Vec<String> {
        match self {
            Self::Unscoped => Vec::new(),
            Self::Host { host, port } => vec![format!("{host}:{port}")],
            Self::Http { url } => vec![url.clone()],
            Self::KubernetesCluster { master_url } => vec![master_url.clone()],
            Self::CloudRegion { provider, region } => vec![format!("{provider}:{region}")],
        }
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .collect()
    }
}

/// Result payload a delegate reports for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub data: serde_json::Value,
    #[serde(default)]
    pub failed: bool,
}

impl TaskResponse {
    pub fn ok(data: impl Into<serde_json::Value>) -> Self {
        Self {
            data: data.into(),
            failed: false,
        }
    }

    pub fn failed(data: impl Into<serde_json::Value>) -> Self {
        Self {
            data: data.into(),
            failed: true,
        }
    }
}

/// A unit of work routed to exactly one delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTask {
    pub id: Uuid,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_mapping_id: Option<String>,
    pub task_type: String,
    pub task_group: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub target: TaskTarget,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub validating_delegate_ids: Vec<String>,
    #[serde(default)]
    pub validation_complete_delegate_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_response: Option<TaskResponse>,
    /// Execution timeout in milliseconds.
    pub timeout: u64,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl DelegateTask {
    /// A fresh queued task. The task group defaults to the task type.
    pub fn new(account_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let task_type = task_type.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            account_id: account_id.into(),
            app_id: None,
            env_id: None,
            infrastructure_mapping_id: None,
            task_group: task_type.clone(),
            task_type,
            parameters: serde_json::Value::Null,
            target: TaskTarget::Unscoped,
            is_async: false,
            wait_id: None,
            delegate_id: None,
            status: TaskStatus::Queued,
            validating_delegate_ids: Vec::new(),
            validation_complete_delegate_ids: Vec::new(),
            validation_started_at: None,
            notify_response: None,
            timeout: DEFAULT_TASK_TIMEOUT_MS,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn with_app(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_env(mut self, env_id: impl Into<String>) -> Self {
        self.env_id = Some(env_id.into());
        self
    }

    pub fn with_infrastructure_mapping(mut self, mapping_id: impl Into<String>) -> Self {
        self.infrastructure_mapping_id = Some(mapping_id.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.task_group = group.into();
        self
    }

    pub fn with_target(mut self, target: TaskTarget) -> Self {
        self.target = target;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_wait_id(mut self, wait_id: impl Into<String>) -> Self {
        self.wait_id = Some(wait_id.into());
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Queued and not yet claimed by anyone.
    pub fn is_unassigned(&self) -> bool {
        self.status == TaskStatus::Queued && self.delegate_id.is_none()
    }

    pub fn criteria(&self) -> Vec<String> {
        self.target.criteria()
    }
}

/// Connectivity probe outcome reported by a delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResult {
    pub account_id: String,
    pub delegate_id: String,
    pub criteria: String,
    pub validated: bool,
}

/// A queued task a delegate may try to acquire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub account_id: String,
    pub task_id: Uuid,
    pub sync: bool,
}

/// An abort request for a task the polling delegate holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortEvent {
    pub account_id: String,
    pub task_id: Uuid,
}

/// Everything one poll returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledEvents {
    pub task_events: Vec<TaskEvent>,
    pub abort_events: Vec<AbortEvent>,
}

impl PolledEvents {
    pub fn is_empty(&self) -> bool {
        self.task_events.is_empty() && self.abort_events.is_empty()
    }
}
