//! Delegate data model: registered worker agents, their scopes and liveness.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::model::DelegateTask;

/// Operator-controlled enablement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateStatus {
    Enabled,
    Disabled,
}

impl DelegateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for DelegateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DelegateStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown delegate status: {other}")),
        }
    }
}

/// A restriction on which tasks a delegate may take.
///
/// Each non-empty list must contain the task's corresponding value for the
/// scope to match. Empty lists impose no restriction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub applications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub infrastructure_mappings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub task_groups: Vec<String>,
}

impl DelegateScope {
    /// A scope must restrict something.
    pub fn is_valid(&self) -> bool {
        !(self.applications.is_empty()
            && self.environments.is_empty()
            && self.infrastructure_mappings.is_empty()
            && self.task_groups.is_empty())
    }

    pub fn matches(&self, task: &DelegateTask) -> bool {
        list_matches(&self.task_groups, Some(task.task_group.as_str()))
            && list_matches(&self.applications, task.app_id.as_deref())
            && list_matches(&self.environments, task.env_id.as_deref())
            && list_matches(
                &self.infrastructure_mappings,
                task.infrastructure_mapping_id.as_deref(),
            )
    }
}

fn list_matches(allowed: &[String], value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match value {
        Some(v) if !v.trim().is_empty() => allowed.iter().any(|a| a == v),
        _ => false,
    }
}

/// A registered worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegate {
    pub id: String,
    pub account_id: String,
    pub host_name: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Task types this delegate can execute.
    pub supported_task_types: Vec<String>,
    #[serde(default)]
    pub include_scopes: Vec<DelegateScope>,
    #[serde(default)]
    pub exclude_scopes: Vec<DelegateScope>,
    pub connected: bool,
    pub status: DelegateStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Delegate {
    /// A new, connected, enabled delegate as seen on first registration.
    pub fn new(
        account_id: impl Into<String>,
        host_name: impl Into<String>,
        ip: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.into(),
            host_name: host_name.into(),
            ip: ip.into(),
            description: None,
            version: None,
            supported_task_types: Vec::new(),
            include_scopes: Vec::new(),
            exclude_scopes: Vec::new(),
            connected: true,
            status: DelegateStatus::Enabled,
            last_heartbeat: now,
            created_at: now,
        }
    }

    /// Builder: set supported task types.
    pub fn with_task_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_task_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the advertised version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn supports(&self, task_type: &str) -> bool {
        self.supported_task_types.iter().any(|t| t == task_type)
    }

    /// Connected, enabled, and heartbeating within `max_age` of `now`.
    pub fn is_live(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.connected
            && self.status == DelegateStatus::Enabled
            && self.last_heartbeat > now - max_age
    }

    /// Include scopes (if any) must match and no exclude scope may match.
    pub fn scopes_allow(&self, task: &DelegateTask) -> bool {
        let included = self.include_scopes.is_empty()
            || self.include_scopes.iter().any(|s| s.matches(task));
        included && !self.exclude_scopes.iter().any(|s| s.matches(task))
    }
}

/// Registration request sent by a delegate on startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateRegistration {
    pub account_id: String,
    pub host_name: String,
    pub ip: String,
    #[serde(default)]
    pub supported_task_types: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl DelegateRegistration {
    pub fn into_delegate(self, now: DateTime<Utc>) -> Delegate {
        let mut delegate = Delegate::new(self.account_id, self.host_name, self.ip, now)
            .with_task_types(self.supported_task_types);
        delegate.version = self.version;
        delegate.description = self.description;
        delegate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::DelegateTask;

    fn task() -> DelegateTask {
        DelegateTask::new("acct", "HTTP")
            .with_app("app1")
            .with_env("prod")
    }

    #[test]
    fn empty_scope_is_invalid() {
        assert!(!DelegateScope::default().is_valid());
        let scope = DelegateScope {
            name: "prod".into(),
            environments: vec!["prod".into()],
            ..Default::default()
        };
        assert!(scope.is_valid());
    }

    #[test]
    fn scope_matches_every_non_empty_list() {
        let scope = DelegateScope {
            name: "app1-prod".into(),
            applications: vec!["app1".into()],
            environments: vec!["prod".into()],
            ..Default::default()
        };
        assert!(scope.matches(&task()));

        let other_env = DelegateTask::new("acct", "HTTP").with_app("app1").with_env("qa");
        assert!(!scope.matches(&other_env));

        let no_env = DelegateTask::new("acct", "HTTP").with_app("app1");
        assert!(!scope.matches(&no_env));
    }

    #[test]
    fn exclude_scope_wins_over_include() {
        let now = Utc::now();
        let mut delegate = Delegate::new("acct", "host-1", "10.0.0.1", now);
        delegate.include_scopes = vec![DelegateScope {
            name: "app1".into(),
            applications: vec!["app1".into()],
            ..Default::default()
        }];
        assert!(delegate.scopes_allow(&task()));

        delegate.exclude_scopes = vec![DelegateScope {
            name: "no-prod".into(),
            environments: vec!["prod".into()],
            ..Default::default()
        }];
        assert!(!delegate.scopes_allow(&task()));
    }

    #[test]
    fn liveness_requires_connected_enabled_and_fresh() {
        let now = Utc::now();
        let max_age = Duration::minutes(5);
        let mut delegate = Delegate::new("acct", "host-1", "10.0.0.1", now);
        assert!(delegate.is_live(now, max_age));

        delegate.last_heartbeat = now - Duration::minutes(6);
        assert!(!delegate.is_live(now, max_age));

        delegate.last_heartbeat = now;
        delegate.connected = false;
        assert!(!delegate.is_live(now, max_age));

        delegate.connected = true;
        delegate.status = DelegateStatus::Disabled;
        assert!(!delegate.is_live(now, max_age));
    }
}
