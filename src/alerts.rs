//! Advisory alerts raised when tasks cannot find delegates or delegates go down.
//!
//! Alerts never block task creation. `AlertLog` is the in-process default:
//! it keeps one open alert per (account, kind) and logs every transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertKind {
    /// No connected, enabled delegate with the task type heartbeated recently.
    NoActiveDelegates,
    /// Live delegates exist but every one is scoped away from the task.
    NoEligibleDelegates {
        task_type: String,
        task_group: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        infrastructure_mapping_id: Option<String>,
    },
    /// A delegate stopped heartbeating.
    DelegatesDown { host_name: String, ip: String },
}

/// An alert that has been opened and not yet closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAlert {
    pub id: Uuid,
    pub account_id: String,
    pub kind: AlertKind,
    pub opened_at: DateTime<Utc>,
}

/// Alert sink consumed by the broker.
#[async_trait]
pub trait AlertService: Send + Sync {
    /// Open an alert. Opening one that is already open is a no-op.
    async fn open_alert(&self, account_id: &str, kind: AlertKind) -> anyhow::Result<()>;

    async fn close_alert(&self, account_id: &str, kind: &AlertKind) -> anyhow::Result<()>;

    /// A delegate (re)joined or changed scope; capacity alerts may be stale.
    async fn active_delegate_updated(&self, account_id: &str, delegate_id: &str)
    -> anyhow::Result<()>;
}

/// In-process, deduplicated alert store.
#[derive(Default)]
pub struct AlertLog {
    open: RwLock<Vec<OpenAlert>>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open alerts for one account, oldest first.
    pub async fn open_alerts(&self, account_id: &str) -> Vec<OpenAlert> {
        self.open
            .read()
            .await
            .iter()
            .filter(|a| a.account_id == account_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AlertService for AlertLog {
    async fn open_alert(&self, account_id: &str, kind: AlertKind) -> anyhow::Result<()> {
        let mut open = self.open.write().await;
        if open
            .iter()
            .any(|a| a.account_id == account_id && a.kind == kind)
        {
            return Ok(());
        }
        warn!(account_id = %account_id, alert = ?kind, "Alert opened");
        open.push(OpenAlert {
            id: Uuid::new_v4(),
            account_id: account_id.to_string(),
            kind,
            opened_at: Utc::now(),
        });
        Ok(())
    }

    async fn close_alert(&self, account_id: &str, kind: &AlertKind) -> anyhow::Result<()> {
        let mut open = self.open.write().await;
        let before = open.len();
        open.retain(|a| !(a.account_id == account_id && &a.kind == kind));
        if open.len() < before {
            info!(account_id = %account_id, alert = ?kind, "Alert closed");
        }
        Ok(())
    }

    async fn active_delegate_updated(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> anyhow::Result<()> {
        let mut open = self.open.write().await;
        let before = open.len();
        // Capacity alerts are re-opened by the next task that still finds none.
        open.retain(|a| {
            !(a.account_id == account_id
                && matches!(
                    a.kind,
                    AlertKind::NoActiveDelegates | AlertKind::NoEligibleDelegates { .. }
                ))
        });
        if open.len() < before {
            info!(
                account_id = %account_id,
                delegate_id = %delegate_id,
                closed = before - open.len(),
                "Capacity alerts closed after delegate update"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(host: &str) -> AlertKind {
        AlertKind::DelegatesDown {
            host_name: host.into(),
            ip: "10.0.0.1".into(),
        }
    }

    #[tokio::test]
    async fn open_is_deduplicated() {
        let log = AlertLog::new();
        log.open_alert("acct", AlertKind::NoActiveDelegates).await.unwrap();
        log.open_alert("acct", AlertKind::NoActiveDelegates).await.unwrap();
        log.open_alert("other", AlertKind::NoActiveDelegates).await.unwrap();

        assert_eq!(log.open_alerts("acct").await.len(), 1);
        assert_eq!(log.open_alerts("other").await.len(), 1);
    }

    #[tokio::test]
    async fn close_matches_kind_exactly() {
        let log = AlertLog::new();
        log.open_alert("acct", down("host-1")).await.unwrap();
        log.open_alert("acct", down("host-2")).await.unwrap();

        log.close_alert("acct", &down("host-1")).await.unwrap();
        let remaining = log.open_alerts("acct").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, down("host-2"));
    }

    #[tokio::test]
    async fn delegate_update_closes_capacity_alerts_only() {
        let log = AlertLog::new();
        log.open_alert("acct", AlertKind::NoActiveDelegates).await.unwrap();
        log.open_alert(
            "acct",
            AlertKind::NoEligibleDelegates {
                task_type: "HTTP".into(),
                task_group: "HTTP".into(),
                app_id: Some("app1".into()),
                env_id: None,
                infrastructure_mapping_id: None,
            },
        )
        .await
        .unwrap();
        log.open_alert("acct", down("host-1")).await.unwrap();

        log.active_delegate_updated("acct", "d1").await.unwrap();
        let remaining = log.open_alerts("acct").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, down("host-1"));
    }
}
