//! Delegate registry: registration, heartbeats, operator controls and
//! marking silent delegates down.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::model::{Delegate, DelegateRegistration, DelegateScope, DelegateStatus};
use crate::alerts::{AlertKind, AlertService};
use crate::assign::AssignDelegateService;
use crate::clock::{Clock, to_chrono};
use crate::error::{BrokerError, Result};
use crate::push::{PushChannel, PushMessage};
use crate::store::DelegateStore;

/// A delegate that heartbeated this recently counts as active for alerting.
const ACTIVE_DELEGATE_WINDOW_SECS: i64 = 120;

/// Number of leading account id characters used in Kubernetes delegate host names.
const ACCOUNT_IDENTIFIER_LEN: usize = 6;

pub struct DelegateRegistry {
    store: Arc<dyn DelegateStore>,
    assigner: Arc<dyn AssignDelegateService>,
    alerts: Arc<dyn AlertService>,
    push: Arc<dyn PushChannel>,
    clock: Arc<dyn Clock>,
}

/// Lowercased account prefix embedded in Kubernetes delegate host names.
pub fn account_identifier(account_id: &str) -> String {
    account_id
        .chars()
        .take(ACCOUNT_IDENTIFIER_LEN)
        .collect::<String>()
        .to_lowercase()
}

impl DelegateRegistry {
    pub fn new(
        store: Arc<dyn DelegateStore>,
        assigner: Arc<dyn AssignDelegateService>,
        alerts: Arc<dyn AlertService>,
        push: Arc<dyn PushChannel>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            assigner,
            alerts,
            push,
            clock,
        }
    }

    /// Register a delegate, reusing the existing record for the same host.
    ///
    /// Pods of a Kubernetes delegate change ip on restart, so when the host
    /// name carries the account identifier the ip is not part of the identity.
    pub async fn register(&self, registration: DelegateRegistration) -> Result<Delegate> {
        let now = self.clock.now();
        let ip_matters = !registration
            .host_name
            .contains(&account_identifier(&registration.account_id));

        let existing = self
            .store
            .find_delegate_by_host(
                &registration.account_id,
                &registration.host_name,
                ip_matters.then_some(registration.ip.as_str()),
            )
            .await?;

        let delegate = match existing {
            Some(existing) => {
                let mut refreshed = registration.into_delegate(now);
                refreshed.id = existing.id.clone();
                refreshed.created_at = existing.created_at;
                let updated = self
                    .store
                    .update_delegate_registration(&refreshed)
                    .await?
                    .ok_or_else(|| BrokerError::DelegateNotFound {
                        account_id: existing.account_id.clone(),
                        delegate_id: existing.id.clone(),
                    })?;
                info!(
                    delegate_id = %updated.id,
                    host_name = %updated.host_name,
                    status = %updated.status,
                    "Delegate re-registered"
                );
                if let Err(e) = self
                    .push
                    .broadcast(
                        &updated.account_id,
                        PushMessage::DelegateReconnected {
                            delegate_id: updated.id.clone(),
                        },
                    )
                    .await
                {
                    warn!(delegate_id = %updated.id, error = %e, "Failed to push reconnect");
                }
                updated
            }
            None => {
                let delegate = registration.into_delegate(now);
                self.store.insert_delegate(&delegate).await?;
                info!(
                    delegate_id = %delegate.id,
                    account_id = %delegate.account_id,
                    host_name = %delegate.host_name,
                    "Delegate registered"
                );
                delegate
            }
        };

        self.notify_active(&delegate.account_id, &delegate.id).await;
        Ok(delegate)
    }

    pub async fn heartbeat(&self, account_id: &str, delegate_id: &str) -> Result<Delegate> {
        let delegate = self
            .store
            .record_heartbeat(account_id, delegate_id, self.clock.now())
            .await?
            .ok_or_else(|| not_found(account_id, delegate_id))?;
        debug!(delegate_id = %delegate_id, "Heartbeat");
        Ok(delegate)
    }

    pub async fn get(&self, account_id: &str, delegate_id: &str) -> Result<Option<Delegate>> {
        Ok(self.store.get_delegate(account_id, delegate_id).await?)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<Delegate>> {
        Ok(self.store.list_delegates(account_id).await?)
    }

    pub async fn set_status(
        &self,
        account_id: &str,
        delegate_id: &str,
        status: DelegateStatus,
    ) -> Result<Delegate> {
        let delegate = self
            .store
            .update_delegate_status(account_id, delegate_id, status)
            .await?
            .ok_or_else(|| not_found(account_id, delegate_id))?;
        info!(delegate_id = %delegate_id, status = %status, "Delegate status changed");
        Ok(delegate)
    }

    pub async fn update_scopes(
        &self,
        account_id: &str,
        delegate_id: &str,
        include: Vec<DelegateScope>,
        exclude: Vec<DelegateScope>,
    ) -> Result<Delegate> {
        if let Some(bad) = include.iter().chain(exclude.iter()).find(|s| !s.is_valid()) {
            return Err(BrokerError::InvalidScope(format!(
                "scope {:?} restricts nothing",
                bad.name
            ))
            .into());
        }

        let delegate = self
            .store
            .update_delegate_scopes(account_id, delegate_id, &include, &exclude)
            .await?
            .ok_or_else(|| not_found(account_id, delegate_id))?;
        info!(
            delegate_id = %delegate_id,
            include = delegate.include_scopes.len(),
            exclude = delegate.exclude_scopes.len(),
            "Delegate scopes updated"
        );

        let active_since = self.clock.now() - chrono::Duration::seconds(ACTIVE_DELEGATE_WINDOW_SECS);
        if delegate.last_heartbeat > active_since {
            self.notify_active(account_id, delegate_id).await;
        }
        Ok(delegate)
    }

    /// Delete a delegate and close its "delegates down" alert.
    pub async fn delete(&self, account_id: &str, delegate_id: &str) -> Result<Delegate> {
        let delegate = self
            .store
            .delete_delegate(account_id, delegate_id)
            .await?
            .ok_or_else(|| not_found(account_id, delegate_id))?;

        let kind = AlertKind::DelegatesDown {
            host_name: delegate.host_name.clone(),
            ip: delegate.ip.clone(),
        };
        if let Err(e) = self.alerts.close_alert(account_id, &kind).await {
            warn!(delegate_id = %delegate_id, error = %e, "Failed to close delegates-down alert");
        }
        self.clear_cache(delegate_id).await;
        info!(delegate_id = %delegate_id, host_name = %delegate.host_name, "Delegate deleted");
        Ok(delegate)
    }

    /// Drop the delegate's cached connectivity results.
    pub async fn clear_cache(&self, delegate_id: &str) {
        if let Err(e) = self.assigner.clear_connection_results(delegate_id).await {
            warn!(delegate_id = %delegate_id, error = %e, "Failed to clear connection results");
        }
    }

    /// Disconnect every delegate silent for longer than `max_heartbeat_age`
    /// and open one "delegates down" alert per host.
    pub async fn mark_down_delegates(
        &self,
        max_heartbeat_age: std::time::Duration,
    ) -> Result<Vec<Delegate>> {
        let cutoff = self.clock.now() - to_chrono(max_heartbeat_age);
        let down = self.store.disconnect_stale_delegates(cutoff).await?;

        let mut seen = HashSet::new();
        for delegate in &down {
            if !seen.insert((delegate.account_id.as_str(), delegate.host_name.as_str())) {
                continue;
            }
            warn!(
                delegate_id = %delegate.id,
                host_name = %delegate.host_name,
                last_heartbeat = %delegate.last_heartbeat,
                "Delegate marked down"
            );
            let kind = AlertKind::DelegatesDown {
                host_name: delegate.host_name.clone(),
                ip: delegate.ip.clone(),
            };
            if let Err(e) = self.alerts.open_alert(&delegate.account_id, kind).await {
                warn!(delegate_id = %delegate.id, error = %e, "Failed to open delegates-down alert");
            }
        }
        Ok(down)
    }

    async fn notify_active(&self, account_id: &str, delegate_id: &str) {
        if let Err(e) = self.alerts.active_delegate_updated(account_id, delegate_id).await {
            warn!(delegate_id = %delegate_id, error = %e, "Failed to update delegate alerts");
        }
    }
}

fn not_found(account_id: &str, delegate_id: &str) -> BrokerError {
    BrokerError::DelegateNotFound {
        account_id: account_id.to_string(),
        delegate_id: delegate_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::alerts::AlertLog;
    use crate::assign::{ConnectionResultCache, ScopedAssigner};
    use crate::clock::ManualClock;
    use crate::push::PushHub;
    use crate::tasks::model::{ConnectionResult, DelegateTask, TaskTarget};

    struct Fixture {
        clock: Arc<ManualClock>,
        alerts: Arc<AlertLog>,
        hub: Arc<PushHub>,
        assigner: Arc<ScopedAssigner>,
        registry: DelegateRegistry,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(crate::store::LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(ConnectionResultCache::new(100, Duration::from_secs(3600), clock.clone()));
        let assigner = Arc::new(ScopedAssigner::new(
            db.clone(),
            cache,
            clock.clone(),
            Duration::from_secs(315),
        ));
        let alerts = Arc::new(AlertLog::new());
        let hub = PushHub::new();
        let registry = DelegateRegistry::new(
            db,
            assigner.clone(),
            alerts.clone(),
            hub.clone(),
            clock.clone(),
        );
        Fixture {
            clock,
            alerts,
            hub,
            assigner,
            registry,
        }
    }

    fn registration(account: &str, host: &str, ip: &str) -> DelegateRegistration {
        DelegateRegistration {
            account_id: account.into(),
            host_name: host.into(),
            ip: ip.into(),
            supported_task_types: vec!["EXEC".into()],
            version: Some("1.0.0".into()),
            description: None,
        }
    }

    #[test]
    fn account_identifier_is_lowercased_prefix() {
        assert_eq!(account_identifier("KmpySmUISimoRrJL6NL73w"), "kmpysm");
        assert_eq!(account_identifier("abc"), "abc");
    }

    #[tokio::test]
    async fn reregistration_keeps_id_and_status() {
        let f = fixture().await;
        let first = f
            .registry
            .register(registration("acct", "host-1", "10.0.0.1"))
            .await
            .unwrap();
        f.registry
            .set_status("acct", &first.id, DelegateStatus::Disabled)
            .await
            .unwrap();

        let mut rx = f.hub.subscribe();
        let mut again = registration("acct", "host-1", "10.0.0.1");
        again.version = Some("1.0.1".into());
        let second = f.registry.register(again).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.status, DelegateStatus::Disabled);
        assert_eq!(second.version.as_deref(), Some("1.0.1"));
        assert_eq!(f.registry.list("acct").await.unwrap().len(), 1);

        let pushed = rx.recv().await.unwrap();
        assert_eq!(
            pushed.message,
            PushMessage::DelegateReconnected {
                delegate_id: first.id
            }
        );
    }

    #[tokio::test]
    async fn different_ip_is_a_new_delegate_unless_kubernetes_host() {
        let f = fixture().await;
        let a = f
            .registry
            .register(registration("AbCdEfGh", "host-1", "10.0.0.1"))
            .await
            .unwrap();
        let b = f
            .registry
            .register(registration("AbCdEfGh", "host-1", "10.0.0.2"))
            .await
            .unwrap();
        assert_ne!(a.id, b.id);

        let pod1 = f
            .registry
            .register(registration("AbCdEfGh", "delegate-abcdef-0", "10.1.0.1"))
            .await
            .unwrap();
        let pod2 = f
            .registry
            .register(registration("AbCdEfGh", "delegate-abcdef-0", "10.1.0.2"))
            .await
            .unwrap();
        assert_eq!(pod1.id, pod2.id);
        assert_eq!(pod2.ip, "10.1.0.2");
    }

    #[tokio::test]
    async fn heartbeat_unknown_delegate_is_not_found() {
        let f = fixture().await;
        let err = f.registry.heartbeat("acct", "missing").await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Broker(BrokerError::DelegateNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_scope_is_rejected() {
        let f = fixture().await;
        let d = f
            .registry
            .register(registration("acct", "host-1", "10.0.0.1"))
            .await
            .unwrap();
        let err = f
            .registry
            .update_scopes("acct", &d.id, vec![DelegateScope::default()], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::Broker(BrokerError::InvalidScope(_))));
    }

    #[tokio::test]
    async fn scope_update_on_active_delegate_closes_capacity_alerts() {
        let f = fixture().await;
        let d = f
            .registry
            .register(registration("acct", "host-1", "10.0.0.1"))
            .await
            .unwrap();
        f.alerts
            .open_alert("acct", AlertKind::NoActiveDelegates)
            .await
            .unwrap();

        let scope = DelegateScope {
            name: "prod".into(),
            environments: vec!["prod".into()],
            ..Default::default()
        };
        f.registry
            .update_scopes("acct", &d.id, vec![scope], vec![])
            .await
            .unwrap();
        assert!(f.alerts.open_alerts("acct").await.is_empty());
    }

    #[tokio::test]
    async fn mark_down_opens_one_alert_per_host_and_delete_closes_it() {
        let f = fixture().await;
        let d = f
            .registry
            .register(registration("acct", "host-1", "10.0.0.1"))
            .await
            .unwrap();

        f.clock.advance(chrono::Duration::minutes(10));
        let down = f
            .registry
            .mark_down_delegates(Duration::from_secs(315))
            .await
            .unwrap();
        assert_eq!(down.len(), 1);
        assert!(!f.registry.get("acct", &d.id).await.unwrap().unwrap().connected);

        let alerts = f.alerts.open_alerts("acct").await;
        assert_eq!(alerts.len(), 1);
        assert!(matches!(alerts[0].kind, AlertKind::DelegatesDown { .. }));

        f.registry.delete("acct", &d.id).await.unwrap();
        assert!(f.alerts.open_alerts("acct").await.is_empty());
        assert!(f.registry.get("acct", &d.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_cache_drops_whitelist() {
        let f = fixture().await;
        let task = DelegateTask::new("acct", "EXEC").with_target(TaskTarget::Http {
            url: "https://example.com".into(),
        });
        f.assigner
            .save_connection_results(&[ConnectionResult {
                account_id: "acct".into(),
                delegate_id: "d1".into(),
                criteria: "https://example.com".into(),
                validated: true,
            }])
            .await
            .unwrap();
        assert!(f.assigner.is_whitelisted(&task, "d1").await.unwrap());

        f.registry.clear_cache("d1").await;
        assert!(!f.assigner.is_whitelisted(&task, "d1").await.unwrap());
    }
}
