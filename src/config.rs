//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// What `proceed_anyway` does once validation is complete but no delegate
/// managed to validate the task's target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceedAnywayPolicy {
    /// Force-assign to the asking delegate (availability over safety).
    Allow,
    /// Leave the task queued until a delegate validates or it times out.
    Deny,
}

impl FromStr for ProceedAnywayPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" | "true" | "1" => Ok(Self::Allow),
            "deny" | "false" | "0" => Ok(Self::Deny),
            other => Err(ConfigError::InvalidValue {
                key: "DELEGATE_BROKER_PROCEED_ANYWAY".into(),
                message: format!("expected allow or deny, got {other:?}"),
            }),
        }
    }
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Port for the HTTP/WebSocket server.
    pub http_port: u16,
    /// Delegates whose last heartbeat is older than this are not live.
    pub max_heartbeat_age: Duration,
    /// How long validation may run before `proceed_anyway` can force progress.
    pub validation_timeout: Duration,
    pub proceed_anyway: ProceedAnywayPolicy,
    /// Poll cadence for blocking sync submissions.
    pub sync_poll_interval: Duration,
    /// Tasks created longer ago than this are swept.
    pub retention: Duration,
    /// How often the retention sweep runs.
    pub retention_interval: Duration,
    /// Maximum task ids selected per sweep batch.
    pub sweep_batch_limit: usize,
    /// Wall-clock budget for one sweep.
    pub sweep_budget: Duration,
    /// Pause between sweep batches.
    pub sweep_pause: Duration,
    /// How often stale delegates are marked down.
    pub liveness_interval: Duration,
    /// Freshness window of a cached connection result.
    pub whitelist_ttl: Duration,
    /// Maximum number of cached connection results.
    pub whitelist_capacity: u64,
    /// How long an async response waits to be collected by its wait id.
    pub wait_buffer_ttl: Duration,
    /// Maximum number of uncollected async responses held in memory.
    pub wait_buffer_capacity: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/delegate-broker.db"),
            http_port: 8080,
            max_heartbeat_age: Duration::from_secs(5 * 60 + 15),
            validation_timeout: Duration::from_secs(12),
            proceed_anyway: ProceedAnywayPolicy::Allow,
            sync_poll_interval: Duration::from_millis(500),
            retention: Duration::from_secs(3600), // 1 hour
            retention_interval: Duration::from_secs(3600),
            sweep_batch_limit: 1000,
            sweep_budget: Duration::from_secs(600), // 10 minutes
            sweep_pause: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(60),
            whitelist_ttl: Duration::from_secs(6 * 3600),
            whitelist_capacity: 10_000,
            wait_buffer_ttl: Duration::from_secs(3600),
            wait_buffer_capacity: 10_000,
        }
    }
}

impl BrokerConfig {
    /// Build config from `DELEGATE_BROKER_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let proceed_anyway = match std::env::var("DELEGATE_BROKER_PROCEED_ANYWAY") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.proceed_anyway,
        };

        let config = Self {
            db_path: std::env::var("DELEGATE_BROKER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: env_parse("DELEGATE_BROKER_HTTP_PORT").unwrap_or(defaults.http_port),
            max_heartbeat_age: env_secs("DELEGATE_BROKER_MAX_HEARTBEAT_AGE_SECS")
                .unwrap_or(defaults.max_heartbeat_age),
            validation_timeout: env_millis("DELEGATE_BROKER_VALIDATION_TIMEOUT_MS")
                .unwrap_or(defaults.validation_timeout),
            proceed_anyway,
            sync_poll_interval: env_millis("DELEGATE_BROKER_SYNC_POLL_INTERVAL_MS")
                .unwrap_or(defaults.sync_poll_interval),
            retention: env_secs("DELEGATE_BROKER_RETENTION_SECS").unwrap_or(defaults.retention),
            retention_interval: env_secs("DELEGATE_BROKER_RETENTION_INTERVAL_SECS")
                .unwrap_or(defaults.retention_interval),
            sweep_batch_limit: env_parse("DELEGATE_BROKER_SWEEP_BATCH_LIMIT")
                .unwrap_or(defaults.sweep_batch_limit),
            sweep_budget: env_secs("DELEGATE_BROKER_SWEEP_BUDGET_SECS")
                .unwrap_or(defaults.sweep_budget),
            sweep_pause: env_millis("DELEGATE_BROKER_SWEEP_PAUSE_MS")
                .unwrap_or(defaults.sweep_pause),
            liveness_interval: env_secs("DELEGATE_BROKER_LIVENESS_INTERVAL_SECS")
                .unwrap_or(defaults.liveness_interval),
            whitelist_ttl: env_secs("DELEGATE_BROKER_WHITELIST_TTL_SECS")
                .unwrap_or(defaults.whitelist_ttl),
            whitelist_capacity: env_parse("DELEGATE_BROKER_WHITELIST_CAPACITY")
                .unwrap_or(defaults.whitelist_capacity),
            wait_buffer_ttl: env_secs("DELEGATE_BROKER_WAIT_BUFFER_TTL_SECS")
                .unwrap_or(defaults.wait_buffer_ttl),
            wait_buffer_capacity: env_parse("DELEGATE_BROKER_WAIT_BUFFER_CAPACITY")
                .unwrap_or(defaults.wait_buffer_capacity),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_batch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DELEGATE_BROKER_SWEEP_BATCH_LIMIT".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.sync_poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "DELEGATE_BROKER_SYNC_POLL_INTERVAL_MS".into(),
                message: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_broker_constants() {
        let config = BrokerConfig::default();
        assert_eq!(config.validation_timeout, Duration::from_secs(12));
        assert_eq!(config.sync_poll_interval, Duration::from_millis(500));
        assert_eq!(config.sweep_batch_limit, 1000);
        assert_eq!(config.sweep_budget, Duration::from_secs(600));
        assert_eq!(config.max_heartbeat_age, Duration::from_secs(315));
        assert_eq!(config.proceed_anyway, ProceedAnywayPolicy::Allow);
        assert_eq!(config.wait_buffer_capacity, 10_000);
    }

    #[test]
    fn proceed_policy_parses() {
        assert_eq!("allow".parse::<ProceedAnywayPolicy>().unwrap(), ProceedAnywayPolicy::Allow);
        assert_eq!(" Deny ".parse::<ProceedAnywayPolicy>().unwrap(), ProceedAnywayPolicy::Deny);
        assert!("sometimes".parse::<ProceedAnywayPolicy>().is_err());
    }

    #[test]
    fn zero_batch_limit_is_rejected() {
        let config = BrokerConfig {
            sweep_batch_limit: 0,
            ..BrokerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
