//! Bounded TTL cache of delegate connectivity results (the whitelist).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tracing::warn;

use crate::clock::Clock;
use crate::tasks::model::ConnectionResult;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
struct CacheKey {
    delegate_id: String,
    criteria: String,
}

/// One cached probe outcome.
#[derive(Clone, Debug)]
pub struct CachedResult {
    pub account_id: String,
    pub validated: bool,
    pub cached_at: DateTime<Utc>,
}

/// Connection results keyed by (delegate, criteria).
///
/// Entries expire from moka after `ttl` of real time. Freshness is also
/// checked against the injected clock so time-dependent tests stay exact.
pub struct ConnectionResultCache {
    cache: Cache<CacheKey, CachedResult>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl ConnectionResultCache {
    pub fn new(max_capacity: u64, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .support_invalidation_closures()
            .build();

        Self { cache, ttl, clock }
    }

    /// Save results. Blank criteria are ignored.
    pub async fn save(&self, results: &[ConnectionResult]) {
        let now = self.clock.now();
        for result in results.iter().filter(|r| !r.criteria.trim().is_empty()) {
            self.cache
                .insert(
                    CacheKey {
                        delegate_id: result.delegate_id.clone(),
                        criteria: result.criteria.clone(),
                    },
                    CachedResult {
                        account_id: result.account_id.clone(),
                        validated: result.validated,
                        cached_at: now,
                    },
                )
                .await;
        }
    }

    /// The fresh result for (delegate, criteria), if any.
    pub async fn get(&self, delegate_id: &str, criteria: &str) -> Option<CachedResult> {
        let key = CacheKey {
            delegate_id: delegate_id.to_string(),
            criteria: criteria.to_string(),
        };
        let cached = self.cache.get(&key).await?;
        let age = (self.clock.now() - cached.cached_at).to_std().unwrap_or_default();
        if age > self.ttl {
            self.cache.invalidate(&key).await;
            return None;
        }
        Some(cached)
    }

    /// True when the delegate has a fresh, validated result for every criterion.
    pub async fn all_validated(&self, delegate_id: &str, criteria: &[String]) -> bool {
        for criterion in criteria {
            match self.get(delegate_id, criterion).await {
                Some(cached) if cached.validated => {}
                _ => return false,
            }
        }
        true
    }

    /// Drop every cached result for a delegate.
    pub fn clear_delegate(&self, delegate_id: &str) {
        let delegate_id = delegate_id.to_string();
        if let Err(e) = self
            .cache
            .invalidate_entries_if(move |key, _| key.delegate_id == delegate_id)
        {
            warn!(error = %e, "Failed to clear cached connection results");
        }
    }
}
