//! Global + per-domain token buckets with optional minimum per-domain
//! spacing and optional adaptive rate adjustment (spec §4.4).

use governor::clock::DefaultClock;
use governor::{Quota, RateLimiter as Governor};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type Bucket = Governor<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

fn bucket(rps: u32, burst: u32) -> Arc<Bucket> {
    let rps = NonZeroU32::new(rps.max(1)).unwrap();
    let burst = NonZeroU32::new(burst.max(1)).unwrap();
    Arc::new(Governor::direct(
        Quota::per_second(rps).allow_burst(burst),
    ))
}

struct DomainState {
    bucket: RwLock<Arc<Bucket>>,
    last_request_ms: AtomicU64,
}

/// Adaptive adjustment bookkeeping for one window (spec §4.4 "Adaptive
/// mode"): counts observations until `window`, then folds the error
/// rate into a rate multiplier and resets.
struct AdaptiveWindow {
    window: u32,
    min_rate: u32,
    max_rate: u32,
    observed: AtomicU32,
    errors: AtomicU32,
    current_rate: AtomicU32,
}

pub struct AdaptiveConfig {
    pub window: u32,
    pub min_rate: u32,
    pub max_rate: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("cancelled while waiting on rate limiter")]
    Cancelled,
}

pub struct RateLimiterConfig {
    pub rps: u32,
    pub burst: u32,
    pub per_domain_delay: Option<Duration>,
    pub adaptive: Option<AdaptiveConfig>,
}

/// Global bucket shared by every request, plus a lazily-populated
/// per-domain table of buckets and optional minimum spacing.
pub struct RateLimiter {
    global: Arc<Bucket>,
    domains: RwLock<HashMap<String, Arc<DomainState>>>,
    default_rps: u32,
    default_burst: u32,
    per_domain_delay: Option<Duration>,
    adaptive: Option<AdaptiveWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let adaptive = config.adaptive.map(|a| AdaptiveWindow {
            window: a.window.max(1),
            min_rate: a.min_rate.max(1),
            max_rate: a.max_rate.max(a.min_rate.max(1)),
            observed: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            current_rate: AtomicU32::new(config.rps.max(1)),
        });
        RateLimiter {
            global: bucket(config.rps, config.burst),
            domains: RwLock::new(HashMap::new()),
            default_rps: config.rps,
            default_burst: config.burst,
            per_domain_delay: config.per_domain_delay,
            adaptive,
        }
    }

    fn get_domain(&self, domain: &str) -> Arc<DomainState> {
        if let Some(state) = self.domains.read().unwrap().get(domain) {
            return state.clone();
        }
        let mut domains = self.domains.write().unwrap();
        domains
            .entry(domain.to_string())
            .or_insert_with(|| {
                let rate = self
                    .adaptive
                    .as_ref()
                    .map(|a| a.current_rate.load(Ordering::Relaxed))
                    .unwrap_or(self.default_rps);
                Arc::new(DomainState {
                    bucket: RwLock::new(bucket(rate, self.default_burst)),
                    last_request_ms: AtomicU64::new(0),
                })
            })
            .clone()
    }

    /// Awaits the global bucket, then the per-domain bucket, honoring
    /// any configured minimum spacing between consecutive requests to
    /// `domain`. Returns `Cancelled` if `cancel` fires first.
    pub async fn wait_domain(
        &self,
        cancel: &CancellationToken,
        domain: &str,
    ) -> Result<(), RateLimitError> {
        tokio::select! {
            _ = self.global.until_ready() => {}
            _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
        }

        let state = self.get_domain(domain);

        if let Some(delay) = self.per_domain_delay {
            let last = state.last_request_ms.load(Ordering::Relaxed);
            let now_ms = crate::models::now_millis();
            if last != 0 {
                let elapsed = now_ms.saturating_sub(last);
                let delay_ms = delay.as_millis() as u64;
                if elapsed < delay_ms {
                    let remaining = Duration::from_millis(delay_ms - elapsed);
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                    }
                }
            }
        }
        state.last_request_ms.store(crate::models::now_millis(), Ordering::Relaxed);

        let domain_bucket = state.bucket.read().unwrap().clone();
        tokio::select! {
            _ = domain_bucket.until_ready() => {}
            _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
        }

        if let Some(adaptive) = &self.adaptive {
            self.maybe_adjust(adaptive, &state, false);
        }

        Ok(())
    }

    /// Records that the request for `domain` completed as an error, for
    /// adaptive-rate bookkeeping. No-op if adaptive mode is disabled.
    pub fn record_error(&self, domain: &str) {
        if let Some(adaptive) = &self.adaptive {
            let state = self.get_domain(domain);
            self.maybe_adjust(adaptive, &state, true);
        }
    }

    fn maybe_adjust(&self, adaptive: &AdaptiveWindow, state: &DomainState, was_error: bool) {
        if was_error {
            adaptive.errors.fetch_add(1, Ordering::Relaxed);
        }
        let observed = adaptive.observed.fetch_add(1, Ordering::Relaxed) + 1;
        if observed < adaptive.window {
            return;
        }
        let errors = adaptive.errors.swap(0, Ordering::Relaxed);
        adaptive.observed.store(0, Ordering::Relaxed);
        let error_rate = errors as f64 / adaptive.window as f64;

        let current = adaptive.current_rate.load(Ordering::Relaxed);
        let next = if error_rate > 0.10 {
            ((current as f64 * 0.8) as u32).max(adaptive.min_rate)
        } else if error_rate < 0.01 {
            ((current as f64 * 1.1) as u32).min(adaptive.max_rate)
        } else {
            current
        };
        if next != current {
            adaptive.current_rate.store(next, Ordering::Relaxed);
            *state.bucket.write().unwrap() = bucket(next, self.default_burst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_domain_succeeds() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rps: 100,
            burst: 100,
            per_domain_delay: None,
            adaptive: None,
        });
        let cancel = CancellationToken::new();
        for _ in 0..5 {
            assert!(limiter.wait_domain(&cancel, "a.test").await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_cancellation_observed() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rps: 1,
            burst: 1,
            per_domain_delay: None,
            adaptive: None,
        });
        let cancel = CancellationToken::new();
        // Exhaust the bucket, then cancel before the next grant.
        assert!(limiter.wait_domain(&cancel, "a.test").await.is_ok());
        cancel.cancel();
        let result = limiter.wait_domain(&cancel, "a.test").await;
        assert!(matches!(result, Err(RateLimitError::Cancelled)));
    }

    #[tokio::test]
    async fn test_per_domain_delay_enforced() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rps: 1000,
            burst: 1000,
            per_domain_delay: Some(Duration::from_millis(50)),
            adaptive: None,
        });
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        limiter.wait_domain(&cancel, "a.test").await.unwrap();
        limiter.wait_domain(&cancel, "a.test").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_independent_domains_not_serialized() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            rps: 1,
            burst: 1,
            per_domain_delay: None,
            adaptive: None,
        });
        let cancel = CancellationToken::new();
        assert!(limiter.wait_domain(&cancel, "a.test").await.is_ok());
        assert!(limiter.wait_domain(&cancel, "b.test").await.is_ok());
    }
}
