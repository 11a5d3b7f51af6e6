//! Token bucket rate limiter and the shared request budget.
//!
//! Every outbound request in a run, from every stage, passes through one
//! [`RequestBudget`]: a global concurrency cap, a per-source token bucket
//! and a per-source timeout.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use super::provider::ProviderError;

/// A token bucket rate limiter.
///
/// Allows up to `capacity` requests per second, with tokens
/// being refilled continuously at a rate of `requests_per_minute / 60`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum tokens in the bucket
    capacity: u32,
    /// Current available tokens (scaled by 1000 for precision)
    tokens: AtomicU64,
    /// Tokens added per millisecond (unscaled)
    refill_rate_per_ms: f64,
    /// Last refill timestamp
    last_refill: Mutex<Instant>,
    /// Name for logging
    name: String,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// # Arguments
    /// * `name` - Name for logging purposes
    /// * `requests_per_minute` - Maximum requests allowed per minute
    pub fn new(name: impl Into<String>, requests_per_minute: u32) -> Self {
        // Use a 1-second window for smoother rate limiting
        let requests_per_second = (requests_per_minute as f64 / 60.0).ceil() as u32;
        let capacity = requests_per_second.max(1);

        let refill_rate_per_ms = requests_per_minute as f64 / 60_000.0;

        Self {
            capacity,
            tokens: AtomicU64::new((capacity as u64) * 1000), // Scale by 1000
            refill_rate_per_ms,
            last_refill: Mutex::new(Instant::now()),
            name: name.into(),
        }
    }

    /// Acquire a token, waiting if necessary.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }

            // Calculate wait time for next token
            let wait_ms = if self.refill_rate_per_ms > 0.0 {
                (1.0 / self.refill_rate_per_ms).ceil() as u64
            } else {
                1000
            };
            let wait_time = Duration::from_millis(wait_ms.clamp(10, 1000));

            debug!(
                limiter = %self.name,
                wait_ms = wait_time.as_millis() as u64,
                "Rate limited, waiting for token"
            );

            tokio::time::sleep(wait_time).await;
        }
    }

    /// Try to acquire a token without waiting.
    ///
    /// Returns `true` if a token was acquired, `false` otherwise.
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < 1000 {
                return false;
            }

            let new_value = current - 1000;
            if self
                .tokens
                .compare_exchange_weak(current, new_value, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Refill tokens based on elapsed time.
    fn refill(&self) {
        // try_lock: a concurrent refill is as good as ours
        if let Ok(mut last_refill) = self.last_refill.try_lock() {
            let now = Instant::now();
            let elapsed_ms = now.duration_since(*last_refill).as_millis() as f64;

            if elapsed_ms > 0.0 {
                let new_tokens = (elapsed_ms * self.refill_rate_per_ms * 1000.0) as u64;

                if new_tokens > 0 {
                    let max_tokens = (self.capacity as u64) * 1000;

                    loop {
                        let current = self.tokens.load(Ordering::Relaxed);
                        let new_value = (current + new_tokens).min(max_tokens);

                        if current == new_value
                            || self
                                .tokens
                                .compare_exchange_weak(
                                    current,
                                    new_value,
                                    Ordering::Relaxed,
                                    Ordering::Relaxed,
                                )
                                .is_ok()
                        {
                            break;
                        }
                    }

                    *last_refill = now;
                }
            }
        }
    }

    /// Get the configured capacity.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Shared rate limiter that can be cloned.
pub type SharedRateLimiter = Arc<RateLimiter>;

/// Create a shared rate limiter.
pub fn shared_limiter(name: impl Into<String>, requests_per_minute: u32) -> SharedRateLimiter {
    Arc::new(RateLimiter::new(name, requests_per_minute))
}

// ============================================================================
// Request Budget
// ============================================================================

#[derive(Debug)]
struct SourceBudget {
    limiter: SharedRateLimiter,
    timeout: Duration,
}

/// Central request budget shared by every stage of a run.
#[derive(Debug)]
pub struct RequestBudget {
    permits: Semaphore,
    max_concurrency: usize,
    sources: HashMap<String, SourceBudget>,
    default_timeout: Duration,
}

impl RequestBudget {
    /// Create a budget allowing `max_concurrency` in-flight requests overall.
    pub fn new(max_concurrency: usize, default_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            permits: Semaphore::new(max_concurrency),
            max_concurrency,
            sources: HashMap::new(),
            default_timeout,
        }
    }

    /// Register a source with its own rate limit and request timeout.
    pub fn with_source(
        mut self,
        name: impl Into<String>,
        requests_per_minute: u32,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        let limiter = shared_limiter(name.clone(), requests_per_minute);
        self.sources.insert(name, SourceBudget { limiter, timeout });
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Limiter of a registered source.
    pub fn limiter(&self, source: &str) -> Option<SharedRateLimiter> {
        self.sources.get(source).map(|s| Arc::clone(&s.limiter))
    }

    /// Run one outbound request under the budget.
    ///
    /// Waits for a concurrency permit and a rate-limit token of `source`,
    /// then bounds the request by the source timeout.
    pub async fn call<T, F>(&self, source: &str, request: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("request budget closed".into()))?;

        let timeout = match self.sources.get(source) {
            Some(budget) => {
                budget.limiter.acquire().await;
                budget.timeout
            }
            None => self.default_timeout,
        };

        match tokio::time::timeout(timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                millis: timeout.as_millis() as u64,
            }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new("test", 300);
        assert_eq!(limiter.capacity(), 5); // 300/60 = 5 req/sec
    }

    #[test]
    fn test_try_acquire() {
        let limiter = RateLimiter::new("test", 60); // 1 req/sec
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn test_acquire_refill() {
        let limiter = RateLimiter::new("test", 6000); // 100 req/sec

        for _ in 0..100 {
            if !limiter.try_acquire() {
                break;
            }
        }

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_budget_times_out_slow_request() {
        let budget = RequestBudget::new(2, Duration::from_millis(20));
        let result: Result<(), ProviderError> = tokio_test::block_on(budget.call(
            "unregistered",
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        ));
        assert_eq!(result, Err(ProviderError::Timeout { millis: 20 }));
    }

    #[tokio::test]
    async fn test_budget_caps_concurrency() {
        let budget = Arc::new(RequestBudget::new(2, Duration::from_secs(5)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let budget = Arc::clone(&budget);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                budget
                    .call("any", async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, ProviderError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_budget_registers_sources() {
        let budget = RequestBudget::new(4, Duration::from_secs(5))
            .with_source("tencent", 600, Duration::from_secs(10))
            .with_source("sina", 300, Duration::from_secs(10));
        assert_eq!(budget.limiter("tencent").unwrap().capacity(), 10);
        assert_eq!(budget.limiter("sina").unwrap().capacity(), 5);
        assert!(budget.limiter("other").is_none());
        assert_eq!(budget.max_concurrency(), 4);
    }
}
