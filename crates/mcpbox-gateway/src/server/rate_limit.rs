//! Fixed-window budgets for the OAuth endpoints.
//!
//! The login, token, and registration endpoints are the only places an
//! anonymous caller can make the gateway do real work (bcrypt, store
//! writes), so each gets a request budget per minute. Every rule owns its
//! own lock-free bucket: a window sequence number and a use counter, both
//! atomics. The first request that lands in a new window wins the
//! compare-exchange and zeroes the counter; everyone else just increments
//! and compares against the budget. No locks, no allocation per request.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

/// One route prefix with its budget and bucket state.
pub struct RateLimitRule {
    prefix: String,
    max_requests: u32,
    window: Duration,
    window_seq: AtomicU64,
    used: AtomicU32,
}

impl RateLimitRule {
    pub fn new(prefix: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self {
            prefix: prefix.into(),
            max_requests,
            window,
            window_seq: AtomicU64::new(0),
            used: AtomicU32::new(0),
        }
    }

    /// Count one request against the bucket; `elapsed` is time since the
    /// limiter started.
    fn try_acquire(&self, elapsed: Duration) -> bool {
        let seq = (elapsed.as_nanos() / self.window.as_nanos()) as u64;
        let seen = self.window_seq.load(Ordering::Acquire);
        if seen != seq
            && self
                .window_seq
                .compare_exchange(seen, seq, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.used.store(0, Ordering::Release);
        }
        self.used.fetch_add(1, Ordering::AcqRel) < self.max_requests
    }
}

/// Shared limiter; clones share the same buckets.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<LimiterInner>,
}

struct LimiterInner {
    started: Instant,
    rules: Vec<RateLimitRule>,
}

impl RateLimiter {
    pub fn new(rules: Vec<RateLimitRule>) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                started: Instant::now(),
                rules,
            }),
        }
    }

    /// Whether a request for `path` fits in its budget. The first matching
    /// rule applies; unbudgeted paths always pass.
    fn check(&self, path: &str) -> bool {
        let elapsed = self.inner.started.elapsed();
        self.inner
            .rules
            .iter()
            .find(|rule| path.starts_with(rule.prefix.as_str()))
            .map_or(true, |rule| rule.try_acquire(elapsed))
    }
}

/// Per-minute budgets for the endpoints that do expensive work for
/// anonymous callers.
pub fn default_oauth_rate_limiter() -> RateLimiter {
    let minute = Duration::from_secs(60);
    RateLimiter::new(vec![
        RateLimitRule::new("/authorize", 30, minute),
        RateLimitRule::new("/token", 60, minute),
        RateLimitRule::new("/register", 20, minute),
        RateLimitRule::new("/callback/", 30, minute),
    ])
}

pub async fn rate_limit_middleware(request: Request, next: Next) -> Response {
    let limiter = request.extensions().get::<RateLimiter>().cloned();

    if let Some(limiter) = limiter {
        let path = request.uri().path();
        if !limiter.check(path) {
            warn!(path, "rate limit exceeded");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "slow_down",
                    "error_description": "Rate limit exceeded. Please try again later."
                })),
            )
                .into_response();
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(vec![RateLimitRule::new("/token", max, window)])
    }

    #[test]
    fn test_allows_within_budget() {
        let limiter = limiter(3, Duration::from_secs(60));
        assert!(limiter.check("/token"));
        assert!(limiter.check("/token"));
        assert!(limiter.check("/token"));
        assert!(!limiter.check("/token"));
        assert!(!limiter.check("/token"));
    }

    #[test]
    fn test_window_reset() {
        let limiter = limiter(1, Duration::from_millis(10));
        assert!(limiter.check("/token"));
        assert!(!limiter.check("/token"));
        std::thread::sleep(Duration::from_millis(25));
        assert!(limiter.check("/token"));
    }

    #[test]
    fn test_unmatched_paths_pass() {
        let limiter = limiter(1, Duration::from_secs(60));
        assert!(limiter.check("/token"));
        assert!(!limiter.check("/token"));
        // Other routes are not budgeted.
        assert!(limiter.check("/health"));
        assert!(limiter.check("/mcp"));
    }

    #[test]
    fn test_rules_are_independent() {
        let minute = Duration::from_secs(60);
        let limiter = RateLimiter::new(vec![
            RateLimitRule::new("/token", 1, minute),
            RateLimitRule::new("/register", 1, minute),
        ]);
        assert!(limiter.check("/token"));
        assert!(!limiter.check("/token"));
        // /register has its own bucket.
        assert!(limiter.check("/register"));
    }

    #[test]
    fn test_clones_share_buckets() {
        let limiter = limiter(2, Duration::from_secs(60));
        let other = limiter.clone();
        assert!(limiter.check("/token"));
        assert!(other.check("/token"));
        assert!(!limiter.check("/token"));
        assert!(!other.check("/token"));
    }

    #[test]
    fn test_concurrent_acquire_respects_budget() {
        let limiter = limiter(50, Duration::from_secs(60));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                (0..25).filter(|_| limiter.check("/token")).count()
            }));
        }
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // 200 attempts against a budget of 50 in one window.
        assert_eq!(allowed, 50);
    }
}
