use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::auth::user_fingerprint;
use crate::config::AppConfig;
use crate::error::AppError;

/// Per-user sliding window over the write-heavy sync endpoints
#[derive(Clone)]
pub struct EndpointRateLimiter {
    state: Arc<Mutex<HashMap<String, RateWindow>>>,
    window: Duration,
    push_limit: u32,
    pull_limit: u32,
    metrics: Arc<RateLimitMetrics>,
}

#[derive(Clone, Copy)]
pub enum ProtectedEndpoint {
    SyncPush,
    SyncPull,
}

#[derive(Default)]
struct RateLimitMetrics {
    push_allowed: AtomicU64,
    push_limited: AtomicU64,
    pull_allowed: AtomicU64,
    pull_limited: AtomicU64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RateLimitMetricsSnapshot {
    pub push_allowed: u64,
    pub push_limited: u64,
    pub pull_allowed: u64,
    pub pull_limited: u64,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: Instant,
    count: u32,
}

impl EndpointRateLimiter {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(HashMap::new())),
            window: config.rate_limit_window,
            push_limit: config.push_rate_limit_per_window,
            pull_limit: config.pull_rate_limit_per_window,
            metrics: Arc::new(RateLimitMetrics::default()),
        }
    }

    pub async fn check(&self, endpoint: ProtectedEndpoint, user_id: &str) -> Result<(), AppError> {
        let limit = match endpoint {
            ProtectedEndpoint::SyncPush => self.push_limit,
            ProtectedEndpoint::SyncPull => self.pull_limit,
        };

        let key = format!("{}:{user_id}", endpoint.label());
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let entry = guard.entry(key).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });

        if now.duration_since(entry.started_at) >= self.window {
            entry.started_at = now;
            entry.count = 0;
        }

        if entry.count >= limit {
            let retry_after_secs = self
                .window
                .saturating_sub(now.duration_since(entry.started_at))
                .as_secs();
            self.mark_limited(endpoint);
            tracing::warn!(
                endpoint = endpoint.label(),
                user = user_fingerprint(user_id),
                retry_after_secs,
                "Rate limit exceeded"
            );
            return Err(AppError::too_many_requests(
                "Rate limit exceeded for sync endpoint",
                retry_after_secs,
            ));
        }

        entry.count += 1;
        self.mark_allowed(endpoint);
        Ok(())
    }

    pub fn metrics_snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            push_allowed: self.metrics.push_allowed.load(Ordering::Relaxed),
            push_limited: self.metrics.push_limited.load(Ordering::Relaxed),
            pull_allowed: self.metrics.pull_allowed.load(Ordering::Relaxed),
            pull_limited: self.metrics.pull_limited.load(Ordering::Relaxed),
        }
    }

    fn mark_allowed(&self, endpoint: ProtectedEndpoint) {
        match endpoint {
            ProtectedEndpoint::SyncPush => {
                self.metrics.push_allowed.fetch_add(1, Ordering::Relaxed);
            }
            ProtectedEndpoint::SyncPull => {
                self.metrics.pull_allowed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn mark_limited(&self, endpoint: ProtectedEndpoint) {
        match endpoint {
            ProtectedEndpoint::SyncPush => {
                self.metrics.push_limited.fetch_add(1, Ordering::Relaxed);
            }
            ProtectedEndpoint::SyncPull => {
                self.metrics.pull_limited.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl ProtectedEndpoint {
    pub const fn label(self) -> &'static str {
        match self {
            Self::SyncPush => "sync_push",
            Self::SyncPull => "sync_pull",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_blocks_after_limit() {
        let limiter = EndpointRateLimiter {
            state: Arc::new(Mutex::new(HashMap::new())),
            window: Duration::from_secs(60),
            push_limit: 2,
            pull_limit: 2,
            metrics: Arc::new(RateLimitMetrics::default()),
        };

        limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap();
        limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap();

        let err = limiter
            .check(ProtectedEndpoint::SyncPush, "user-a")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TooManyRequests(_, _)));

        let metrics = limiter.metrics_snapshot();
        assert_eq!(metrics.push_allowed, 2);
        assert_eq!(metrics.push_limited, 1);
    }

    #[tokio::test]
    async fn rate_limiter_tracks_users_independently() {
        let limiter = EndpointRateLimiter {
            state: Arc::new(Mutex::new(HashMap::new())),
            window: Duration::from_secs(60),
            push_limit: 1,
            pull_limit: 1,
            metrics: Arc::new(RateLimitMetrics::default()),
        };

        limiter
            .check(ProtectedEndpoint::SyncPull, "user-a")
            .await
            .unwrap();
        limiter
            .check(ProtectedEndpoint::SyncPull, "user-b")
            .await
            .unwrap();

        assert!(limiter
            .check(ProtectedEndpoint::SyncPull, "user-a")
            .await
            .is_err());
    }
}
