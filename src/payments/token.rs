//! Process-wide cache for the gateway's OAuth access token.
//!
//! Reads take a shared lock. A refresh takes the refresh gate, re-checks the
//! cache and only then calls the gateway, so concurrent callers that find the
//! token stale share a single fetch.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::payments::error::GatewayResult;

/// A token as returned by the token endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    /// Real expiry minus the safety margin
    refresh_after: DateTime<Utc>,
}

pub struct AccessTokenCache {
    current: RwLock<Option<CachedToken>>,
    refresh_gate: Mutex<()>,
    safety_margin: Duration,
}

impl AccessTokenCache {
    pub fn new(safety_margin: Duration) -> Self {
        Self {
            current: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            safety_margin,
        }
    }

    /// Return a fresh token, fetching one with `fetch` when the cache is empty or stale.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> GatewayResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<FetchedToken>>,
    {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let _gate = self.refresh_gate.lock().await;

        // Another caller may have refreshed while we waited on the gate.
        if let Some(token) = self.fresh_token().await {
            debug!("access token refreshed by concurrent caller");
            return Ok(token);
        }

        let fetched = fetch().await?;
        let lifetime = ChronoDuration::from_std(fetched.expires_in.saturating_sub(self.safety_margin))
            .unwrap_or_else(|_| ChronoDuration::zero());
        let cached = CachedToken {
            value: fetched.access_token.clone(),
            refresh_after: Utc::now() + lifetime,
        };
        info!(
            expires_in_secs = fetched.expires_in.as_secs(),
            "gateway access token refreshed"
        );
        *self.current.write().await = Some(cached);

        Ok(fetched.access_token)
    }

    /// Drop `rejected` from the cache. A newer token cached by another caller is kept.
    pub async fn invalidate(&self, rejected: &str) {
        let mut current = self.current.write().await;
        if current.as_ref().map(|t| t.value.as_str()) == Some(rejected) {
            debug!("invalidating rejected access token");
            *current = None;
        }
    }

    async fn fresh_token(&self) -> Option<String> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|t| Utc::now() < t.refresh_after)
            .map(|t| t.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::error::GatewayError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn token(value: &str, secs: u64) -> FetchedToken {
        FetchedToken {
            access_token: value.to_string(),
            expires_in: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn caches_until_invalidated() {
        let cache = AccessTokenCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let t = cache
                .get_or_refresh(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(token("tok-1", 3599))
                })
                .await
                .unwrap();
            assert_eq!(t, "tok-1");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.invalidate("tok-1").await;
        let t = cache
            .get_or_refresh(|| async { Ok(token("tok-2", 3599)) })
            .await
            .unwrap();
        assert_eq!(t, "tok-2");
    }

    #[tokio::test]
    async fn token_inside_safety_margin_is_refetched() {
        let cache = AccessTokenCache::new(Duration::from_secs(60));
        cache
            .get_or_refresh(|| async { Ok(token("short", 30)) })
            .await
            .unwrap();
        let t = cache
            .get_or_refresh(|| async { Ok(token("long", 3599)) })
            .await
            .unwrap();
        assert_eq!(t, "long");
    }

    #[tokio::test]
    async fn invalidate_ignores_stale_value() {
        let cache = AccessTokenCache::new(Duration::from_secs(60));
        cache
            .get_or_refresh(|| async { Ok(token("current", 3599)) })
            .await
            .unwrap();
        cache.invalidate("older").await;
        let t = cache
            .get_or_refresh(|| async { Ok(token("unexpected", 3599)) })
            .await
            .unwrap();
        assert_eq!(t, "current");
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let cache = AccessTokenCache::new(Duration::from_secs(60));
        let err = cache
            .get_or_refresh(|| async {
                Err(GatewayError::Auth {
                    message: "bad credentials".to_string(),
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Auth { .. }));

        let t = cache
            .get_or_refresh(|| async { Ok(token("ok", 3599)) })
            .await
            .unwrap();
        assert_eq!(t, "ok");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let cache = Arc::new(AccessTokenCache::new(Duration::from_secs(60)));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_refresh(|| async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(token("shared", 3599))
                        })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            assert_eq!(result.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
