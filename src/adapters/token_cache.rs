use {
    crate::domain::{error::ChargeError, provider::AccessToken},
    std::{future::Future, time::Duration},
    tokio::{sync::Mutex, time::Instant},
};

const MIN_MARGIN: Duration = Duration::from_secs(30);

/// How long before expiry a token is refreshed: 10% of its lifetime, at least 30s.
pub fn refresh_margin(expires_in: Duration) -> Duration {
    (expires_in / 10).max(MIN_MARGIN)
}

struct CachedToken {
    token: AccessToken,
    refresh_at: Instant,
}

/// Single-slot token cache. The lock is held while fetching, so concurrent
/// callers wait for one refresh instead of stampeding the token endpoint.
#[derive(Default)]
pub struct TokenCache {
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> Result<AccessToken, ChargeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(AccessToken, Duration), ChargeError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.token.clone());
            }
        }

        let (token, expires_in) = fetch().await?;
        let refresh_at = Instant::now() + expires_in.saturating_sub(refresh_margin(expires_in));
        *slot = Some(CachedToken {
            token: token.clone(),
            refresh_at,
        });
        Ok(token)
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn margin_is_ten_percent_with_floor() {
        assert_eq!(refresh_margin(Duration::from_secs(3600)), Duration::from_secs(360));
        assert_eq!(refresh_margin(Duration::from_secs(60)), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_token_until_refresh_point() {
        let cache = TokenCache::new();
        let fetches = &AtomicUsize::new(0);
        let fetch = || async move {
            let n = fetches.fetch_add(1, Ordering::SeqCst);
            Ok((AccessToken::new(format!("t{n}")), Duration::from_secs(300)))
        };

        assert_eq!(cache.get_or_refresh(fetch).await.unwrap().secret(), "t0");
        tokio::time::advance(Duration::from_secs(200)).await;
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap().secret(), "t0");

        // 300s lifetime, 30s margin: refreshed from 270s on.
        tokio::time::advance(Duration::from_secs(75)).await;
        assert_eq!(cache.get_or_refresh(fetch).await.unwrap().secret(), "t1");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_empty() {
        let cache = TokenCache::new();
        let result = cache
            .get_or_refresh(|| async { Err(ChargeError::Authentication("bad secret".into())) })
            .await;
        assert!(matches!(result, Err(ChargeError::Authentication(_))));

        let token = cache
            .get_or_refresh(|| async { Ok((AccessToken::new("ok"), Duration::from_secs(60))) })
            .await
            .unwrap();
        assert_eq!(token.secret(), "ok");
    }
}
