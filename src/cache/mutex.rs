//! Rebuild Mutex
//!
//! Per-key exclusion stored in the shared cache: `SET key token NX PX ttl`
//! to acquire, compare-and-delete to release. The token is a fresh random
//! uuid per acquisition, so a holder whose lock already expired cannot
//! delete the lock of whoever acquired it next.
//!
//! The TTL bounds how long a crashed holder can block others.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::domain::ports::CacheStore;
use crate::error::{Error, Result};

/// Proof of holding a lock. Pass it back to [`RebuildMutex::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a lock that is never released only frees up after its TTL"]
pub struct LockToken {
    key: String,
    token: String,
}

impl LockToken {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Bounded retry with jittered backoff
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up with `LockTimeout` (at least 1)
    pub max_attempts: u32,
    /// Sleep between attempts
    pub base_delay: Duration,
    /// Upper bound of the random extra sleep added to `base_delay`
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            base_delay: Duration::from_millis(50),
            jitter: Duration::from_millis(25),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after a failed attempt.
    pub fn backoff(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.base_delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.base_delay + Duration::from_millis(extra)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Token-guarded mutex over a [`CacheStore`].
#[derive(Clone)]
pub struct RebuildMutex {
    store: Arc<dyn CacheStore>,
}

impl RebuildMutex {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Single non-blocking attempt.
    pub async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = uuid::Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &token, ttl).await? {
            debug!(key = %key, "Lock acquired");
            Ok(Some(LockToken {
                key: key.to_string(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Retry `try_acquire` under `policy`, failing with [`Error::LockTimeout`].
    pub async fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        policy: &RetryPolicy,
    ) -> Result<LockToken> {
        for attempt in 1..=policy.max_attempts {
            if let Some(token) = self.try_acquire(key, ttl).await? {
                return Ok(token);
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff()).await;
            }
        }
        Err(Error::LockTimeout {
            key: key.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Release if still held by `token`.
    ///
    /// Returns `false` when the lock had expired and possibly been taken by
    /// someone else; in that case nothing is deleted.
    pub async fn release(&self, token: LockToken) -> Result<bool> {
        let released = self
            .store
            .delete_if_equals(&token.key, &token.token)
            .await?;
        if !released {
            warn!(key = %token.key, "Lock expired before release");
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryCacheStore;
    use assert_matches::assert_matches;

    fn mutex() -> (Arc<InMemoryCacheStore>, RebuildMutex) {
        let store = Arc::new(InMemoryCacheStore::new());
        (store.clone(), RebuildMutex::new(store))
    }

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let (_, mutex) = mutex();
        let ttl = Duration::from_secs(10);

        let token = mutex.try_acquire("lock:shop:1", ttl).await.unwrap();
        assert!(token.is_some());
        assert!(mutex.try_acquire("lock:shop:1", ttl).await.unwrap().is_none());

        // Different keys do not interfere
        assert!(mutex.try_acquire("lock:shop:2", ttl).await.unwrap().is_some());

        assert!(mutex.release(token.unwrap()).await.unwrap());
        assert!(mutex.try_acquire("lock:shop:1", ttl).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_cannot_release_new_holder() {
        let (store, mutex) = mutex();
        let ttl = Duration::from_secs(10);

        let stale = mutex.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;

        let current = mutex.try_acquire("lock:shop:1", ttl).await.unwrap().unwrap();
        assert_ne!(stale.token(), current.token());

        assert!(!mutex.release(stale).await.unwrap());
        assert_eq!(
            store.get("lock:shop:1").await.unwrap().as_deref(),
            Some(current.token())
        );

        assert!(mutex.release(current).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let (_, mutex) = mutex();
        let ttl = Duration::from_secs(60);
        let _held = mutex.try_acquire("lock:order:1", ttl).await.unwrap().unwrap();

        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            jitter: Duration::ZERO,
        };
        let result = mutex.acquire("lock:order:1", ttl, &policy).await;
        assert_matches!(result, Err(Error::LockTimeout { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_succeeds_after_expiry() {
        let (_, mutex) = mutex();
        let _held = mutex
            .try_acquire("lock:order:1", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            jitter: Duration::ZERO,
        };
        let token = mutex
            .acquire("lock:order:1", Duration::from_secs(10), &policy)
            .await
            .unwrap();
        assert_eq!(token.key(), "lock:order:1");
    }

    #[test]
    fn test_backoff_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy.backoff();
            assert!(delay >= policy.base_delay);
            assert!(delay <= policy.base_delay + policy.jitter);
        }
        assert!(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }
}
