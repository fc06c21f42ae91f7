//! Per-user exclusion for the admission pipeline.
//!
//! `Local` serializes requests of one user inside this process with one
//! async mutex per user. `Distributed` uses a token lock in the shared cache
//! under `lock:order:{userId}`, which also serializes across instances.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::cache::{LockToken, RebuildMutex, RetryPolicy};
use crate::domain::model::UserId;
use crate::domain::ports::CacheStore;
use crate::error::Result;

/// Prefix of distributed per-user lock keys
pub const LOCK_ORDER_KEY: &str = "lock:order:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum UserLockMode {
    /// One async mutex per user in this process
    #[default]
    Local,
    /// Token lock in the shared cache store
    Distributed,
}

pub(crate) enum UserLock {
    Local(DashMap<UserId, Arc<Mutex<()>>>),
    Distributed {
        mutex: RebuildMutex,
        ttl: Duration,
        retry: RetryPolicy,
    },
}

/// Held while a user's order is being created.
pub(crate) enum UserGuard {
    Local {
        user_id: UserId,
        guard: OwnedMutexGuard<()>,
    },
    Distributed(LockToken),
}

impl UserLock {
    pub(crate) fn local() -> Self {
        UserLock::Local(DashMap::new())
    }

    pub(crate) fn distributed(
        store: Arc<dyn CacheStore>,
        ttl: Duration,
        retry: RetryPolicy,
    ) -> Self {
        UserLock::Distributed {
            mutex: RebuildMutex::new(store),
            ttl,
            retry,
        }
    }

    pub(crate) async fn acquire(&self, user_id: UserId) -> Result<UserGuard> {
        match self {
            UserLock::Local(locks) => {
                // Clone the Arc out so the shard lock is not held across the await
                let lock = locks.entry(user_id).or_default().clone();
                let guard = lock.lock_owned().await;
                Ok(UserGuard::Local { user_id, guard })
            }
            UserLock::Distributed { mutex, ttl, retry } => {
                let key = format!("{}{}", LOCK_ORDER_KEY, user_id);
                let token = mutex.acquire(&key, *ttl, retry).await?;
                Ok(UserGuard::Distributed(token))
            }
        }
    }

    pub(crate) async fn release(&self, guard: UserGuard) {
        match (self, guard) {
            (UserLock::Local(locks), UserGuard::Local { user_id, guard }) => {
                drop(guard);
                // Only the map still references an idle lock
                locks.remove_if(&user_id, |_, lock| Arc::strong_count(lock) == 1);
            }
            (UserLock::Distributed { mutex, .. }, UserGuard::Distributed(token)) => {
                if let Err(e) = mutex.release(token).await {
                    warn!(error = %e, "Failed to release user lock");
                }
            }
            _ => warn!("User guard does not match lock mode"),
        }
    }

    /// Number of users with a live local lock.
    #[cfg(test)]
    pub(crate) fn local_len(&self) -> usize {
        match self {
            UserLock::Local(locks) => locks.len(),
            UserLock::Distributed { .. } => 0,
        }
    }
}
