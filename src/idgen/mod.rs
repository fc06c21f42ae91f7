//! Distributed ID Generator
//!
//! 64-bit ids that sort by issue time without a central sequence table:
//!
//! ```text
//! ┌───────┬──────────────────────────────┬──────────────────────────────┐
//! │ sign  │ seconds since custom epoch   │ per-day sequence             │
//! │ 1 bit │ 31 bits                      │ 32 bits                      │
//! └───────┴──────────────────────────────┴──────────────────────────────┘
//! ```
//!
//! The sequence comes from an atomic counter in the shared cache store,
//! keyed by `{business_key}:{YYYY:MM:DD}`. A new day means a new counter key,
//! so the sequence restarts at 1 every day while the timestamp keeps ids
//! increasing.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::domain::ports::CacheStore;
use crate::error::{Error, Result};
use crate::metrics::GuardMetrics;

/// Custom epoch: 2022-01-01T00:00:00Z
pub const BEGIN_TIMESTAMP: i64 = 1_640_995_200;

/// Width of the sequence part
pub const COUNT_BITS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// Epoch in unix seconds. Changing it breaks ordering against
    /// previously issued ids.
    pub epoch_seconds: i64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            epoch_seconds: BEGIN_TIMESTAMP,
        }
    }
}

impl IdConfig {
    pub fn validate(&self) -> Result<()> {
        if Utc.timestamp_opt(self.epoch_seconds, 0).single().is_none() {
            return Err(Error::Config(format!(
                "id epoch_seconds out of range: {}",
                self.epoch_seconds
            )));
        }
        Ok(())
    }
}

/// Time-ordered id allocator backed by a [`CacheStore`] counter.
#[derive(Clone)]
pub struct IdGenerator {
    store: Arc<dyn CacheStore>,
    epoch_seconds: i64,
    metrics: Option<Arc<GuardMetrics>>,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            epoch_seconds: BEGIN_TIMESTAMP,
            metrics: None,
        }
    }

    pub fn with_config(store: Arc<dyn CacheStore>, config: &IdConfig) -> Self {
        Self {
            epoch_seconds: config.epoch_seconds,
            ..Self::new(store)
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<GuardMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Allocate the next id for `business_key`.
    pub async fn next_id(&self, business_key: &str) -> Result<i64> {
        self.next_id_at(business_key, Utc::now()).await
    }

    /// Allocate an id as if issued at `now`.
    pub async fn next_id_at(&self, business_key: &str, now: DateTime<Utc>) -> Result<i64> {
        let timestamp = now.timestamp() - self.epoch_seconds;
        if timestamp < 0 {
            return Err(Error::Internal(format!(
                "clock {} is before the id epoch",
                now
            )));
        }

        let counter_key = format!("{}:{}", business_key, now.format("%Y:%m:%d"));
        let count = self.store.increment(&counter_key).await?;
        if count <= 0 || count > u32::MAX as i64 {
            return Err(Error::Internal(format!(
                "sequence for '{}' out of range: {}",
                counter_key, count
            )));
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_id_issued(business_key);
        }
        let id = (timestamp << COUNT_BITS) | count;
        debug!(business_key, id, "Id issued");
        Ok(id)
    }

    /// Split an id into its issue time (second precision) and sequence.
    pub fn decompose(&self, id: i64) -> Option<(DateTime<Utc>, u32)> {
        let sequence = (id & u32::MAX as i64) as u32;
        let seconds = (id >> COUNT_BITS) + self.epoch_seconds;
        let issued = Utc.timestamp_opt(seconds, 0).single()?;
        Some((issued, sequence))
    }
}

impl std::fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerator")
            .field("epoch_seconds", &self.epoch_seconds)
            .finish()
    }
}
