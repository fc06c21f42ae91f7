//! Prometheus Metrics
//!
//! Counters for the read path, the locks and the admission pipeline, kept on
//! a registry owned by this crate so several guards (or tests) can coexist
//! in one process.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};

/// How a cache lookup was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// Existence filter ruled the key out
    FilterReject,
    /// Served from cache
    Hit,
    /// Served a cached "does not exist" marker
    NegativeHit,
    /// Served stale data while a background refresh runs
    Stale,
    /// Not in cache
    Miss,
}

impl LookupOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupOutcome::FilterReject => "filter_reject",
            LookupOutcome::Hit => "hit",
            LookupOutcome::NegativeHit => "negative_hit",
            LookupOutcome::Stale => "stale",
            LookupOutcome::Miss => "miss",
        }
    }
}

/// Metrics shared by the cache guard and the admission pipeline.
#[derive(Clone)]
pub struct GuardMetrics {
    registry: Registry,
    cache_lookups: IntCounterVec,
    cache_rebuilds: IntCounter,
    lock_contention: IntCounterVec,
    lock_timeouts: IntCounterVec,
    seckill_requests: IntCounterVec,
    ids_issued: IntCounterVec,
}

impl GuardMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("flashguard".to_string()), None)?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("cache_lookups_total", "Cache lookups by outcome"),
            &["outcome"],
        )?;
        let cache_rebuilds = IntCounter::new(
            "cache_rebuilds_total",
            "Cache entries rebuilt from the store",
        )?;
        let lock_contention = IntCounterVec::new(
            Opts::new("lock_contention_total", "Failed lock attempts by lock kind"),
            &["lock"],
        )?;
        let lock_timeouts = IntCounterVec::new(
            Opts::new("lock_timeouts_total", "Retry budgets exhausted by lock kind"),
            &["lock"],
        )?;
        let seckill_requests = IntCounterVec::new(
            Opts::new("seckill_requests_total", "Seckill requests by outcome"),
            &["outcome"],
        )?;
        let ids_issued = IntCounterVec::new(
            Opts::new("ids_issued_total", "Identifiers issued by business key"),
            &["business_key"],
        )?;

        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cache_rebuilds.clone()))?;
        registry.register(Box::new(lock_contention.clone()))?;
        registry.register(Box::new(lock_timeouts.clone()))?;
        registry.register(Box::new(seckill_requests.clone()))?;
        registry.register(Box::new(ids_issued.clone()))?;

        Ok(Self {
            registry,
            cache_lookups,
            cache_rebuilds,
            lock_contention,
            lock_timeouts,
            seckill_requests,
            ids_issued,
        })
    }

    pub fn record_lookup(&self, outcome: LookupOutcome) {
        self.cache_lookups
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_rebuild(&self) {
        self.cache_rebuilds.inc();
    }

    pub fn record_lock_contention(&self, lock: &str) {
        self.lock_contention.with_label_values(&[lock]).inc();
    }

    pub fn record_lock_timeout(&self, lock: &str) {
        self.lock_timeouts.with_label_values(&[lock]).inc();
    }

    pub fn record_seckill(&self, outcome: &str) {
        self.seckill_requests.with_label_values(&[outcome]).inc();
    }

    pub fn record_id_issued(&self, business_key: &str) {
        self.ids_issued.with_label_values(&[business_key]).inc();
    }

    pub fn lookups(&self, outcome: LookupOutcome) -> u64 {
        self.cache_lookups
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    pub fn rebuilds(&self) -> u64 {
        self.cache_rebuilds.get()
    }

    pub fn seckill_outcomes(&self, outcome: &str) -> u64 {
        self.seckill_requests.with_label_values(&[outcome]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format, for a `/metrics` endpoint.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

impl std::fmt::Debug for GuardMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardMetrics")
            .field("rebuilds", &self.rebuilds())
            .finish()
    }
}
