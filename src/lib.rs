//! Flashguard - Cache Guard and Flash-Sale Admission Control
//!
//! Keeps a relational store alive under two kinds of load: read storms on
//! hot or nonexistent shop ids, and purchase bursts on limited-stock
//! vouchers.
//!
//! # Architecture
//!
//! ```text
//!   reads ──▶ ExistenceFilter ──▶ CacheStore ──▶ RebuildMutex ──▶ Repository
//!
//!   orders ─▶ SeckillPipeline ─▶ per-user lock ─▶ VoucherTransaction
//!                                                      │
//!                                                 IdGenerator
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - In-memory and Redis implementations of the ports
//! - [`cache`] - Existence filter, rebuild mutex and the cache-aside reader
//! - [`config`] - YAML configuration
//! - [`domain`] - Entities, ports and events
//! - [`error`] - Error types
//! - [`idgen`] - Time-ordered distributed ids
//! - [`metrics`] - Prometheus counters
//! - [`seckill`] - Flash-sale admission pipeline

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod idgen;
pub mod metrics;
pub mod seckill;

// Re-export commonly used types
pub use cache::{CacheAside, ExistenceFilter, RebuildMutex, RetryPolicy};
pub use config::GuardConfig;
pub use error::{Error, Result};
pub use idgen::IdGenerator;
pub use metrics::GuardMetrics;
pub use seckill::{RejectReason, SeckillOutcome, SeckillPipeline};
