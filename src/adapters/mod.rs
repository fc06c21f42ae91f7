//! Infrastructure Adapters
//!
//! Implementations of the domain ports.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  CacheStore │ Repository │ VoucherRepository │ EventPub.  │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryCacheStore │ RedisCacheStore (feature "redis")     │ │
//! │  │ InMemoryDatabase   │ LoggingEventPublisher                 │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use flashguard::adapters::{InMemoryCacheStore, InMemoryDatabase};
//! use flashguard::domain::ports::CacheStore;
//!
//! let cache = InMemoryCacheStore::new();
//! cache.set("cache:shop:1", "{}", None).await?;
//! ```

mod event_publisher;
mod memory_cache;
mod memory_store;
#[cfg(feature = "redis")]
mod redis_cache;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory_cache::{CacheStoreStats, InMemoryCacheStore};
pub use memory_store::{InMemoryDatabase, InMemoryTransaction};
#[cfg(feature = "redis")]
pub use redis_cache::RedisCacheStore;
