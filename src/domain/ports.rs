//! Domain Ports (Port/Adapter Pattern)
//!
//! The cache guard and the admission pipeline only talk to their
//! collaborators through these traits. Adapters in [`crate::adapters`]
//! provide in-memory and Redis implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Core                                    │
//! │  CacheAside │ RebuildMutex │ IdGenerator │ SeckillPipeline  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Ports (Traits)                          │
//! │  CacheStore │ Repository │ VoucherRepository │ EventPublisher│
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;

use super::events::DomainEvent;
use super::model::{SeckillVoucher, ShopType, UserId, VoucherId, VoucherOrder};
use crate::error::Result;

// =============================================================================
// Cache Store Port
// =============================================================================

/// Port for the shared key/value cache (Redis in production).
///
/// Values are strings; callers own serialization.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, with an optional time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Atomically write the value only if the key is absent.
    ///
    /// Returns `true` if this call stored the value.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete a key unconditionally. Returns whether a key was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically delete the key only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Atomically increment the integer stored at `key`, starting from 0.
    async fn increment(&self, key: &str) -> Result<i64>;
}

// =============================================================================
// Relational Store Ports
// =============================================================================

/// Port for an entity table keyed by a 64-bit id.
#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn get_by_id(&self, id: i64) -> Result<Option<T>>;

    /// Overwrite the row for `entity`. Returns `false` if no row matched.
    async fn update_by_id(&self, entity: &T) -> Result<bool>;

    /// All known ids, used by the filter warm-up.
    async fn list_ids(&self) -> Result<Vec<i64>>;
}

/// Port for the shop category table.
#[async_trait]
pub trait ShopTypeRepository: Send + Sync {
    /// All shop types ordered by `sort` ascending.
    async fn list_ordered(&self) -> Result<Vec<ShopType>>;
}

/// Port for seckill voucher stock and voucher orders.
#[async_trait]
pub trait VoucherRepository: Send + Sync {
    /// Non-transactional read used for the cheap pre-checks.
    async fn get_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>>;

    /// Open a transaction over stock and orders.
    async fn begin(&self) -> Result<Box<dyn VoucherTransaction>>;
}

/// A unit of work over stock and orders.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait VoucherTransaction: Send {
    /// `select count(*) from voucher_order where user_id = ? and voucher_id = ?`
    async fn count_orders(&mut self, user_id: UserId, voucher_id: VoucherId) -> Result<u64>;

    /// `update seckill_voucher set stock = stock - 1 where voucher_id = ? and stock > 0`
    ///
    /// Returns the number of rows affected. Waits while another open
    /// transaction holds the voucher row, and hides the change from other
    /// readers until commit.
    async fn decrement_stock(&mut self, voucher_id: VoucherId) -> Result<u64>;

    /// Insert an order. A second order for the same (user, voucher) fails
    /// with [`crate::Error::Conflict`]. A reused order id is an
    /// [`crate::Error::Internal`] fault.
    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<()>;

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
