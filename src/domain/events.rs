//! Domain Events
//!
//! Immutable records of admissions, rejections and cache invalidations,
//! published for audit trails.
//!
//! # Example
//!
//! ```ignore
//! let event = DomainEvent::order_created(order_id, user_id, voucher_id);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::model::{OrderId, UserId, VoucherId};

/// Domain event representing a significant occurrence in the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    // =========================================================================
    // Seckill Events
    // =========================================================================
    /// An order was admitted and persisted.
    OrderCreated {
        order_id: i64,
        user_id: i64,
        voucher_id: i64,
        timestamp: DateTime<Utc>,
    },

    /// A seckill request was turned away by a business rule.
    OrderRejected {
        user_id: i64,
        voucher_id: i64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Cache Events
    // =========================================================================
    /// A cache key was deleted after its source row changed.
    CacheInvalidated { key: String, timestamp: DateTime<Utc> },
}

impl DomainEvent {
    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "OrderCreated",
            DomainEvent::OrderRejected { .. } => "OrderRejected",
            DomainEvent::CacheInvalidated { .. } => "CacheInvalidated",
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::OrderCreated { timestamp, .. }
            | DomainEvent::OrderRejected { timestamp, .. }
            | DomainEvent::CacheInvalidated { timestamp, .. } => *timestamp,
        }
    }

    pub fn order_created(order_id: OrderId, user_id: UserId, voucher_id: VoucherId) -> Self {
        DomainEvent::OrderCreated {
            order_id: order_id.value(),
            user_id: user_id.value(),
            voucher_id: voucher_id.value(),
            timestamp: Utc::now(),
        }
    }

    pub fn order_rejected(user_id: UserId, voucher_id: VoucherId, reason: impl Into<String>) -> Self {
        DomainEvent::OrderRejected {
            user_id: user_id.value(),
            voucher_id: voucher_id.value(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn cache_invalidated(key: impl Into<String>) -> Self {
        DomainEvent::CacheInvalidated {
            key: key.into(),
            timestamp: Utc::now(),
        }
    }
}
