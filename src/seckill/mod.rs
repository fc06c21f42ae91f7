//! Seckill Admission Pipeline
//!
//! Turns a burst of purchase attempts on a limited-stock voucher into at
//! most `stock` orders, at most one per user.
//!
//! # State machine
//!
//! ```text
//! Validate ──▶ CheckOneOrderPerUser ──▶ DecrementStock ──▶ CreateOrder ──▶ Done
//!    │                 │                      │                  │
//!    └─────────────────┴──────────────────────┴──────────────────┴──▶ Rejected(reason)
//! ```
//!
//! Validation runs without locks. The remaining steps run under a per-user
//! lock and inside one store transaction, so a failure at any point leaves
//! stock and orders as they were.

mod pipeline;
mod user_lock;

pub use pipeline::SeckillPipeline;
pub use user_lock::{UserLockMode, LOCK_ORDER_KEY};

use std::time::Duration;

use crate::cache::RetryPolicy;
use crate::domain::model::OrderId;
use crate::error::{Error, Result};

/// Why a seckill request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    VoucherNotFound,
    NotStarted,
    Ended,
    OutOfStock,
    AlreadyOrdered,
}

impl RejectReason {
    /// Stable label for metrics and events.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::VoucherNotFound => "voucher_not_found",
            RejectReason::NotStarted => "not_started",
            RejectReason::Ended => "ended",
            RejectReason::OutOfStock => "out_of_stock",
            RejectReason::AlreadyOrdered => "already_ordered",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::VoucherNotFound => write!(f, "voucher does not exist"),
            RejectReason::NotStarted => {
                write!(f, "voucher cannot be ordered now: sale has not started")
            }
            RejectReason::Ended => write!(f, "voucher cannot be ordered now: sale has ended"),
            RejectReason::OutOfStock => write!(f, "voucher cannot be ordered now: out of stock"),
            RejectReason::AlreadyOrdered => write!(f, "voucher already ordered by this user"),
        }
    }
}

/// Result of one seckill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeckillOutcome {
    Ordered(OrderId),
    Rejected(RejectReason),
}

impl SeckillOutcome {
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            SeckillOutcome::Ordered(id) => Some(*id),
            SeckillOutcome::Rejected(_) => None,
        }
    }

    pub fn is_ordered(&self) -> bool {
        matches!(self, SeckillOutcome::Ordered(_))
    }

    /// Label for metrics: `ordered` or the reject code.
    pub fn label(&self) -> &'static str {
        match self {
            SeckillOutcome::Ordered(_) => "ordered",
            SeckillOutcome::Rejected(reason) => reason.code(),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SeckillConfig {
    pub lock_mode: UserLockMode,
    /// TTL of the distributed per-user lock
    pub lock_ttl: Duration,
    /// Retry budget for the distributed per-user lock
    pub lock_retry: RetryPolicy,
    /// Business key handed to the id generator
    pub order_key: String,
}

impl Default for SeckillConfig {
    fn default() -> Self {
        Self {
            lock_mode: UserLockMode::Local,
            lock_ttl: Duration::from_secs(30),
            lock_retry: RetryPolicy {
                max_attempts: 40,
                ..RetryPolicy::default()
            },
            order_key: "order".to_string(),
        }
    }
}

impl SeckillConfig {
    pub fn validate(&self) -> Result<()> {
        self.lock_retry.validate()?;
        if self.lock_ttl.is_zero() {
            return Err(Error::Config("seckill lock_ttl must be non-zero".to_string()));
        }
        if self.order_key.is_empty() {
            return Err(Error::Config(
                "seckill order_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
