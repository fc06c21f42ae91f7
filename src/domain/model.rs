//! Domain Model
//!
//! Identifiers are value objects; entities serialize with camelCase field
//! names so cached JSON stays readable by the other services sharing the
//! cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Value Objects
// =============================================================================

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn new(id: i64) -> Self {
                Self(id)
            }

            pub fn value(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// Shop identifier.
    ShopId
);
id_type!(
    /// User identifier, supplied by the identity provider.
    UserId
);
id_type!(
    /// Seckill voucher identifier.
    VoucherId
);
id_type!(
    /// Order identifier allocated by the id generator.
    OrderId
);

/// Request-scoped identity.
///
/// Carried explicitly through calls instead of living in a thread-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    user_id: UserId,
}

impl RequestContext {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Identity of the user issuing the current request.
    pub fn current_user_id(&self) -> UserId {
        self.user_id
    }
}

// =============================================================================
// Entities
// =============================================================================

/// Entities that can sit behind the cache-aside reader.
pub trait Entity:
    Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static
{
    /// Primary key used to build cache and lock keys.
    fn entity_id(&self) -> i64;
}

/// A shop listing, the entity protected by the cache-aside reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: ShopId,
    pub name: String,
    pub type_id: i64,
    #[serde(default)]
    pub images: String,
    #[serde(default)]
    pub area: String,
    pub address: String,
    pub x: f64,
    pub y: f64,
    pub avg_price: i64,
    pub sold: i32,
    pub comments: i32,
    pub score: i32,
    #[serde(default)]
    pub open_hours: String,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Shop {
    /// Minimal shop used by seeding and tests.
    pub fn new(id: impl Into<ShopId>, name: impl Into<String>, type_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            type_id,
            images: String::new(),
            area: String::new(),
            address: String::new(),
            x: 0.0,
            y: 0.0,
            avg_price: 0,
            sold: 0,
            comments: 0,
            score: 0,
            open_hours: String::new(),
            create_time: now,
            update_time: now,
        }
    }
}

impl Entity for Shop {
    fn entity_id(&self) -> i64 {
        self.id.value()
    }
}

/// Shop category shown on the home page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShopType {
    pub id: i64,
    pub name: String,
    pub icon: String,
    pub sort: i32,
}

/// Flash-sale voucher stock and its sale window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeckillVoucher {
    pub voucher_id: VoucherId,
    pub stock: i32,
    pub begin_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl SeckillVoucher {
    pub fn new(
        voucher_id: impl Into<VoucherId>,
        stock: i32,
        begin_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            voucher_id: voucher_id.into(),
            stock,
            begin_time,
            end_time,
        }
    }

    pub fn not_started(&self, now: DateTime<Utc>) -> bool {
        self.begin_time > now
    }

    pub fn ended(&self, now: DateTime<Utc>) -> bool {
        self.end_time < now
    }
}

/// Payment state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Unpaid,
    Paid,
    Used,
    Cancelled,
    Refunding,
    Refunded,
}

/// Voucher order. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoucherOrder {
    pub id: OrderId,
    pub user_id: UserId,
    pub voucher_id: VoucherId,
    pub status: OrderStatus,
    pub create_time: DateTime<Utc>,
}

impl VoucherOrder {
    pub fn new(id: OrderId, user_id: UserId, voucher_id: VoucherId) -> Self {
        Self {
            id,
            user_id,
            voucher_id,
            status: OrderStatus::Unpaid,
            create_time: Utc::now(),
        }
    }
}
