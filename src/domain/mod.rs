//! Domain Layer
//!
//! Entities, value objects, collaborator ports and domain events.
//!
//! - **Model** (`model.rs`) - Shops, vouchers, orders and their identifiers
//! - **Ports** (`ports.rs`) - Trait abstractions for the cache and relational stores
//! - **Events** (`events.rs`) - Domain events for audit trails

pub mod events;
pub mod model;
pub mod ports;

pub use events::DomainEvent;
pub use model::{
    Entity, OrderId, OrderStatus, RequestContext, SeckillVoucher, Shop, ShopId, ShopType, UserId,
    VoucherId, VoucherOrder,
};
pub use ports::{
    CacheStore, EventPublisher, Repository, ShopTypeRepository, VoucherRepository,
    VoucherTransaction,
};
