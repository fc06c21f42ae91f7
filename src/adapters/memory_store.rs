//! In-Memory Relational Store
//!
//! Implements the repository ports over plain tables guarded by
//! `parking_lot` locks.
//!
//! Stock decrements behave like a row-locked conditional UPDATE: the first
//! decrement of a voucher takes that voucher's row lock and holds it until
//! commit, rollback or drop. The decrement stays private to the transaction
//! until commit, so readers only ever see committed stock. A second
//! transaction decrementing the same voucher waits for the row lock and
//! then sees the outcome of the first.
//!
//! Orders are inserted eagerly with an undo log. The (user, voucher) pair
//! is a unique key on the order table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::domain::model::{
    OrderId, SeckillVoucher, Shop, ShopType, UserId, VoucherId, VoucherOrder,
};
use crate::domain::ports::{Repository, ShopTypeRepository, VoucherRepository, VoucherTransaction};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct SeckillTables {
    vouchers: HashMap<VoucherId, SeckillVoucher>,
    orders: HashMap<OrderId, VoucherOrder>,
    order_keys: HashSet<(UserId, VoucherId)>,
    row_locks: HashMap<VoucherId, Arc<tokio::sync::Mutex<()>>>,
}

#[derive(Debug, Default)]
struct Inner {
    shops: RwLock<BTreeMap<i64, Shop>>,
    shop_types: RwLock<Vec<ShopType>>,
    seckill: Mutex<SeckillTables>,
    shop_reads: AtomicU64,
    type_reads: AtomicU64,
    read_delay_ms: AtomicU64,
    unavailable: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::Storage("database unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory database shared by clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<Inner>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Seeding
    // =========================================================================

    pub fn insert_shop(&self, shop: Shop) {
        self.inner.shops.write().insert(shop.id.value(), shop);
    }

    pub fn insert_shop_type(&self, shop_type: ShopType) {
        self.inner.shop_types.write().push(shop_type);
    }

    pub fn insert_voucher(&self, voucher: SeckillVoucher) {
        self.inner
            .seckill
            .lock()
            .vouchers
            .insert(voucher.voucher_id, voucher);
    }

    // =========================================================================
    // Simulation knobs
    // =========================================================================

    /// Delay every shop and shop-type read, to widen race windows.
    pub fn set_read_delay(&self, delay: Duration) {
        self.inner
            .read_delay_ms
            .store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Simulate an outage: every operation fails with [`Error::Storage`].
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Number of `get_by_id` calls served for shops.
    pub fn shop_reads(&self) -> u64 {
        self.inner.shop_reads.load(Ordering::SeqCst)
    }

    /// Number of shop-type list queries served.
    pub fn shop_type_reads(&self) -> u64 {
        self.inner.type_reads.load(Ordering::SeqCst)
    }

    /// Committed stock of a voucher.
    pub fn voucher_stock(&self, voucher_id: VoucherId) -> Option<i32> {
        self.inner
            .seckill
            .lock()
            .vouchers
            .get(&voucher_id)
            .map(|v| v.stock)
    }

    pub fn orders(&self) -> Vec<VoucherOrder> {
        let mut orders: Vec<_> = self.inner.seckill.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    async fn simulate_latency(&self) {
        let delay = self.inner.read_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

#[async_trait]
impl Repository<Shop> for InMemoryDatabase {
    async fn get_by_id(&self, id: i64) -> Result<Option<Shop>> {
        self.inner.check_available()?;
        self.inner.shop_reads.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        Ok(self.inner.shops.read().get(&id).cloned())
    }

    async fn update_by_id(&self, entity: &Shop) -> Result<bool> {
        self.inner.check_available()?;
        let mut shops = self.inner.shops.write();
        match shops.get_mut(&entity.id.value()) {
            Some(row) => {
                *row = entity.clone();
                row.update_time = chrono::Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_ids(&self) -> Result<Vec<i64>> {
        self.inner.check_available()?;
        Ok(self.inner.shops.read().keys().copied().collect())
    }
}

#[async_trait]
impl ShopTypeRepository for InMemoryDatabase {
    async fn list_ordered(&self) -> Result<Vec<ShopType>> {
        self.inner.check_available()?;
        self.inner.type_reads.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        let mut types = self.inner.shop_types.read().clone();
        types.sort_by_key(|t| t.sort);
        Ok(types)
    }
}

#[async_trait]
impl VoucherRepository for InMemoryDatabase {
    async fn get_voucher(&self, voucher_id: VoucherId) -> Result<Option<SeckillVoucher>> {
        self.inner.check_available()?;
        Ok(self.inner.seckill.lock().vouchers.get(&voucher_id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn VoucherTransaction>> {
        self.inner.check_available()?;
        Ok(Box::new(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            undo: Vec::new(),
            pending_stock: HashMap::new(),
            row_guards: HashMap::new(),
            finished: false,
        }))
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug)]
struct RemoveOrder {
    order_id: OrderId,
    user_id: UserId,
    voucher_id: VoucherId,
}

/// Transaction over the seckill tables.
///
/// Row locks taken by `decrement_stock` are released when the transaction
/// is committed, rolled back or dropped.
#[derive(Debug)]
pub struct InMemoryTransaction {
    inner: Arc<Inner>,
    undo: Vec<RemoveOrder>,
    /// Uncommitted decrements per voucher
    pending_stock: HashMap<VoucherId, i32>,
    row_guards: HashMap<VoucherId, OwnedMutexGuard<()>>,
    finished: bool,
}

impl InMemoryTransaction {
    async fn lock_row(&mut self, voucher_id: VoucherId) -> bool {
        if self.row_guards.contains_key(&voucher_id) {
            return true;
        }
        let row = {
            let mut tables = self.inner.seckill.lock();
            if !tables.vouchers.contains_key(&voucher_id) {
                return false;
            }
            Arc::clone(tables.row_locks.entry(voucher_id).or_default())
        };
        let guard = row.lock_owned().await;
        self.row_guards.insert(voucher_id, guard);
        true
    }

    fn undo_all(&mut self) {
        self.pending_stock.clear();
        if !self.undo.is_empty() {
            let mut tables = self.inner.seckill.lock();
            for step in self.undo.drain(..).rev() {
                tables.orders.remove(&step.order_id);
                tables.order_keys.remove(&(step.user_id, step.voucher_id));
            }
        }
        self.row_guards.clear();
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(
                orders = self.undo.len(),
                rows = self.row_guards.len(),
                "Transaction dropped without commit, rolling back"
            );
            self.undo_all();
        }
    }
}

#[async_trait]
impl VoucherTransaction for InMemoryTransaction {
    async fn count_orders(&mut self, user_id: UserId, voucher_id: VoucherId) -> Result<u64> {
        self.inner.check_available()?;
        let tables = self.inner.seckill.lock();
        Ok(tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id && o.voucher_id == voucher_id)
            .count() as u64)
    }

    async fn decrement_stock(&mut self, voucher_id: VoucherId) -> Result<u64> {
        self.inner.check_available()?;
        if !self.lock_row(voucher_id).await {
            return Ok(0);
        }

        let committed = self.inner.seckill.lock().vouchers.get(&voucher_id).map(|v| v.stock);
        let pending = self.pending_stock.entry(voucher_id).or_insert(0);
        match committed {
            Some(stock) if stock - *pending > 0 => {
                *pending += 1;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn insert_order(&mut self, order: &VoucherOrder) -> Result<()> {
        self.inner.check_available()?;
        let mut tables = self.inner.seckill.lock();

        // Primary key clash means the id allocator misbehaved, not the user
        if tables.orders.contains_key(&order.id) {
            return Err(Error::Internal(format!("order id {} already allocated", order.id)));
        }
        if !tables.order_keys.insert((order.user_id, order.voucher_id)) {
            return Err(Error::Conflict(format!(
                "user {} already holds an order for voucher {}",
                order.user_id, order.voucher_id
            )));
        }
        tables.orders.insert(order.id, order.clone());
        self.undo.push(RemoveOrder {
            order_id: order.id,
            user_id: order.user_id,
            voucher_id: order.voucher_id,
        });
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.inner.check_available()?;
        let pending: Vec<_> = tx.pending_stock.drain().collect();
        {
            let mut tables = tx.inner.seckill.lock();
            for (voucher_id, taken) in pending {
                if let Some(voucher) = tables.vouchers.get_mut(&voucher_id) {
                    voucher.stock -= taken;
                }
            }
        }
        tx.undo.clear();
        tx.row_guards.clear();
        tx.finished = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut tx = self;
        tx.undo_all();
        tx.finished = true;
        Ok(())
    }
}
