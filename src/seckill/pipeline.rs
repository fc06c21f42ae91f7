use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::user_lock::UserLock;
use super::{RejectReason, SeckillConfig, SeckillOutcome, UserLockMode};
use crate::domain::events::DomainEvent;
use crate::domain::model::{OrderId, RequestContext, UserId, VoucherId, VoucherOrder};
use crate::domain::ports::{CacheStore, EventPublisher, VoucherRepository, VoucherTransaction};
use crate::error::{Error, Result};
use crate::idgen::IdGenerator;
use crate::metrics::GuardMetrics;

/// Admission pipeline for flash-sale vouchers.
pub struct SeckillPipeline {
    vouchers: Arc<dyn VoucherRepository>,
    ids: IdGenerator,
    user_lock: UserLock,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<GuardMetrics>,
    order_key: String,
}

impl SeckillPipeline {
    /// `cache` backs the distributed user lock; it is unused in local mode.
    pub fn new(
        vouchers: Arc<dyn VoucherRepository>,
        cache: Arc<dyn CacheStore>,
        ids: IdGenerator,
        config: SeckillConfig,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<GuardMetrics>,
    ) -> Self {
        let user_lock = match config.lock_mode {
            UserLockMode::Local => UserLock::local(),
            UserLockMode::Distributed => {
                UserLock::distributed(cache, config.lock_ttl, config.lock_retry)
            }
        };
        Self {
            vouchers,
            ids,
            user_lock,
            events,
            metrics,
            order_key: config.order_key,
        }
    }

    /// Try to order one unit of `voucher_id` for the user in `ctx`.
    ///
    /// Business rejections come back as [`SeckillOutcome::Rejected`]. Errors
    /// are faults (store, cache, lock timeout) and leave stock untouched.
    #[instrument(skip(self, ctx), fields(user_id = %ctx.current_user_id()))]
    pub async fn seckill_voucher(
        &self,
        ctx: &RequestContext,
        voucher_id: VoucherId,
    ) -> Result<SeckillOutcome> {
        let user_id = ctx.current_user_id();
        let result = self.admit(user_id, voucher_id).await;

        match &result {
            Ok(outcome) => {
                self.metrics.record_seckill(outcome.label());
                self.publish(*outcome, user_id, voucher_id).await;
            }
            Err(Error::LockTimeout { .. }) => {
                self.metrics.record_lock_timeout("order");
                self.metrics.record_seckill("error");
            }
            Err(_) => self.metrics.record_seckill("error"),
        }
        result
    }

    async fn admit(&self, user_id: UserId, voucher_id: VoucherId) -> Result<SeckillOutcome> {
        // Cheap checks before any lock
        let Some(voucher) = self.vouchers.get_voucher(voucher_id).await? else {
            return Ok(SeckillOutcome::Rejected(RejectReason::VoucherNotFound));
        };
        let now = Utc::now();
        if voucher.not_started(now) {
            return Ok(SeckillOutcome::Rejected(RejectReason::NotStarted));
        }
        if voucher.ended(now) {
            return Ok(SeckillOutcome::Rejected(RejectReason::Ended));
        }
        if voucher.stock < 1 {
            return Ok(SeckillOutcome::Rejected(RejectReason::OutOfStock));
        }

        let guard = self.user_lock.acquire(user_id).await?;
        let result = self.create_order(user_id, voucher_id).await;
        self.user_lock.release(guard).await;
        result
    }

    /// One-order-per-user check, stock decrement and order insert in one
    /// transaction. Commits only when an order was created.
    async fn create_order(&self, user_id: UserId, voucher_id: VoucherId) -> Result<SeckillOutcome> {
        let mut tx = self.vouchers.begin().await?;

        match self.run_steps(tx.as_mut(), user_id, voucher_id).await {
            Ok(SeckillOutcome::Ordered(order_id)) => {
                tx.commit().await?;
                Ok(SeckillOutcome::Ordered(order_id))
            }
            Ok(rejected) => {
                tx.rollback().await?;
                Ok(rejected)
            }
            // Only the (user, voucher) unique key reports Conflict
            Err(Error::Conflict(detail)) => {
                debug!(detail = %detail, "Order insert hit uniqueness constraint");
                tx.rollback().await?;
                Ok(SeckillOutcome::Rejected(RejectReason::AlreadyOrdered))
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        tx: &mut dyn VoucherTransaction,
        user_id: UserId,
        voucher_id: VoucherId,
    ) -> Result<SeckillOutcome> {
        if tx.count_orders(user_id, voucher_id).await? > 0 {
            return Ok(SeckillOutcome::Rejected(RejectReason::AlreadyOrdered));
        }

        if tx.decrement_stock(voucher_id).await? == 0 {
            return Ok(SeckillOutcome::Rejected(RejectReason::OutOfStock));
        }

        let order_id = OrderId(self.ids.next_id(&self.order_key).await?);
        tx.insert_order(&VoucherOrder::new(order_id, user_id, voucher_id))
            .await?;
        Ok(SeckillOutcome::Ordered(order_id))
    }

    async fn publish(&self, outcome: SeckillOutcome, user_id: UserId, voucher_id: VoucherId) {
        let event = match outcome {
            SeckillOutcome::Ordered(order_id) => {
                info!(order_id = %order_id, voucher_id = %voucher_id, "Order created");
                DomainEvent::order_created(order_id, user_id, voucher_id)
            }
            SeckillOutcome::Rejected(reason) => {
                debug!(voucher_id = %voucher_id, reason = reason.code(), "Seckill rejected");
                DomainEvent::order_rejected(user_id, voucher_id, reason.code())
            }
        };
        if let Err(e) = self.events.publish(event).await {
            warn!(error = %e, "Failed to publish seckill event");
        }
    }
}
