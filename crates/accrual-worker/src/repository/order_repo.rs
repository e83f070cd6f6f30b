//! 订单仓储实现
//!
//! 领取使用 `FOR UPDATE SKIP LOCKED`：多个 Worker 实例并发领取时，
//! 已被锁定的行直接跳过，两个事务不会拿到同一个订单。

use async_trait::async_trait;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::traits::{BalanceStore, OrderStore};
use crate::error::{AccrualError, Result};
use crate::models::{Balance, Order, ResolvedOrder};

/// 基于 PostgreSQL 的订单与余额仓储
#[derive(Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 在调用方事务内领取订单
    ///
    /// RETURNING 不保证顺序，因此结果在内存中按 created_at 重新排序。
    pub async fn claim_batch_in_tx(
        tx: &mut PgConnection,
        limit: i64,
        exclude: &[Uuid],
    ) -> Result<Vec<Order>> {
        let mut orders = sqlx::query_as::<_, Order>(
            r#"
            UPDATE orders
            SET status = 'PROCESSING', updated_at = NOW()
            FROM (
                SELECT id
                FROM orders
                WHERE status IN ('NEW', 'PROCESSING')
                  AND NOT (id = ANY($2))
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) AS claimed
            WHERE orders.id = claimed.id
            RETURNING orders.id, orders.user_id, orders.number, orders.status,
                      orders.accrual, orders.created_at, orders.updated_at
            "#,
        )
        .bind(limit)
        .bind(exclude)
        .fetch_all(&mut *tx)
        .await?;

        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    /// 在调用方事务内写入订单终态，返回订单所属用户
    ///
    /// 仅更新仍处于 PROCESSING 的订单，防止同一订单被两次入账。
    pub async fn update_order_in_tx(
        tx: &mut PgConnection,
        resolved: &ResolvedOrder,
    ) -> Result<Uuid> {
        let user_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'PROCESSING'
            RETURNING user_id
            "#,
        )
        .bind(resolved.order_id)
        .bind(resolved.status)
        .bind(resolved.accrual)
        .fetch_optional(&mut *tx)
        .await?;

        user_id.ok_or(AccrualError::OrderNotUpdated {
            order_id: resolved.order_id,
        })
    }

    /// 在调用方事务内为用户入账
    pub async fn credit_balance_in_tx(
        tx: &mut PgConnection,
        user_id: Uuid,
        amount: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET current_balance = current_balance + $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AccrualError::BalanceNotUpdated { user_id });
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    #[instrument(skip(self, exclude), fields(excluded = exclude.len()))]
    async fn claim_batch(&self, limit: i64, exclude: &[Uuid]) -> Result<Vec<Order>> {
        let mut tx = self.pool.begin().await?;
        let orders = Self::claim_batch_in_tx(&mut tx, limit, exclude).await?;
        tx.commit().await?;

        if orders.is_empty() {
            return Err(AccrualError::NoOrdersAvailable);
        }
        debug!(count = orders.len(), "订单领取完成");
        Ok(orders)
    }

    #[instrument(skip(self, resolved), fields(order_id = %resolved.order_id, status = %resolved.status))]
    async fn apply_accrual(&self, resolved: &ResolvedOrder) -> Result<Uuid> {
        // 任一步失败时 tx 被 drop，事务自动回滚
        let mut tx = self.pool.begin().await?;

        let user_id = Self::update_order_in_tx(&mut tx, resolved).await?;
        Self::credit_balance_in_tx(&mut tx, user_id, resolved.accrual).await?;

        tx.commit().await?;
        Ok(user_id)
    }
}

#[async_trait]
impl BalanceStore for PgOrderStore {
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>> {
        let balance = sqlx::query_as::<_, Balance>(
            r#"
            SELECT u.id AS user_id,
                   u.current_balance AS current,
                   COALESCE(
                       (SELECT SUM(w.withdrawn) FROM withdrawals w WHERE w.user_id = u.id),
                       0
                   )::BIGINT AS withdrawn
            FROM users u
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }
}
