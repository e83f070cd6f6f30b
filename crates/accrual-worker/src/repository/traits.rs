//! 仓储 Trait 定义
//!
//! 流水线各阶段只依赖这里的抽象，便于用 mock 或内存实现替换数据库

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Balance, Order, ResolvedOrder};

/// 订单仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// 在单个事务内领取最多 `limit` 个 NEW/PROCESSING 订单并标记为 PROCESSING
    ///
    /// 按 created_at 升序返回；`exclude` 中的订单不会被领取。
    /// 没有可领取的订单时返回 `AccrualError::NoOrdersAvailable`。
    async fn claim_batch(&self, limit: i64, exclude: &[Uuid]) -> Result<Vec<Order>>;

    /// 在单个事务内写入订单终态并为用户入账，返回入账的用户 ID
    async fn apply_accrual(&self, resolved: &ResolvedOrder) -> Result<Uuid>;
}

/// 余额仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>>;
}
