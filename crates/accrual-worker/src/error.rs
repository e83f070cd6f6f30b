//! 对账 Worker 专用错误类型
//!
//! 在共享库 LoyaltyError 基础上按处理阶段划分错误：
//! 领取无数据、查询失败（大多可重试）、写入冲突，以及透传的基础设施错误。

use std::time::Duration;

use loyalty_shared::error::LoyaltyError;
use uuid::Uuid;

/// 对账处理错误
#[derive(Debug, thiserror::Error)]
pub enum AccrualError {
    // ==================== 领取阶段 ====================
    /// 没有处于 NEW/PROCESSING 的订单，本轮跳过
    #[error("没有待处理的订单")]
    NoOrdersAvailable,

    // ==================== 查询阶段 ====================
    /// 收到 429，或在冷却期内被本地拒绝
    #[error("积分服务限流中，剩余 {}ms", retry_after.as_millis())]
    RateLimited { retry_after: Duration },

    /// 204：积分服务尚未登记该订单
    #[error("订单尚未在积分服务登记: {number}")]
    NotRegistered { number: String },

    #[error("积分服务返回非预期状态码: {status}")]
    UnexpectedStatus { status: u16 },

    /// 网络错误或单次请求超时
    #[error("积分服务请求失败: {0}")]
    Http(#[from] reqwest::Error),

    #[error("积分服务响应无法解析: {0}")]
    MalformedResponse(String),

    /// 等待冷却或发起请求前收到了关闭信号
    #[error("对账已取消")]
    Cancelled,

    // ==================== 写入阶段 ====================
    /// 订单不存在或已不在 PROCESSING 状态
    #[error("订单状态未更新: order_id={order_id}")]
    OrderNotUpdated { order_id: Uuid },

    #[error("用户余额未更新: user_id={user_id}")]
    BalanceNotUpdated { user_id: Uuid },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] LoyaltyError),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, AccrualError>;

impl AccrualError {
    /// 查询阶段可重试的错误
    ///
    /// 204 不重试：同一轮内再次查询也不会有结果，留给下一轮领取。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::UnexpectedStatus { .. }
                | Self::Http(_)
                | Self::MalformedResponse(_)
        )
    }

    /// 领取时没有可处理的订单
    pub fn is_no_work(&self) -> bool {
        matches!(self, Self::NoOrdersAvailable)
    }

    /// 写入冲突：事务已回滚，订单保持 PROCESSING 等待下一轮
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::OrderNotUpdated { .. } | Self::BalanceNotUpdated { .. }
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}
