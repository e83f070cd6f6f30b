//! 订单、积分查询结果与余额的数据模型
//!
//! 金额在系统内部统一以最小货币单位（分）的 i64 表示，
//! 只在与外部积分服务交互的边界上与十进制主单位互相转换。

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AccrualError, Result};

/// 订单状态
///
/// NEW -> PROCESSING（领取）-> PROCESSED | INVALID（写入），终态不可回退
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }

    /// 是否允许从当前状态迁移到目标状态
    ///
    /// PROCESSING -> PROCESSING 合法：崩溃或放弃的批次会被重新领取。
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (Self::New | Self::Processing, Self::Processing) => true,
            (Self::Processing, Self::Processed | Self::Invalid) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    /// 业务订单号，全局唯一
    pub number: String,
    pub status: OrderStatus,
    /// 已发放积分（分）
    pub accrual: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 积分服务侧的订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    /// 已登记，尚未开始计算
    Registered,
    Processing,
    /// 不发放积分
    Invalid,
    /// 计算完成
    Processed,
}

impl AccrualStatus {
    /// 对应的本地终态；非终态返回 None
    pub fn terminal_status(self) -> Option<OrderStatus> {
        match self {
            Self::Processed => Some(OrderStatus::Processed),
            Self::Invalid => Some(OrderStatus::Invalid),
            Self::Registered | Self::Processing => None,
        }
    }
}

/// 积分服务 200 响应体
///
/// `accrual` 为主单位十进制数，可以是 JSON 数字或字符串；未计算完成时缺省。
#[derive(Debug, Clone, Deserialize)]
pub struct AccrualResponse {
    #[serde(default)]
    pub order: Option<String>,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

impl AccrualResponse {
    pub fn into_report(self) -> Result<AccrualReport> {
        let accrual = match self.accrual {
            Some(amount) => to_minor_units(amount)?,
            None => 0,
        };
        Ok(AccrualReport {
            status: self.status,
            accrual,
        })
    }
}

/// 单个订单的积分查询结果，金额已换算为分
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualReport {
    pub status: AccrualStatus,
    pub accrual: i64,
}

/// 主单位 -> 分，向零截断
///
/// 负数或超出 i64 范围的金额视为响应格式错误。
pub fn to_minor_units(amount: Decimal) -> Result<i64> {
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(AccrualError::MalformedResponse(format!(
            "积分金额为负数: {amount}"
        )));
    }
    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .map(|cents| cents.trunc())
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| AccrualError::MalformedResponse(format!("积分金额超出范围: {amount}")))
}

/// 分 -> 主单位
pub fn to_major_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// 已得到终态结果、等待写入的订单
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOrder {
    pub order_id: Uuid,
    pub number: String,
    /// PROCESSED 或 INVALID
    pub status: OrderStatus,
    /// INVALID 时恒为 0
    pub accrual: i64,
}

impl ResolvedOrder {
    /// 根据查询结果构造写入对象；非终态返回 None
    pub fn from_report(order: &Order, report: AccrualReport) -> Option<Self> {
        let status = report.status.terminal_status()?;
        let accrual = match status {
            OrderStatus::Processed => report.accrual,
            _ => 0,
        };
        Some(Self {
            order_id: order.id,
            number: order.number.clone(),
            status,
            accrual,
        })
    }
}

/// 用户余额
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Balance {
    pub user_id: Uuid,
    /// 当前可用余额（分）
    pub current: i64,
    /// 累计提现（分）
    pub withdrawn: i64,
}

impl Balance {
    pub fn current_major(&self) -> Decimal {
        to_major_units(self.current)
    }

    pub fn withdrawn_major(&self) -> Decimal {
        to_major_units(self.withdrawn)
    }
}
