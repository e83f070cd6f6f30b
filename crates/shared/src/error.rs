//! 统一错误处理模块
//!
//! 定义积分服务共享的基础设施错误类型，使用 thiserror 提供良好的错误信息。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("无效的参数: {field} - {message}")]
    InvalidArgument { field: String, message: String },
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;
