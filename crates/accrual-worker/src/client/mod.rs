//! 外部积分计算服务客户端
//!
//! 通过 AccrualApi trait 抽象单次 HTTP 查询，便于测试时注入 mock 实现；
//! 重试与等待冷却由流水线的 Fetcher 负责。

mod accrual_client;
mod rate_limit;

pub use accrual_client::{AccrualApi, AccrualClient, parse_retry_after};
#[cfg(test)]
pub use accrual_client::MockAccrualApi;
pub use rate_limit::RateLimitGate;
