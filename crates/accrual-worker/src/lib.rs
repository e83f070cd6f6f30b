//! 积分对账 Worker
//!
//! 周期性领取待处理订单，向外部积分计算服务查询结果，
//! 并在同一事务内更新订单状态与用户余额。
//!
//! ## 流水线
//!
//! ```text
//! ticker -> Claimer -> [claimed batch] -> Fetcher -> [resolved] -> Persister -> PostgreSQL
//!                                           |
//!                                     RateLimitGate (429 Retry-After)
//! ```

pub mod client;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod repository;
pub mod worker;

pub use client::{AccrualApi, AccrualClient, RateLimitGate};
pub use error::{AccrualError, Result};
pub use models::{AccrualReport, AccrualStatus, Balance, Order, OrderStatus, ResolvedOrder};
pub use repository::{BalanceStore, OrderStore, PgOrderStore};
pub use worker::{AccrualWorker, WorkerSettings, WorkerState};
