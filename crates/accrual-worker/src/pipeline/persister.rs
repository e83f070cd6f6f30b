//! 写入阶段
//!
//! 每个订单一个事务：更新订单终态并为用户入账。单个订单失败只回滚它自己，
//! 批次中其余订单继续处理。

use std::sync::Arc;

use loyalty_shared::error::LoyaltyError;
use loyalty_shared::observability::metrics;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::in_flight::InFlightOrders;
use super::{cancelled, is_cancelled};
use crate::error::Result;
use crate::models::{OrderStatus, ResolvedOrder};
use crate::repository::OrderStore;

/// 单个批次的写入结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub committed: usize,
    pub failed: usize,
    /// 因关闭信号未处理的订单数
    pub skipped: usize,
}

pub struct Persister {
    store: Arc<dyn OrderStore>,
    in_flight: Arc<InFlightOrders>,
}

impl Persister {
    pub fn new(store: Arc<dyn OrderStore>, in_flight: Arc<InFlightOrders>) -> Self {
        Self { store, in_flight }
    }

    /// 写入单个订单，无论成败都从处理中集合注销
    pub async fn persist_order(&self, resolved: &ResolvedOrder) -> Result<Uuid> {
        let result = if OrderStatus::Processing.can_transition_to(resolved.status)
            && resolved.status != OrderStatus::Processing
        {
            self.store.apply_accrual(resolved).await
        } else {
            Err(LoyaltyError::InvalidArgument {
                field: "status".to_string(),
                message: format!("{} 不是终态", resolved.status),
            }
            .into())
        };
        self.in_flight.release(resolved.order_id);

        let status = resolved.status.as_str();
        match &result {
            Ok(user_id) => {
                info!(
                    order_id = %resolved.order_id,
                    number = %resolved.number,
                    user_id = %user_id,
                    status,
                    accrual = resolved.accrual,
                    "订单对账完成"
                );
                metrics::record_order_persisted(status, "committed");
            }
            Err(e) if e.is_conflict() => {
                warn!(
                    order_id = %resolved.order_id,
                    number = %resolved.number,
                    error = %e,
                    "订单写入冲突，事务已回滚"
                );
                metrics::record_order_persisted(status, "conflict");
            }
            Err(e) => {
                error!(
                    order_id = %resolved.order_id,
                    number = %resolved.number,
                    error = %e,
                    "订单写入失败，事务已回滚"
                );
                metrics::record_order_persisted(status, "failed");
            }
        }

        result
    }

    /// 按顺序写入批次，收到关闭信号后不再开始新的事务
    pub async fn persist_batch(
        &self,
        batch: Vec<ResolvedOrder>,
        shutdown: &watch::Receiver<bool>,
    ) -> PersistSummary {
        let mut summary = PersistSummary::default();

        for resolved in &batch {
            if is_cancelled(shutdown) {
                self.in_flight.release(resolved.order_id);
                summary.skipped += 1;
                continue;
            }
            match self.persist_order(resolved).await {
                Ok(_) => summary.committed += 1,
                Err(_) => summary.failed += 1,
            }
        }

        summary
    }

    /// 主循环：消费已判定的订单，直到上游关闭或收到关闭信号
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Vec<ResolvedOrder>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Persister 已启动");

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                batch = input.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let total = batch.len();
            let summary = self.persist_batch(batch, &shutdown).await;
            info!(
                total,
                committed = summary.committed,
                failed = summary.failed,
                skipped = summary.skipped,
                "批次写入完成"
            );

            if is_cancelled(&shutdown) {
                break;
            }
        }

        input.close();
        while let Ok(batch) = input.try_recv() {
            self.in_flight.release_all(batch.into_iter().map(|r| r.order_id));
        }

        info!("Persister 已停止");
    }
}
