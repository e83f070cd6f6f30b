//! 领取阶段
//!
//! 每个 tick 领取一批订单并交给 Fetcher。领取失败只影响本轮，下一轮照常进行。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::observability::metrics;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::in_flight::InFlightOrders;
use super::cancelled;
use crate::error::Result;
use crate::models::Order;
use crate::repository::OrderStore;

pub struct Claimer {
    store: Arc<dyn OrderStore>,
    in_flight: Arc<InFlightOrders>,
    batch_size: i64,
    poll_interval: Duration,
}

impl Claimer {
    pub fn new(
        store: Arc<dyn OrderStore>,
        in_flight: Arc<InFlightOrders>,
        batch_size: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            in_flight,
            batch_size: i64::from(batch_size),
            poll_interval,
        }
    }

    /// 领取一批订单，排除仍在流水线中的订单
    pub async fn claim(&self) -> Result<Vec<Order>> {
        let started = Instant::now();
        let exclude = self.in_flight.snapshot();

        let orders = self.store.claim_batch(self.batch_size, &exclude).await?;

        self.in_flight.track(&orders);
        metrics::record_orders_claimed(orders.len(), started.elapsed().as_secs_f64());
        Ok(orders)
    }

    /// 主循环：按固定间隔领取，直到收到关闭信号
    ///
    /// 退出时 ticker 与发送端一并 drop，下游随之感知到通道关闭。
    pub async fn run(self, out: mpsc::Sender<Vec<Order>>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval = ?self.poll_interval,
            batch_size = self.batch_size,
            "Claimer 已启动"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                _ = ticker.tick() => {}
            }

            metrics::set_worker_last_run("accrual_worker");

            let batch = match self.claim().await {
                Ok(batch) => batch,
                Err(e) if e.is_no_work() => {
                    debug!("没有待处理的订单，跳过本轮");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "订单领取失败，跳过本轮");
                    continue;
                }
            };

            info!(count = batch.len(), "领取到待对账订单");
            let ids: Vec<Uuid> = batch.iter().map(|o| o.id).collect();

            tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => {
                    // 未交出的批次保持 PROCESSING，重启后重新领取
                    self.in_flight.release_all(ids);
                    break;
                }
                sent = out.send(batch) => {
                    if sent.is_err() {
                        warn!("Fetcher 已退出，停止领取");
                        self.in_flight.release_all(ids);
                        break;
                    }
                }
            }
        }

        info!("Claimer 已停止");
    }
}
