//! 查询阶段
//!
//! 逐个查询批次中的订单，只把积分服务给出终态（PROCESSED/INVALID）的订单交给 Persister。
//! 其余订单保持 PROCESSING 并从处理中集合注销，等待下一轮重新领取。

use std::sync::Arc;

use loyalty_shared::observability::metrics;
use loyalty_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep_until;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::in_flight::InFlightOrders;
use super::{cancelled, is_cancelled};
use crate::client::{AccrualApi, RateLimitGate};
use crate::error::{AccrualError, Result};
use crate::models::{AccrualReport, Order, OrderStatus, ResolvedOrder};

pub struct Fetcher {
    api: Arc<dyn AccrualApi>,
    gate: Arc<RateLimitGate>,
    retry: RetryPolicy,
    in_flight: Arc<InFlightOrders>,
}

impl Fetcher {
    pub fn new(
        api: Arc<dyn AccrualApi>,
        gate: Arc<RateLimitGate>,
        retry: RetryPolicy,
        in_flight: Arc<InFlightOrders>,
    ) -> Self {
        Self {
            api,
            gate,
            retry,
            in_flight,
        }
    }

    /// 等待限流闸门打开，期间收到关闭信号则返回 `Cancelled`
    async fn wait_for_gate(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        while let Err(deadline) = self.gate.check() {
            debug!("积分服务冷却中，等待闸门打开");
            tokio::select! {
                biased;
                _ = cancelled(shutdown) => return Err(AccrualError::Cancelled),
                _ = sleep_until(deadline) => {}
            }
        }
        Ok(())
    }

    /// 查询单个订单：每次尝试前等待闸门，可重试错误按策略重试
    ///
    /// 关闭信号在尝试之间与退避期间生效，已发出的请求不会被中断。
    pub async fn fetch_order(
        &self,
        number: &str,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<AccrualReport> {
        let mut backoff_shutdown = shutdown.clone();
        let result = retry_with_policy(
            &self.retry,
            "fetch_accrual",
            AccrualError::is_retryable,
            cancelled(&mut backoff_shutdown),
            || {
                let mut shutdown = shutdown.clone();
                async move {
                    if is_cancelled(&shutdown) {
                        return Err(AccrualError::Cancelled);
                    }
                    self.wait_for_gate(&mut shutdown).await?;
                    self.api.fetch_order(number).await
                }
            },
        )
        .await;

        match result {
            Err(e) if e.is_retryable() && is_cancelled(shutdown) => Err(AccrualError::Cancelled),
            other => other,
        }
    }

    /// 查询并判定单个订单，非终态或失败时返回 None
    async fn resolve_order(
        &self,
        order: &Order,
        shutdown: &watch::Receiver<bool>,
    ) -> Option<ResolvedOrder> {
        match self.fetch_order(&order.number, shutdown).await {
            Ok(report) => match ResolvedOrder::from_report(order, report) {
                Some(resolved) => {
                    metrics::record_accrual_fetch(match resolved.status {
                        OrderStatus::Processed => "processed",
                        _ => "invalid",
                    });
                    Some(resolved)
                }
                None => {
                    debug!(
                        order_id = %order.id,
                        number = %order.number,
                        status = ?report.status,
                        "积分尚未计算完成，留待下一轮"
                    );
                    metrics::record_accrual_fetch("pending");
                    None
                }
            },
            Err(AccrualError::NotRegistered { .. }) => {
                debug!(order_id = %order.id, number = %order.number, "积分服务尚未登记该订单");
                metrics::record_accrual_fetch("not_registered");
                None
            }
            Err(AccrualError::Cancelled) => None,
            Err(e) => {
                warn!(
                    order_id = %order.id,
                    number = %order.number,
                    timeout = e.is_timeout(),
                    error = %e,
                    "积分查询失败，订单保留为 PROCESSING"
                );
                metrics::record_accrual_fetch("failed");
                None
            }
        }
    }

    /// 按领取顺序依次查询批次内的订单
    ///
    /// 收到关闭信号后不再开始新的查询，未查询的订单直接注销。
    pub async fn resolve_batch(
        &self,
        batch: Vec<Order>,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<ResolvedOrder> {
        let mut resolved = Vec::with_capacity(batch.len());
        let mut remaining = batch.into_iter();

        for order in remaining.by_ref() {
            if is_cancelled(shutdown) {
                self.in_flight.release(order.id);
                break;
            }
            match self.resolve_order(&order, shutdown).await {
                Some(r) => resolved.push(r),
                None => self.in_flight.release(order.id),
            }
        }
        self.in_flight.release_all(remaining.map(|o| o.id));

        resolved
    }

    /// 主循环：消费领取的批次，直到上游关闭或收到关闭信号
    pub async fn run(
        self,
        mut input: mpsc::Receiver<Vec<Order>>,
        out: mpsc::Sender<Vec<ResolvedOrder>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(max_attempts = self.retry.max_attempts(), "Fetcher 已启动");

        loop {
            let batch = tokio::select! {
                biased;
                _ = cancelled(&mut shutdown) => break,
                batch = input.recv() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let resolved = self.resolve_batch(batch, &shutdown).await;
            let ids: Vec<Uuid> = resolved.iter().map(|r| r.order_id).collect();

            if is_cancelled(&shutdown) {
                // 已查询但未写入的订单保持 PROCESSING，重启后重新处理
                self.in_flight.release_all(ids);
                break;
            }
            if resolved.is_empty() {
                continue;
            }
            if out.send(resolved).await.is_err() {
                warn!("Persister 已退出，停止查询");
                self.in_flight.release_all(ids);
                break;
            }
        }

        // 通道中尚未处理的批次
        input.close();
        while let Ok(batch) = input.try_recv() {
            self.in_flight.release_all(batch.into_iter().map(|o| o.id));
        }

        info!("Fetcher 已停止");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAccrualApi;
    use crate::models::AccrualStatus;
    use crate::models::fixtures::order;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    fn processed(accrual: i64) -> AccrualReport {
        AccrualReport {
            status: AccrualStatus::Processed,
            accrual,
        }
    }

    fn tracked(orders: &[Order]) -> Arc<InFlightOrders> {
        let in_flight = Arc::new(InFlightOrders::new());
        in_flight.track(orders);
        in_flight
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_terminal_orders_are_forwarded() {
        let orders = vec![
            order(1, OrderStatus::Processing),
            order(2, OrderStatus::Processing),
            order(3, OrderStatus::Processing),
            order(4, OrderStatus::Processing),
        ];
        let (n1, n2, n3) = (
            orders[0].number.clone(),
            orders[1].number.clone(),
            orders[2].number.clone(),
        );

        let mut api = MockAccrualApi::new();
        api.expect_fetch_order().returning(move |number| {
            if number == n1 {
                Ok(processed(5050))
            } else if number == n2 {
                Ok(AccrualReport {
                    status: AccrualStatus::Invalid,
                    accrual: 0,
                })
            } else if number == n3 {
                Ok(AccrualReport {
                    status: AccrualStatus::Processing,
                    accrual: 0,
                })
            } else {
                Err(AccrualError::NotRegistered {
                    number: number.to_string(),
                })
            }
        });

        let in_flight = tracked(&orders);
        let fetcher = Fetcher::new(
            Arc::new(api),
            Arc::new(RateLimitGate::new()),
            fast_retry(),
            in_flight.clone(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let resolved = fetcher.resolve_batch(orders.clone(), &stop_rx).await;

        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].order_id, orders[0].id);
        assert_eq!(resolved[0].status, OrderStatus::Processed);
        assert_eq!(resolved[0].accrual, 5050);
        assert_eq!(resolved[1].status, OrderStatus::Invalid);
        assert_eq!(resolved[1].accrual, 0);

        // 终态订单仍在处理中，其余已注销
        assert!(in_flight.contains(orders[0].id));
        assert!(in_flight.contains(orders[1].id));
        assert!(!in_flight.contains(orders[2].id));
        assert!(!in_flight.contains(orders[3].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_registered_is_not_retried() {
        let mut api = MockAccrualApi::new();
        api.expect_fetch_order().times(1).returning(|number| {
            Err(AccrualError::NotRegistered {
                number: number.to_string(),
            })
        });

        let fetcher = Fetcher::new(
            Arc::new(api),
            Arc::new(RateLimitGate::new()),
            fast_retry(),
            Arc::new(InFlightOrders::new()),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let err = fetcher.fetch_order("12345678903", &stop_rx).await.unwrap_err();
        assert!(matches!(err, AccrualError::NotRegistered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_then_dropped() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut api = MockAccrualApi::new();
        api.expect_fetch_order().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AccrualError::UnexpectedStatus { status: 500 })
        });

        let orders = vec![order(1, OrderStatus::Processing)];
        let in_flight = tracked(&orders);
        let fetcher = Fetcher::new(
            Arc::new(api),
            Arc::new(RateLimitGate::new()),
            fast_retry(),
            in_flight.clone(),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let resolved = fetcher.resolve_batch(orders, &stop_rx).await;

        assert!(resolved.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_gate_before_next_attempt() {
        let gate = Arc::new(RateLimitGate::new());
        let calls = Arc::new(AtomicU32::new(0));

        let mut api = MockAccrualApi::new();
        let gate_in_mock = gate.clone();
        let counter = calls.clone();
        api.expect_fetch_order().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                gate_in_mock.block_for(Duration::from_secs(5));
                Err(AccrualError::RateLimited {
                    retry_after: Duration::from_secs(5),
                })
            } else {
                Ok(processed(100))
            }
        });

        let fetcher = Fetcher::new(
            Arc::new(api),
            gate,
            fast_retry(),
            Arc::new(InFlightOrders::new()),
        );
        let (_stop_tx, stop_rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let report = fetcher.fetch_order("12345678903", &stop_rx).await.unwrap();

        assert_eq!(report.accrual, 100);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // 第二次请求不早于冷却截止时间
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_gate_wait() {
        let gate = Arc::new(RateLimitGate::new());
        gate.block_for(Duration::from_secs(60));

        let mut api = MockAccrualApi::new();
        api.expect_fetch_order().never();

        let fetcher = Fetcher::new(
            Arc::new(api),
            gate,
            fast_retry(),
            Arc::new(InFlightOrders::new()),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = stop_tx.send(true);
        });

        let err = fetcher.fetch_order("12345678903", &stop_rx).await.unwrap_err();
        assert!(matches!(err, AccrualError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_before_next_order() {
        let orders = vec![
            order(1, OrderStatus::Processing),
            order(2, OrderStatus::Processing),
        ];
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let mut api = MockAccrualApi::new();
        let trigger = stop_tx.clone();
        api.expect_fetch_order().times(1).returning(move |_| {
            // 第一个订单查询期间收到关闭信号
            let _ = trigger.send(true);
            Ok(processed(10))
        });

        let in_flight = tracked(&orders);
        let fetcher = Fetcher::new(
            Arc::new(api),
            Arc::new(RateLimitGate::new()),
            fast_retry(),
            in_flight.clone(),
        );

        let resolved = fetcher.resolve_batch(orders.clone(), &stop_rx).await;

        assert_eq!(resolved.len(), 1);
        assert!(!in_flight.contains(orders[1].id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_backoff() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let mut api = MockAccrualApi::new();
        api.expect_fetch_order().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AccrualError::UnexpectedStatus { status: 500 })
        });

        let slow_retry = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            multiplier: 1.0,
        };
        let fetcher = Fetcher::new(
            Arc::new(api),
            Arc::new(RateLimitGate::new()),
            slow_retry,
            Arc::new(InFlightOrders::new()),
        );
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = stop_tx.send(true);
        });

        let started = tokio::time::Instant::now();
        let err = fetcher.fetch_order("12345678903", &stop_rx).await.unwrap_err();

        assert!(matches!(err, AccrualError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(30));
    }
}
