//! 积分对账 Worker
//!
//! 负责流水线的生命周期：启动三个阶段、连接通道、等待关闭信号、回收所有阶段。
//! 状态只会单向推进：Idle -> Running -> ShuttingDown -> Stopped。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::config::AppConfig;
use loyalty_shared::retry::RetryPolicy;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::client::{AccrualApi, RateLimitGate};
use crate::pipeline::{Claimer, Fetcher, HANDOFF_CAPACITY, InFlightOrders, Persister, cancelled};
use crate::repository::OrderStore;

/// Worker 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Worker 运行参数
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            batch_size: 5,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            poll_interval: config.worker.poll_interval(),
            batch_size: config.worker.batch_size,
            retry: RetryPolicy::from(&config.accrual),
        }
    }
}

pub struct AccrualWorker {
    store: Arc<dyn OrderStore>,
    api: Arc<dyn AccrualApi>,
    gate: Arc<RateLimitGate>,
    settings: WorkerSettings,
    in_flight: Arc<InFlightOrders>,
    state: watch::Sender<WorkerState>,
}

impl AccrualWorker {
    pub fn new(
        store: Arc<dyn OrderStore>,
        api: Arc<dyn AccrualApi>,
        gate: Arc<RateLimitGate>,
        settings: WorkerSettings,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            store,
            api,
            gate,
            settings,
            in_flight: Arc::new(InFlightOrders::new()),
            state,
        }
    }

    /// 订阅生命周期状态
    pub fn state(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// 当前仍在流水线中的订单
    pub fn in_flight(&self) -> Arc<InFlightOrders> {
        self.in_flight.clone()
    }

    fn transition(&self, next: WorkerState) {
        let previous = self.state.send_replace(next);
        info!(from = ?previous, to = ?next, "Worker 状态变更");
    }

    /// 运行流水线直到收到关闭信号，所有阶段退出后返回
    ///
    /// 消费 self，Worker 停止后不能再次启动。
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.transition(WorkerState::Running);

        let (claimed_tx, claimed_rx) = mpsc::channel(HANDOFF_CAPACITY);
        let (resolved_tx, resolved_rx) = mpsc::channel(HANDOFF_CAPACITY);

        let claimer = Claimer::new(
            self.store.clone(),
            self.in_flight.clone(),
            self.settings.batch_size,
            self.settings.poll_interval,
        );
        let fetcher = Fetcher::new(
            self.api.clone(),
            self.gate.clone(),
            self.settings.retry.clone(),
            self.in_flight.clone(),
        );
        let persister = Persister::new(self.store.clone(), self.in_flight.clone());

        let stages = [
            (
                "claimer",
                tokio::spawn(claimer.run(claimed_tx, shutdown.clone())),
            ),
            (
                "fetcher",
                tokio::spawn(fetcher.run(claimed_rx, resolved_tx, shutdown.clone())),
            ),
            (
                "persister",
                tokio::spawn(persister.run(resolved_rx, shutdown.clone())),
            ),
        ];

        cancelled(&mut shutdown).await;
        self.transition(WorkerState::ShuttingDown);

        for (stage, handle) in stages {
            if let Err(e) = handle.await {
                error!(stage, error = %e, "流水线阶段异常退出");
            }
        }

        self.transition(WorkerState::Stopped);
    }
}
