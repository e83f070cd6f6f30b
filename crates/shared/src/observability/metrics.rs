//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use chrono::Utc;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    pub(crate) fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health`。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_worker_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册对账 Worker 相关指标的描述
fn register_worker_metrics(service_name: &str) {
    metrics::describe_counter!(
        "accrual_orders_claimed_total",
        "Total number of orders claimed for reconciliation"
    );
    metrics::describe_counter!(
        "accrual_fetch_total",
        "Accrual service lookups by outcome"
    );
    metrics::describe_counter!(
        "accrual_rate_limited_total",
        "Number of 429 responses received from the accrual service"
    );
    metrics::describe_counter!(
        "accrual_orders_persisted_total",
        "Reconciliation writes by resulting status and outcome"
    );
    metrics::describe_histogram!(
        "accrual_claim_duration_seconds",
        "Claim transaction duration in seconds"
    );
    metrics::describe_gauge!(
        "worker_last_run_timestamp",
        "Unix timestamp of the last worker cycle"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次领取
#[inline]
pub fn record_orders_claimed(count: usize, duration_secs: f64) {
    metrics::counter!("accrual_orders_claimed_total").increment(count as u64);
    metrics::histogram!("accrual_claim_duration_seconds").record(duration_secs);
}

/// 记录一次积分查询结果
///
/// outcome 取值：processed / invalid / pending / not_registered / failed
#[inline]
pub fn record_accrual_fetch(outcome: &'static str) {
    metrics::counter!("accrual_fetch_total", "outcome" => outcome).increment(1);
}

/// 记录一次 429 限流
#[inline]
pub fn record_rate_limited() {
    metrics::counter!("accrual_rate_limited_total").increment(1);
}

/// 记录一次对账写入
#[inline]
pub fn record_order_persisted(status: &str, outcome: &'static str) {
    metrics::counter!(
        "accrual_orders_persisted_total",
        "status" => status.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// 记录 Worker 最近一次运行时间
#[inline]
pub fn set_worker_last_run(worker: &'static str) {
    metrics::gauge!("worker_last_run_timestamp", "worker" => worker)
        .set(Utc::now().timestamp() as f64);
}
