//! 统一可观测性模块
//!
//! 提供日志与 Prometheus 指标的统一初始化。
//! 服务通过单一入口点配置可观测性，确保一致的指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;

use crate::config::ObservabilityConfig;

/// 可观测性资源守卫
///
/// 持有指标服务器的生命周期，drop 时停止 `/metrics` 端点。
pub struct ObservabilityGuard {
    metrics_handle: Option<metrics::MetricsHandle>,
}

impl ObservabilityGuard {
    /// 创建一个空的 Guard（用于测试或禁用指标时）
    pub fn empty() -> Self {
        Self {
            metrics_handle: None,
        }
    }
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            handle.shutdown();
        }
        info!("Shutting down observability...");
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（结构化日志）
/// 2. Metrics（Prometheus 指标，可通过配置关闭）
pub async fn init(service_name: &str, config: &ObservabilityConfig) -> Result<ObservabilityGuard> {
    tracing::init(config)?;

    info!(
        service = %service_name,
        log_format = %config.log_format,
        metrics_enabled = config.metrics_enabled,
        metrics_port = config.metrics_port,
        "Observability initialized"
    );

    if !config.metrics_enabled {
        return Ok(ObservabilityGuard::empty());
    }

    let metrics_handle = metrics::init(service_name, config.metrics_port).await?;

    Ok(ObservabilityGuard {
        metrics_handle: Some(metrics_handle),
    })
}
