use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::observability::metrics;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::rate_limit::RateLimitGate;
use crate::error::{AccrualError, Result};
use crate::models::{AccrualReport, AccrualResponse};

/// 积分服务单次查询接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccrualApi: Send + Sync {
    /// 查询单个订单的积分结果，只发起一次请求
    ///
    /// - 200 -> 报告（金额已换算为分）
    /// - 204 -> `NotRegistered`
    /// - 429 -> 设置闸门冷却期并返回 `RateLimited`
    /// - 冷却期内直接返回 `RateLimited`，不发起网络请求
    async fn fetch_order(&self, number: &str) -> Result<AccrualReport>;
}

/// 基于 reqwest 的积分服务客户端
///
/// reqwest::Client 内部带连接池，clone 是廉价操作。
#[derive(Clone)]
pub struct AccrualClient {
    http: reqwest::Client,
    base_url: String,
    gate: Arc<RateLimitGate>,
    default_retry_after: Duration,
}

impl AccrualClient {
    /// 创建客户端，所有请求共享配置中的单次超时
    pub fn new(config: &AccrualConfig, gate: Arc<RateLimitGate>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        info!(
            base_url = %config.base_url,
            timeout_ms = config.request_timeout_ms,
            "积分服务客户端已初始化"
        );

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            gate,
            default_retry_after: config.default_retry_after(),
        })
    }

    pub fn order_url(&self, number: &str) -> String {
        format!("{}/api/orders/{}", self.base_url, number)
    }

    pub fn gate(&self) -> &Arc<RateLimitGate> {
        &self.gate
    }
}

#[async_trait]
impl AccrualApi for AccrualClient {
    async fn fetch_order(&self, number: &str) -> Result<AccrualReport> {
        if let Err(deadline) = self.gate.check() {
            return Err(AccrualError::RateLimited {
                retry_after: deadline.saturating_duration_since(Instant::now()),
            });
        }

        let response = self.http.get(self.order_url(number)).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;
                let parsed: AccrualResponse = serde_json::from_slice(&body)
                    .map_err(|e| AccrualError::MalformedResponse(e.to_string()))?;
                let report = parsed.into_report()?;
                debug!(number, status = ?report.status, accrual = report.accrual, "积分查询成功");
                Ok(report)
            }
            StatusCode::NO_CONTENT => Err(AccrualError::NotRegistered {
                number: number.to_string(),
            }),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = parse_retry_after(
                    response.headers(),
                    self.default_retry_after,
                    self.gate.max_cooldown(),
                );
                self.gate.block_for(retry_after);
                metrics::record_rate_limited();
                warn!(
                    number,
                    retry_after_secs = retry_after.as_secs(),
                    "积分服务限流，暂停所有查询"
                );
                Err(AccrualError::RateLimited { retry_after })
            }
            other => Err(AccrualError::UnexpectedStatus {
                status: other.as_u16(),
            }),
        }
    }
}

/// 解析 Retry-After（秒数），缺失或无法解析时使用默认值，结果不超过 `max`
pub fn parse_retry_after(headers: &HeaderMap, default: Duration, max: Duration) -> Duration {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
        .min(max)
}
