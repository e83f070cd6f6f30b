//! 重试策略与执行器
//!
//! 为外部调用提供指数退避重试。是否重试由调用方通过 `is_retryable` 闭包决定，
//! 执行器本身对错误类型不做假设。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AccrualConfig;

/// 重试策略配置
///
/// 第 N 次重试前等待 `initial_delay * multiplier^N`，不超过 `max_delay`。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每次重试的退避倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 2 次，初始等待 200ms，最大等待 2 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

impl From<&AccrualConfig> for RetryPolicy {
    fn from(config: &AccrualConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Self::default()
        }
    }
}

impl RetryPolicy {
    /// 不做任何重试的策略
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 计算第 N 次重试的等待时间（attempt 从 0 开始）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// attempt 为已失败的重试轮次，小于 max_retries 时继续
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 总尝试次数（首次 + 重试）
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// 带重试的异步执行器
///
/// 仅在 `is_retryable` 返回 true 时重试；不可重试的错误与最后一次失败的错误原样返回。
/// 退避等待期间 `cancel` 完成则不再重试，直接返回最近一次的错误。
/// 不需要中途取消时传入 `std::future::pending()`。
pub async fn retry_with_policy<F, Fut, T, E, C>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&E) -> bool,
    cancel: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    C: Future<Output = ()>,
{
    tokio::pin!(cancel);
    let mut attempt: u32 = 0;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }

        if !policy.should_retry(attempt) {
            warn!(
                operation = operation_name,
                attempts = attempt + 1,
                error = %err,
                "已达最大重试次数，放弃重试"
            );
            return Err(err);
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "操作失败，将在退避后重试"
        );

        tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!(operation = operation_name, attempt, "退避期间收到取消信号，停止重试");
                return Err(err);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
