//! 进程级限流闸门
//!
//! 积分服务返回 429 时会带上 Retry-After，在此之前的所有请求都应在本地被拒绝。
//! 闸门保存唯一的截止时间，`None` 表示当前没有限制。
//! 冷却时间来自服务端响应头，超过上限的值按上限处理。

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// 未配置时的单次冷却上限
pub const DEFAULT_MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// 限流闸门
///
/// 读取-判断-写入在同一把锁内完成，并发调用方看到的截止时间一致。
#[derive(Debug)]
pub struct RateLimitGate {
    blocked_until: Mutex<Option<Instant>>,
    max_cooldown: Duration,
}

impl Default for RateLimitGate {
    fn default() -> Self {
        Self::with_max_cooldown(DEFAULT_MAX_COOLDOWN)
    }
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_cooldown(max_cooldown: Duration) -> Self {
        Self {
            blocked_until: Mutex::new(None),
            max_cooldown,
        }
    }

    pub fn max_cooldown(&self) -> Duration {
        self.max_cooldown
    }

    /// 检查当前是否允许发起请求
    ///
    /// 截止时间已过则重置为无限制并放行；否则返回截止时间。
    pub fn check(&self) -> Result<(), Instant> {
        let mut guard = self.blocked_until.lock();
        match *guard {
            Some(deadline) if Instant::now() < deadline => Err(deadline),
            Some(_) => {
                *guard = None;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// 收到 429 后设置冷却期，返回生效的截止时间
    ///
    /// 截止时间只会延长不会缩短，单次冷却不超过 `max_cooldown`。
    pub fn block_for(&self, retry_after: Duration) -> Instant {
        let now = Instant::now();
        let cooldown = retry_after.min(self.max_cooldown);
        let candidate = now
            .checked_add(cooldown)
            .or_else(|| now.checked_add(DEFAULT_MAX_COOLDOWN))
            .unwrap_or(now);
        let mut guard = self.blocked_until.lock();
        let deadline = match *guard {
            Some(current) if current > candidate => current,
            _ => candidate,
        };
        *guard = Some(deadline);
        deadline
    }

    /// 当前截止时间（仅用于观测）
    pub fn blocked_until(&self) -> Option<Instant> {
        *self.blocked_until.lock()
    }
}
