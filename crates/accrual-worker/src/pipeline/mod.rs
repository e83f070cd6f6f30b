//! 对账流水线
//!
//! Claimer、Fetcher、Persister 各自运行在独立的 tokio 任务中，
//! 通过容量为 1 的 mpsc 通道交接批次，下游处理不过来时上游自然阻塞。
//! 关闭信号统一使用 `watch::Receiver<bool>`，发送端被 drop 同样视为关闭。

mod claimer;
mod fetcher;
mod in_flight;
mod persister;

pub use claimer::Claimer;
pub use fetcher::Fetcher;
pub use in_flight::InFlightOrders;
pub use persister::{PersistSummary, Persister};

use tokio::sync::watch;

/// 批次交接通道容量
pub const HANDOFF_CAPACITY: usize = 1;

/// 等待关闭信号
pub async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// 是否已收到关闭信号
pub fn is_cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}
