//! 本进程正在处理中的订单
//!
//! 订单被领取后登记，Fetcher 放弃或 Persister 写入后注销。
//! Claimer 领取时排除这些订单，避免下一轮重复领取仍在流水线中的订单；
//! 进程重启后集合为空，遗留的 PROCESSING 订单会被重新领取。

use std::collections::HashSet;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::Order;

#[derive(Debug, Default)]
pub struct InFlightOrders {
    ids: Mutex<HashSet<Uuid>>,
}

impl InFlightOrders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Uuid> {
        self.ids.lock().iter().copied().collect()
    }

    pub fn track(&self, orders: &[Order]) {
        let mut ids = self.ids.lock();
        ids.extend(orders.iter().map(|o| o.id));
    }

    pub fn release(&self, id: Uuid) {
        self.ids.lock().remove(&id);
    }

    pub fn release_all(&self, released: impl IntoIterator<Item = Uuid>) {
        let mut ids = self.ids.lock();
        for id in released {
            ids.remove(&id);
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
