//! 集成测试公共工具
//!
//! - `MemoryStore`：按与 SQL 相同的语义实现的内存订单/余额仓储
//! - `spawn_accrual`：在随机端口启动模拟积分服务

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use accrual_worker::{
    AccrualError, Balance, BalanceStore, Order, OrderStatus, OrderStore, ResolvedOrder, Result,
};
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use uuid::Uuid;

#[derive(Default)]
struct MemoryState {
    orders: HashMap<Uuid, Order>,
    balances: HashMap<Uuid, i64>,
    claims: usize,
}

/// 内存仓储
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, balance: i64) -> Uuid {
        let id = Uuid::now_v7();
        self.state.lock().balances.insert(id, balance);
        id
    }

    /// 添加订单，seq 决定 created_at 先后
    pub fn add_order(&self, user_id: Uuid, number: &str, seq: i64) -> Uuid {
        let created_at =
            DateTime::<Utc>::from_timestamp(1_700_000_000 + seq, 0).unwrap_or_else(Utc::now);
        let order = Order {
            id: Uuid::now_v7(),
            user_id,
            number: number.to_string(),
            status: OrderStatus::New,
            accrual: 0,
            created_at,
            updated_at: created_at,
        };
        let id = order.id;
        self.state.lock().orders.insert(id, order);
        id
    }

    pub fn order(&self, id: Uuid) -> Order {
        self.state.lock().orders[&id].clone()
    }

    pub fn balance_of(&self, user_id: Uuid) -> Option<i64> {
        self.state.lock().balances.get(&user_id).copied()
    }

    pub fn count_with_status(&self, status: OrderStatus) -> usize {
        self.state
            .lock()
            .orders
            .values()
            .filter(|o| o.status == status)
            .count()
    }

    /// 返回非空批次的领取次数
    pub fn claims(&self) -> usize {
        self.state.lock().claims
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn claim_batch(&self, limit: i64, exclude: &[Uuid]) -> Result<Vec<Order>> {
        let mut state = self.state.lock();

        let mut candidates: Vec<&mut Order> = state
            .orders
            .values_mut()
            .filter(|o| matches!(o.status, OrderStatus::New | OrderStatus::Processing))
            .filter(|o| !exclude.contains(&o.id))
            .collect();
        candidates.sort_by_key(|o| o.created_at);

        let now = Utc::now();
        let claimed: Vec<Order> = candidates
            .into_iter()
            .take(usize::try_from(limit).unwrap_or(0))
            .map(|o| {
                o.status = OrderStatus::Processing;
                o.updated_at = now;
                o.clone()
            })
            .collect();

        if claimed.is_empty() {
            return Err(AccrualError::NoOrdersAvailable);
        }
        state.claims += 1;
        Ok(claimed)
    }

    async fn apply_accrual(&self, resolved: &ResolvedOrder) -> Result<Uuid> {
        let mut state = self.state.lock();

        let user_id = match state.orders.get(&resolved.order_id) {
            Some(o) if o.status == OrderStatus::Processing => o.user_id,
            _ => {
                return Err(AccrualError::OrderNotUpdated {
                    order_id: resolved.order_id,
                });
            }
        };
        // 用户不存在时整体回滚：订单不做任何修改
        let Some(balance) = state.balances.get_mut(&user_id) else {
            return Err(AccrualError::BalanceNotUpdated { user_id });
        };
        *balance += resolved.accrual;

        if let Some(order) = state.orders.get_mut(&resolved.order_id) {
            order.status = resolved.status;
            order.accrual = resolved.accrual;
            order.updated_at = Utc::now();
        }
        Ok(user_id)
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn get_balance(&self, user_id: Uuid) -> Result<Option<Balance>> {
        Ok(self.balance_of(user_id).map(|current| Balance {
            user_id,
            current,
            withdrawn: 0,
        }))
    }
}

/// 在随机端口启动模拟积分服务，返回 base url
pub async fn spawn_accrual(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// 轮询直到条件满足或超时
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
