//! 数据库连接池
//!
//! Worker 启动时建立连接池，并在领取订单前确认数据库可达。
//! 数据库与 Worker 同时启动时可能尚未就绪，确认过程按退避策略重试。

use std::future::pending;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::retry::{RetryPolicy, retry_with_policy};

/// 建立连接池并确认数据库可达
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
        .connect_lazy(&config.url)?;

    retry_with_policy(
        &startup_policy(config),
        "database_ping",
        |_: &sqlx::Error| true,
        pending(),
        || ping(&pool),
    )
    .await?;

    info!(
        database = %redacted_target(&config.url),
        max_connections = config.max_connections,
        "数据库连接池已就绪"
    );
    Ok(pool)
}

/// 执行一次 `SELECT 1`
pub async fn ping(pool: &PgPool) -> sqlx::Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .map(|_| ())
}

fn startup_policy(config: &DatabaseConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.startup_retries,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    }
}

/// 去掉连接串中的账号与密码，仅保留 host/库名用于日志
fn redacted_target(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.rsplit_once('@').map_or(rest, |(_, host)| host)
}
