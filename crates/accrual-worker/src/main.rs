//! 积分对账 Worker
//!
//! 后台轮询待处理订单，向积分计算服务查询结果并写回订单与用户余额。

use std::sync::Arc;

use accrual_worker::{AccrualClient, AccrualWorker, PgOrderStore, RateLimitGate, WorkerSettings};
use loyalty_shared::{config::AppConfig, database, observability};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "accrual-worker";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..Default::default()
        }
    });
    config.validate()?;

    let _observability = observability::init(&config.service_name, &config.observability).await?;
    info!(
        environment = %config.environment,
        accrual_url = %config.accrual.base_url,
        "Starting accrual-worker..."
    );

    let pool = database::connect(&config.database).await?;

    let gate = Arc::new(RateLimitGate::with_max_cooldown(
        config.accrual.max_retry_after(),
    ));
    let client = AccrualClient::new(&config.accrual, gate.clone())?;
    let store = PgOrderStore::new(pool.clone());

    let worker = AccrualWorker::new(
        Arc::new(store),
        Arc::new(client),
        gate,
        WorkerSettings::from_config(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker task failed");
    }

    pool.close().await;
    info!("accrual-worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
