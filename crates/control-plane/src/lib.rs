pub mod config;
pub mod error;
pub mod persistence;
pub mod services;
pub mod tasks;
pub mod telemetry;
pub mod version;

pub type Result<T> = std::result::Result<T, anyhow::Error>;

use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::services::membership::ClusterMembership;

/// Boot a management-server process and run until a termination signal arrives.
pub async fn run() -> Result<()> {
    run_with_shutdown(shutdown_signal()).await
}

pub async fn run_with_shutdown<S>(shutdown: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let app_config = config::load()?;
    let metrics_handle = telemetry::init_metrics_recorder()?;

    let db_pool = persistence::migrations::init_pool(&app_config.database.url).await?;
    let upgrade = persistence::migrations::run_migrations(&db_pool).await?;
    for mig in &upgrade.applied {
        info!(
            version = mig.version,
            description = %mig.description,
            "applied database migration"
        );
    }
    info!(
        schema_version = upgrade.status.current,
        "membership schema ready"
    );
    telemetry::record_build_info(&upgrade.status);

    let metrics_addr: SocketAddr =
        format!("{}:{}", app_config.metrics.host, app_config.metrics.port)
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid metrics listen address: {}", err))?;

    let membership = ClusterMembership::join(
        db_pool.clone(),
        app_config.node.identity(),
        Duration::from_millis(app_config.cluster.heartbeat_interval_ms),
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx_for_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown.await;
        let _ = shutdown_tx_for_signal.send(true);
    });

    let metrics_task = tokio::spawn(telemetry::serve_metrics(
        metrics_handle,
        metrics_addr,
        shutdown_rx.clone(),
    ));
    let liveness_task = tokio::spawn(tasks::liveness::liveness_loop(
        db_pool.clone(),
        Duration::from_millis(app_config.cluster.heartbeat_threshold_ms),
        Duration::from_millis(app_config.cluster.sweep_interval_ms),
        shutdown_rx.clone(),
    ));

    let heartbeat_result = membership.heartbeat_loop(shutdown_rx).await;
    let _ = shutdown_tx.send(true);

    if let Err(err) = liveness_task.await {
        warn!(%err, "liveness task failed");
    }
    match metrics_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "metrics server failed"),
        Err(err) => warn!(%err, "metrics task failed"),
    }

    // A fenced session no longer owns the row, so it must not soft-delete it.
    heartbeat_result?;
    membership.leave().await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(%err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => stream.recv().await,
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler");
                None
            }
        };
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("received SIGTERM, shutting down");
        },
    }
}
