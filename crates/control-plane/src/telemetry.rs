use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, routing::get};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sqlx::Error as SqlxError;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::persistence::SchemaStatus;
use crate::tasks::liveness::LivenessReport;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json())
        .init();
}

pub fn init_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("app_version", crate::version::VERSION)
        .install_recorder()?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

/// Serve the Prometheus text exposition on `/metrics` until `shutdown` flips.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "control-plane metrics listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

pub fn record_build_info(schema: &SchemaStatus) {
    let schema_version = schema
        .current
        .map(|v| v.to_string())
        .unwrap_or_else(|| "none".to_string());

    gauge!(
        "control_plane_info",
        "version" => crate::version::VERSION,
        "schema_version" => schema_version
    )
    .set(1.0);
    gauge!("control_plane_migrations_pending").set(schema.pending.len() as f64);
}

pub fn record_heartbeat_result(result: &'static str) {
    counter!("membership_heartbeat_total", "result" => result).increment(1);
}

pub fn record_liveness_sweep(report: &LivenessReport) {
    counter!("membership_liveness_sweep_total").increment(1);
    gauge!("membership_inactive_nodes").set(report.inactive as f64);
}

pub(crate) fn record_db_error(err: &SqlxError) {
    counter!("control_plane_db_errors_total", "kind" => db_error_kind(err)).increment(1);
}

fn db_error_kind(err: &SqlxError) -> &'static str {
    match err {
        SqlxError::RowNotFound => "row_not_found",
        SqlxError::Database(_) => "database",
        SqlxError::Io(_) => "io",
        SqlxError::Tls(_) => "tls",
        SqlxError::PoolTimedOut | SqlxError::PoolClosed => "pool",
        _ => "other",
    }
}
