use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{Router, http::StatusCode, routing::get};
use common::api::VmState;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

pub fn init_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

pub async fn serve_metrics_with_shutdown<S>(
    handle: PrometheusHandle,
    addr: SocketAddr,
    shutdown: S,
) -> anyhow::Result<()>
where
    S: std::future::Future<Output = ()> + Send + 'static,
{
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let body = handle.render();
            async move {
                (
                    StatusCode::OK,
                    [(
                        axum::http::header::CONTENT_TYPE,
                        "text/plain; version=0.0.4",
                    )],
                    body,
                )
            }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr().unwrap_or(addr);
    info!(%bound_addr, "metrics server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub fn record_channel_attempt(command: &'static str, result: &'static str) {
    counter!(
        "node_agent_channel_attempts_total",
        "command" => command,
        "result" => result
    )
    .increment(1);
}

pub fn record_state_change(state: VmState) {
    counter!("node_agent_state_changes_total", "state" => state.as_str()).increment(1);
}

pub fn record_command_result(command: &'static str, success: bool) {
    counter!(
        "node_agent_commands_total",
        "command" => command,
        "result" => if success { "success" } else { "failed" }
    )
    .increment(1);
}

pub fn record_status_poll(result: &'static str) {
    counter!("node_agent_status_poll_total", "result" => result).increment(1);
}
