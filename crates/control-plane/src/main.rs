#[tokio::main]
async fn main() -> control_plane::Result<()> {
    control_plane::telemetry::init_tracing();
    tracing::info!(
        version = control_plane::version::VERSION,
        "control-plane starting"
    );
    control_plane::run().await
}
