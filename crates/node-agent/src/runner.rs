use std::{net::SocketAddr, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    config,
    heartbeat::{self, PingReport, StartupReport},
    runtime::{CommandRunner, DynControlChannel, RetryPolicy},
    services::commands::CommandHandler,
    state::VmStateTracker,
    telemetry, version,
};

const REPORT_BUFFER: usize = 16;

/// Controls optional behaviours when starting the agent programmatically.
#[derive(Clone, Debug)]
pub struct AgentOptions {
    /// Initialize a tracing subscriber before starting the agent.
    pub init_tracing: bool,
    /// Start the dedicated `/metrics` HTTP server.
    pub serve_metrics: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            init_tracing: true,
            serve_metrics: true,
        }
    }
}

/// Handle returned by [`start_agent`] to drive and shut down a running agent.
pub struct AgentHandle {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    startup: StartupReport,
    commands: CommandHandler,
    reports: Option<mpsc::Receiver<PingReport>>,
}

impl AgentHandle {
    /// Inventory and full state sync gathered when the agent started.
    pub fn startup_report(&self) -> &StartupReport {
        &self.startup
    }

    pub fn commands(&self) -> CommandHandler {
        self.commands.clone()
    }

    /// Status reports from the poll loop; `None` once taken.
    pub fn take_reports(&mut self) -> Option<mpsc::Receiver<PingReport>> {
        self.reports.take()
    }

    /// Returns a cloneable receiver that fires when shutdown is requested.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Request a graceful shutdown; idempotent.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all agent tasks to finish.
    pub async fn await_termination(self) -> anyhow::Result<()> {
        for handle in self.tasks {
            if let Err(join_err) = handle.await
                && join_err.is_panic()
            {
                error!(?join_err, "agent task panicked during shutdown");
                anyhow::bail!("agent task panicked");
            }
        }
        Ok(())
    }

    /// Request shutdown and block until all tasks have stopped.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.request_shutdown();
        self.await_termination().await
    }
}

/// Start the node-agent against `channel` using the provided configuration and options.
pub async fn start_agent(
    cfg: config::AppConfig,
    channel: DynControlChannel,
    options: AgentOptions,
) -> anyhow::Result<AgentHandle> {
    if options.init_tracing {
        telemetry::init_tracing();
    }

    let metrics_addr: SocketAddr = format!("{}:{}", cfg.metrics_host, cfg.metrics_port)
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid metrics bind address: {}", err))?;

    info!(
        host = %cfg.host.name,
        host_id = cfg.host_id,
        agent_ip = ?cfg.host.agent_ip,
        tracked_vm = ?cfg.host.vm_name,
        version = version::VERSION,
        "node agent starting"
    );

    let runner = CommandRunner::new(channel, RetryPolicy::from(&cfg.ipmi));
    let tracker = VmStateTracker::new(runner.clone(), cfg.host.vm_name.clone());
    let startup = heartbeat::startup_report(&cfg.host, &tracker).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if options.serve_metrics {
        let metrics_handle = telemetry::init_metrics_recorder()?;
        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let shutdown_fut = async move {
                if *shutdown.borrow() {
                    return;
                }
                let _ = shutdown.changed().await;
            };
            if let Err(err) =
                telemetry::serve_metrics_with_shutdown(metrics_handle, metrics_addr, shutdown_fut)
                    .await
            {
                error!(?err, "metrics server exited with error");
            }
        }));
    }

    let (reports_tx, reports_rx) = mpsc::channel(REPORT_BUFFER);
    let status_runner = runner.clone();
    let status_tracker = tracker.clone();
    let status_shutdown = shutdown_rx.clone();
    let interval = Duration::from_secs(cfg.status_interval_secs.max(1));
    let ping_retry_delay = Duration::from_millis(cfg.ipmi.ping_retry_delay_ms);
    let host_id = cfg.host_id;
    tasks.push(tokio::spawn(async move {
        if let Err(err) = heartbeat::status_loop(
            status_runner,
            status_tracker,
            host_id,
            interval,
            ping_retry_delay,
            reports_tx,
            status_shutdown,
        )
        .await
        {
            error!(?err, "status loop terminated with error");
        }
    }));

    let commands = CommandHandler::new(
        cfg.host.name.clone(),
        runner,
        tracker,
        shutdown_rx.clone(),
    );

    Ok(AgentHandle {
        shutdown_tx,
        shutdown_rx,
        tasks,
        startup,
        commands,
        reports: Some(reports_rx),
    })
}

/// Waits for Ctrl+C or SIGTERM.
pub async fn wait_for_shutdown_signal() {
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
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
