use std::time::Duration;

use common::api::StateChanges;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::runtime::{CommandRunner, ipmi};
use crate::state::VmStateTracker;
use crate::telemetry;

/// Static description of the host sent once when the agent connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInventory {
    pub name: String,
    pub guid: Option<String>,
    pub zone: Option<String>,
    pub pod: Option<String>,
    pub cluster: Option<String>,
    pub private_ip: Option<String>,
    pub private_mac: String,
    pub cpus: i64,
    pub cpu_speed_mhz: i64,
    pub memory_bytes: i64,
}

impl HostInventory {
    pub fn from_config(host: &HostConfig) -> Self {
        Self {
            name: host.name.clone(),
            guid: host.guid.clone(),
            zone: host.zone.clone(),
            pod: host.pod.clone(),
            cluster: host.cluster.clone(),
            private_ip: host.agent_ip.clone(),
            private_mac: host.mac.clone(),
            cpus: host.cpu_number,
            cpu_speed_mhz: host.cpu_speed_mhz,
            memory_bytes: host.memory_bytes(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartupReport {
    pub inventory: HostInventory,
    pub state_changes: StateChanges,
}

/// Result of one status poll for a reachable host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PingReport {
    pub host_id: i64,
    /// `None` when nothing is tracked or the power read was inconclusive.
    pub state_changes: Option<StateChanges>,
}

pub async fn startup_report(host: &HostConfig, tracker: &VmStateTracker) -> StartupReport {
    let state_changes = tracker.full_sync().await;
    info!(
        host = %host.name,
        tracked = state_changes.len(),
        "host inventory collected"
    );
    StartupReport {
        inventory: HostInventory::from_config(host),
        state_changes,
    }
}

/// Ping the host, retrying once after `ping_retry_delay`. `None` means unreachable this cycle.
pub async fn current_status(
    runner: &CommandRunner,
    tracker: &VmStateTracker,
    host_id: i64,
    ping_retry_delay: Duration,
) -> Option<PingReport> {
    if let Err(err) = runner.run_retrying(&ipmi::ping()).await {
        debug!(host_id, error = %err, "ping failed, retrying once");
        tokio::time::sleep(ping_retry_delay).await;
        if let Err(err) = runner.run_retrying(&ipmi::ping()).await {
            warn!(host_id, error = %err, "host unreachable over ipmi");
            telemetry::record_status_poll("unreachable");
            return None;
        }
    }

    let state_changes = tracker.delta_sync().await;
    telemetry::record_status_poll(match &state_changes {
        Some(changes) if !changes.is_empty() => "changed",
        _ => "unchanged",
    });
    Some(PingReport {
        host_id,
        state_changes,
    })
}

pub async fn status_loop(
    runner: CommandRunner,
    tracker: VmStateTracker,
    host_id: i64,
    interval: Duration,
    ping_retry_delay: Duration,
    reports: mpsc::Sender<PingReport>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let Some(report) = current_status(&runner, &tracker, host_id, ping_retry_delay).await else {
                    continue;
                };
                if reports.send(report).await.is_err() {
                    debug!(host_id, "status report receiver dropped, stopping poll loop");
                    break;
                }
            }
        }
    }

    Ok(())
}
