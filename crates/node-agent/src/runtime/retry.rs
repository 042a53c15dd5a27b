//! Bounded retry and state-verified escalation over a [`ControlChannel`].

use std::time::Duration;

use common::api::VmState;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{ChannelCommand, ChannelError, DynControlChannel};
use crate::config::IpmiConfig;
use crate::error::AgentError;
use crate::telemetry;

/// Output prefix the IPMI tooling prints when the BMC is momentarily unreachable.
pub const TRANSIENT_LAN_PREFIX: &str = "Error: Unable to establish LAN";

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_STOP_ROUNDS: u32 = 10;

pub fn is_transient_lan_error(diagnostic: &str) -> bool {
    diagnostic.starts_with(TRANSIENT_LAN_PREFIX)
}

/// Classify chassis power text into a VM state.
pub fn parse_power_status(output: &str) -> Result<VmState, AgentError> {
    let text = output.trim_start();
    if text.starts_with("Chassis Power is on") {
        Ok(VmState::Running)
    } else if text.starts_with("Chassis Power is off") {
        Ok(VmState::Stopped)
    } else {
        Err(AgentError::StatusParse {
            output: output.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub stop_max_rounds: u32,
    /// Pause between a power-off attempt and the status check that verifies it.
    pub stop_poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stop_max_rounds: DEFAULT_STOP_ROUNDS,
            stop_poll_interval: Duration::from_secs(1),
        }
    }
}

impl From<&IpmiConfig> for RetryPolicy {
    fn from(cfg: &IpmiConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            stop_max_rounds: cfg.stop_max_rounds.max(1),
            stop_poll_interval: Duration::from_millis(cfg.stop_poll_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Power-off observed after `rounds` attempts.
    Stopped { rounds: u32 },
    Failed(String),
    /// Shutdown was requested between rounds.
    Cancelled { rounds: u32 },
}

impl StopOutcome {
    pub fn is_stopped(&self) -> bool {
        matches!(self, StopOutcome::Stopped { .. })
    }
}

#[derive(Clone)]
pub struct CommandRunner {
    channel: DynControlChannel,
    policy: RetryPolicy,
}

impl CommandRunner {
    pub fn new(channel: DynControlChannel, policy: RetryPolicy) -> Self {
        Self { channel, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Single attempt, no retry.
    pub async fn run(&self, cmd: &ChannelCommand) -> Result<String, ChannelError> {
        let result = self.channel.execute(cmd).await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) if is_transient_lan_error(&err.diagnostic()) => "transient",
            Err(_) => "failed",
        };
        telemetry::record_channel_attempt(cmd.verb, outcome);
        result
    }

    /// Re-run `cmd` while its failure text is classified transient, up to `max_attempts` runs.
    pub async fn run_with_retry<F>(
        &self,
        cmd: &ChannelCommand,
        is_transient: F,
    ) -> Result<String, AgentError>
    where
        F: Fn(&str) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_diagnostic = String::new();

        for attempt in 1..=max_attempts {
            match self.run(cmd).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    let diagnostic = err.diagnostic();
                    if !is_transient(&diagnostic) {
                        warn!(command = %cmd.label(), error = %diagnostic, "ipmi command failed");
                        return Err(AgentError::TerminalCommand {
                            command: cmd.label(),
                            detail: diagnostic,
                        });
                    }
                    warn!(
                        command = %cmd.label(),
                        attempt,
                        max_attempts,
                        "ipmi channel unreachable, retrying"
                    );
                    last_diagnostic = diagnostic;
                }
            }
        }

        Err(AgentError::TransientChannel {
            command: cmd.label(),
            attempts: max_attempts,
            detail: last_diagnostic,
        })
    }

    /// [`run_with_retry`](Self::run_with_retry) with the IPMI LAN-unreachable classifier.
    pub async fn run_retrying(&self, cmd: &ChannelCommand) -> Result<String, AgentError> {
        self.run_with_retry(cmd, is_transient_lan_error).await
    }

    /// Run a status command and classify its output.
    pub async fn query_power(&self, status: &ChannelCommand) -> Result<VmState, AgentError> {
        let output = self.run_retrying(status).await?;
        parse_power_status(&output)
    }

    /// Issue `soft`, verify with `status`, and switch to `force` for later rounds until the
    /// host reports powered off or `stop_max_rounds` is exhausted.
    pub async fn stop_with_escalation(
        &self,
        soft: &ChannelCommand,
        force: &ChannelCommand,
        status: &ChannelCommand,
        mut shutdown: watch::Receiver<bool>,
    ) -> StopOutcome {
        let max_rounds = self.policy.stop_max_rounds.max(1);
        let mut command = soft;

        for round in 1..=max_rounds {
            if *shutdown.borrow() {
                return StopOutcome::Cancelled { rounds: round - 1 };
            }

            if let Err(err) = self.run_retrying(command).await {
                return StopOutcome::Failed(err.to_string());
            }

            let cancelled = tokio::select! {
                changed = shutdown.changed() => changed.is_ok() && *shutdown.borrow(),
                _ = tokio::time::sleep(self.policy.stop_poll_interval) => false,
            };
            if cancelled {
                return StopOutcome::Cancelled { rounds: round };
            }

            match self.query_power(status).await {
                Ok(VmState::Stopped) => {
                    debug!(rounds = round, "host powered off");
                    return StopOutcome::Stopped { rounds: round };
                }
                Ok(_) => {
                    debug!(round, "host still powered on, escalating to forced power off");
                    command = force;
                }
                Err(err) => return StopOutcome::Failed(err.to_string()),
            }
        }

        StopOutcome::Failed(format!(
            "host still powered on after {max_rounds} power-off rounds"
        ))
    }
}
