use common::api::{AgentCommand, Answer, BootDevice, VmState};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::runtime::{CommandRunner, ipmi, ipmi::PowerAction, retry::StopOutcome};
use crate::state::VmStateTracker;
use crate::telemetry;

/// Whitespace-separated boot argument that selects network boot.
pub const PXE_BOOT_ARG: &str = "PxeBoot";

pub fn wants_pxe_boot(boot_args: &str) -> bool {
    boot_args
        .split_whitespace()
        .any(|arg| arg.eq_ignore_ascii_case(PXE_BOOT_ARG))
}

/// Executes typed commands from the management server against one host.
#[derive(Clone)]
pub struct CommandHandler {
    host_name: String,
    runner: CommandRunner,
    tracker: VmStateTracker,
    shutdown: watch::Receiver<bool>,
}

impl CommandHandler {
    pub fn new(
        host_name: impl Into<String>,
        runner: CommandRunner,
        tracker: VmStateTracker,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            host_name: host_name.into(),
            runner,
            tracker,
            shutdown,
        }
    }

    pub async fn handle(&self, command: AgentCommand) -> Answer {
        let answer = match &command {
            AgentCommand::Ready => {
                debug!(host = %self.host_name, "bare-metal host is ready");
                Answer::success(&command, "ready")
            }
            AgentCommand::Start { vm_name, boot_args } => {
                self.start(&command, vm_name, boot_args).await
            }
            AgentCommand::Stop { vm_name } => self.stop(&command, vm_name).await,
            AgentCommand::Reboot { .. } => {
                match self.runner.run_retrying(&ipmi::reboot()).await {
                    Ok(_) => Answer::success(&command, "reboot succeeded"),
                    Err(err) => Answer::failure(&command, format!("IPMI reboot failed: {err}")),
                }
            }
            AgentCommand::SetBootDevice { device } => {
                self.set_boot_device(&command, *device).await
            }
            AgentCommand::Maintain => Answer::failure(&command, "maintenance not supported"),
            AgentCommand::PrepareForMigration { .. } => Answer::success(&command, "prepared"),
            AgentCommand::Migrate {
                vm_name,
                destination,
            } => {
                info!(
                    host = %self.host_name,
                    vm = vm_name.as_str(),
                    destination = destination.as_str(),
                    "migrating guest away; powering host off"
                );
                match self.runner.run_retrying(&ipmi::power(PowerAction::Soft)).await {
                    Ok(_) => Answer::success(&command, "success"),
                    Err(err) => {
                        Answer::failure(&command, format!("IPMI power off failed: {err}"))
                    }
                }
            }
            AgentCommand::CheckVm { .. } => {
                Answer::success(&command, "checked").with_state(VmState::Stopped)
            }
            AgentCommand::BootOrReset => {
                match self.runner.run_retrying(&ipmi::boot_or_reboot()).await {
                    Ok(_) => Answer::success(&command, "success"),
                    Err(err) => {
                        Answer::failure(&command, format!("IPMI boot or reboot failed: {err}"))
                    }
                }
            }
            AgentCommand::Unsupported => {
                warn!(host = %self.host_name, "unsupported command received");
                Answer::unsupported(&command)
            }
        };

        telemetry::record_command_result(command.name(), answer.success);
        answer
    }

    async fn set_boot_device(&self, command: &AgentCommand, device: BootDevice) -> Answer {
        match self.runner.run_retrying(&ipmi::set_boot_device(device)).await {
            Ok(_) => {
                info!(host = %self.host_name, device = device.as_str(), "set boot device");
                Answer::success(
                    command,
                    format!("set {} boot dev to {}", self.host_name, device.as_str()),
                )
            }
            Err(err) => {
                warn!(
                    host = %self.host_name,
                    device = device.as_str(),
                    error = %err,
                    "set boot device failed"
                );
                Answer::failure(
                    command,
                    format!(
                        "set {} boot dev to {} failed: {err}",
                        self.host_name,
                        device.as_str()
                    ),
                )
            }
        }
    }

    async fn start(&self, command: &AgentCommand, vm_name: &str, boot_args: &str) -> Answer {
        self.tracker.record(vm_name, VmState::Starting).await;

        match self.power_on(vm_name, wants_pxe_boot(boot_args)).await {
            Ok(()) => {
                self.tracker.record(vm_name, VmState::Running).await;
                self.tracker.track(vm_name).await;
                info!(host = %self.host_name, vm = vm_name, "started bare-metal guest");
                Answer::success(command, "started").with_state(VmState::Running)
            }
            Err(detail) => {
                self.tracker.remove(vm_name).await;
                warn!(host = %self.host_name, vm = vm_name, error = %detail, "start failed");
                Answer::failure(command, detail)
            }
        }
    }

    async fn power_on(&self, vm_name: &str, pxe_boot: bool) -> Result<(), String> {
        if pxe_boot {
            self.runner
                .run_retrying(&ipmi::set_boot_device(BootDevice::Pxe))
                .await
                .map_err(|err| format!("set boot device to PXE failed: {err}"))?;
            debug!(host = %self.host_name, vm = vm_name, "set PXE boot");
        } else if let Err(err) = self
            .runner
            .run_retrying(&ipmi::set_boot_device(BootDevice::Disk))
            .await
        {
            warn!(host = %self.host_name, error = %err, "set disk boot failed; continuing");
        }

        let power = self
            .runner
            .query_power(&ipmi::ping())
            .await
            .map_err(|err| {
                format!("cannot get current power status of {}: {err}", self.host_name)
            })?;

        if power == VmState::Running {
            if pxe_boot {
                self.runner
                    .run_retrying(&ipmi::reboot())
                    .await
                    .map_err(|err| format!("IPMI reboot failed: {err}"))?;
            } else {
                warn!(
                    host = %self.host_name,
                    vm = vm_name,
                    "host already powered on when start arrived; ignoring"
                );
            }
        } else {
            self.runner
                .run_retrying(&ipmi::power(PowerAction::On))
                .await
                .map_err(|err| format!("IPMI power on failed: {err}"))?;
        }
        Ok(())
    }

    async fn stop(&self, command: &AgentCommand, vm_name: &str) -> Answer {
        let previous = self.tracker.record(vm_name, VmState::Stopping).await;

        let outcome = self
            .runner
            .stop_with_escalation(
                &ipmi::power(PowerAction::Soft),
                &ipmi::power(PowerAction::Off),
                &ipmi::ping(),
                self.shutdown.clone(),
            )
            .await;

        match outcome {
            StopOutcome::Stopped { rounds } => {
                self.tracker.record(vm_name, VmState::Stopped).await;
                info!(host = %self.host_name, vm = vm_name, rounds, "stopped bare-metal guest");
                Answer::success(command, "stopped").with_state(VmState::Stopped)
            }
            StopOutcome::Failed(detail) => {
                self.restore(vm_name, previous).await;
                Answer::failure(command, format!("IPMI power off failed: {detail}"))
            }
            StopOutcome::Cancelled { rounds } => {
                self.restore(vm_name, previous).await;
                Answer::failure(
                    command,
                    format!("power off cancelled by shutdown after {rounds} rounds"),
                )
            }
        }
    }

    async fn restore(&self, vm_name: &str, previous: Option<VmState>) {
        match previous {
            Some(state) => {
                self.tracker.record(vm_name, state).await;
            }
            None => {
                self.tracker.remove(vm_name).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedChannel, runner_for};

    fn build_handler(
        channel: &ScriptedChannel,
    ) -> (CommandHandler, VmStateTracker, watch::Sender<bool>) {
        let runner = runner_for(channel);
        let tracker = VmStateTracker::new(runner.clone(), None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (
            CommandHandler::new("bm-host-1", runner, tracker.clone(), shutdown_rx),
            tracker,
            shutdown_tx,
        )
    }

    fn start(boot_args: &str) -> AgentCommand {
        AgentCommand::Start {
            vm_name: "guest-1".into(),
            boot_args: boot_args.into(),
        }
    }

    #[test]
    fn pxe_flag_is_a_case_insensitive_word() {
        assert!(wants_pxe_boot("PxeBoot"));
        assert!(wants_pxe_boot("console=ttyS0 pxeboot quiet"));
        assert!(!wants_pxe_boot(""));
        assert!(!wants_pxe_boot("NoPxeBoot"));
    }

    #[tokio::test]
    async fn disk_start_powers_on_and_tracks_guest() {
        let channel = ScriptedChannel::new();
        channel.push_ok("");
        channel.push_ok("Chassis Power is off");
        channel.push_ok("");
        let (handler, tracker, _shutdown) = build_handler(&channel);

        let answer = handler.handle(start("")).await;

        assert!(answer.success, "{answer:?}");
        assert_eq!(answer.state, Some(VmState::Running));
        assert_eq!(
            channel.calls(),
            vec!["boot_dev dev=disk", "ping", "power action=on"]
        );
        assert_eq!(tracker.lookup("guest-1").await, Some(VmState::Running));
        assert_eq!(tracker.tracked_vm().await.as_deref(), Some("guest-1"));
    }

    #[tokio::test]
    async fn disk_boot_failure_does_not_abort_start() {
        let channel = ScriptedChannel::new();
        channel.push_err("Error: boot device rejected");
        channel.push_ok("Chassis Power is on");
        let (handler, tracker, _shutdown) = build_handler(&channel);

        let answer = handler.handle(start("")).await;

        assert!(answer.success);
        assert_eq!(channel.calls(), vec!["boot_dev dev=disk", "ping"]);
        assert_eq!(tracker.lookup("guest-1").await, Some(VmState::Running));
    }

    #[tokio::test]
    async fn pxe_start_reboots_a_powered_host() {
        let channel = ScriptedChannel::new();
        channel.push_ok("");
        channel.push_ok("Chassis Power is on");
        channel.push_ok("");
        let (handler, _tracker, _shutdown) = build_handler(&channel);

        let answer = handler.handle(start("PxeBoot")).await;

        assert!(answer.success);
        assert_eq!(channel.calls(), vec!["boot_dev dev=pxe", "ping", "reboot"]);
    }

    #[tokio::test]
    async fn failed_start_forgets_the_guest() {
        let channel = ScriptedChannel::new();
        channel.push_err("Error: invalid user name");
        let (handler, tracker, _shutdown) = build_handler(&channel);

        let answer = handler.handle(start("PxeBoot")).await;

        assert!(!answer.success);
        assert!(answer.details.contains("PXE"), "{}", answer.details);
        assert_eq!(tracker.lookup("guest-1").await, None);
        assert_eq!(tracker.tracked_vm().await, None);
    }

    #[tokio::test]
    async fn stop_escalates_and_records_stopped() {
        let channel = ScriptedChannel::new();
        channel.push_ok("");
        channel.push_ok("Chassis Power is on");
        channel.push_ok("");
        channel.push_ok("Chassis Power is off");
        let (handler, tracker, _shutdown) = build_handler(&channel);
        tracker.record("guest-1", VmState::Running).await;

        let answer = handler
            .handle(AgentCommand::Stop {
                vm_name: "guest-1".into(),
            })
            .await;

        assert!(answer.success);
        assert_eq!(
            channel.calls(),
            vec!["power action=soft", "ping", "power action=off", "ping"]
        );
        assert_eq!(tracker.lookup("guest-1").await, Some(VmState::Stopped));
    }

    #[tokio::test]
    async fn failed_stop_restores_previous_state() {
        let channel = ScriptedChannel::new();
        channel.push_err("Error: insufficient privilege");
        let (handler, tracker, _shutdown) = build_handler(&channel);
        tracker.record("guest-1", VmState::Running).await;

        let answer = handler
            .handle(AgentCommand::Stop {
                vm_name: "guest-1".into(),
            })
            .await;

        assert!(!answer.success);
        assert_eq!(tracker.lookup("guest-1").await, Some(VmState::Running));
    }

    #[tokio::test]
    async fn fixed_answers_do_not_touch_the_channel() {
        let channel = ScriptedChannel::new();
        let (handler, _tracker, _shutdown) = build_handler(&channel);

        assert!(handler.handle(AgentCommand::Ready).await.success);
        assert!(!handler.handle(AgentCommand::Maintain).await.success);
        assert!(
            handler
                .handle(AgentCommand::PrepareForMigration {
                    vm_name: "guest-1".into()
                })
                .await
                .success
        );
        let checked = handler
            .handle(AgentCommand::CheckVm {
                vm_name: "guest-1".into(),
            })
            .await;
        assert_eq!(checked.state, Some(VmState::Stopped));
        assert!(!handler.handle(AgentCommand::Unsupported).await.success);
        assert!(channel.calls().is_empty());
    }

    #[tokio::test]
    async fn migrate_soft_powers_off_the_host() {
        let channel = ScriptedChannel::new();
        channel.push_ok("");
        let (handler, _tracker, _shutdown) = build_handler(&channel);

        let answer = handler
            .handle(AgentCommand::Migrate {
                vm_name: "guest-1".into(),
                destination: "10.0.0.7".into(),
            })
            .await;

        assert!(answer.success, "{answer:?}");
        assert_eq!(channel.calls(), vec!["power action=soft"]);
    }

    #[tokio::test]
    async fn boot_device_answer_names_host_and_device() {
        let channel = ScriptedChannel::new();
        channel.push_ok("");
        let (handler, _tracker, _shutdown) = build_handler(&channel);

        let answer = handler
            .handle(AgentCommand::SetBootDevice {
                device: BootDevice::Pxe,
            })
            .await;

        assert!(answer.success);
        assert_eq!(answer.details, "set bm-host-1 boot dev to pxe");
    }
}
