//! Wire types exchanged between the management server and host agents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Power state of a managed VM as tracked by a host agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// A start command was issued and has not settled yet.
    Starting,
    /// The guest is powered on.
    Running,
    /// A stop command was issued and has not settled yet.
    Stopping,
    /// The guest is powered off.
    Stopped,
    /// Only ever surfaced as an anomaly for bare-metal hosts.
    Migrating,
}

impl VmState {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Migrating => "migrating",
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VM name to state map reported by full and delta syncs.
pub type StateChanges = HashMap<String, VmState>;

/// Device the host should boot from on the next power-on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    /// Local disk.
    Disk,
    /// Network boot.
    Pxe,
}

impl BootDevice {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            BootDevice::Disk => "disk",
            BootDevice::Pxe => "pxe",
        }
    }
}

/// Typed command delivered to a host agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentCommand {
    /// Readiness probe sent after the agent connects.
    Ready,
    /// Power on (or reboot into) the guest.
    Start {
        /// Guest managed by this host.
        vm_name: String,
        /// Space separated boot arguments; `PxeBoot` selects network boot.
        #[serde(default)]
        boot_args: String,
    },
    /// Power off the guest.
    Stop {
        /// Guest managed by this host.
        vm_name: String,
    },
    /// Power-cycle the guest.
    Reboot {
        /// Guest managed by this host.
        vm_name: String,
    },
    /// Select the boot device for the next power-on.
    SetBootDevice {
        /// Target boot device.
        device: BootDevice,
    },
    /// Enter maintenance mode.
    Maintain,
    /// Prepare the host to receive a migrating guest.
    PrepareForMigration {
        /// Guest about to migrate.
        vm_name: String,
    },
    /// Migrate the guest away from this host.
    Migrate {
        /// Guest being migrated.
        vm_name: String,
        /// Destination host address.
        #[serde(default)]
        destination: String,
    },
    /// Ask for the current state of a guest.
    CheckVm {
        /// Guest to check.
        vm_name: String,
    },
    /// Boot the host if off, reboot it if on.
    BootOrReset,
    /// Any command type this agent does not understand.
    #[serde(other)]
    Unsupported,
}

impl AgentCommand {
    /// Stable command name used in answers, logs, and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            AgentCommand::Ready => "ready",
            AgentCommand::Start { .. } => "start",
            AgentCommand::Stop { .. } => "stop",
            AgentCommand::Reboot { .. } => "reboot",
            AgentCommand::SetBootDevice { .. } => "set_boot_device",
            AgentCommand::Maintain => "maintain",
            AgentCommand::PrepareForMigration { .. } => "prepare_for_migration",
            AgentCommand::Migrate { .. } => "migrate",
            AgentCommand::CheckVm { .. } => "check_vm",
            AgentCommand::BootOrReset => "boot_or_reset",
            AgentCommand::Unsupported => "unsupported",
        }
    }
}

/// Result of executing an [`AgentCommand`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    /// Name of the command this answers.
    pub command: String,
    /// Whether the command definitively succeeded.
    pub success: bool,
    /// Free-text diagnostic.
    pub details: String,
    /// VM state observed while answering, when the command reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<VmState>,
}

impl Answer {
    /// Successful answer.
    pub fn success(command: &AgentCommand, details: impl Into<String>) -> Self {
        Self {
            command: command.name().to_string(),
            success: true,
            details: details.into(),
            state: None,
        }
    }

    /// Failed answer.
    pub fn failure(command: &AgentCommand, details: impl Into<String>) -> Self {
        Self {
            command: command.name().to_string(),
            success: false,
            details: details.into(),
            state: None,
        }
    }

    /// Explicit answer for a command type the agent cannot execute.
    pub fn unsupported(command: &AgentCommand) -> Self {
        Self::failure(
            command,
            format!("unsupported command: {}", command.name()),
        )
    }

    /// Failed answer for a command line that could not be decoded.
    ///
    /// `command` is whatever `type` the sender wrote, or `unknown` when it had none.
    pub fn rejected(command: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            success: false,
            details: details.into(),
            state: None,
        }
    }

    /// Attach an observed VM state.
    pub fn with_state(mut self, state: VmState) -> Self {
        self.state = Some(state);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_type_decodes_as_unsupported() {
        let cmd: AgentCommand =
            serde_json::from_str(r#"{"type":"attach_volume","volume":"v1"}"#).expect("decode");
        assert_eq!(cmd, AgentCommand::Unsupported);

        let answer = Answer::unsupported(&cmd);
        assert!(!answer.success);
        assert!(answer.details.contains("unsupported"));
    }

    #[test]
    fn rejected_answer_keeps_the_raw_command_name() {
        let answer = Answer::rejected("stop", "missing field `vm_name`");
        assert_eq!(answer.command, "stop");
        assert!(!answer.success);
        assert!(answer.state.is_none());
    }

    #[test]
    fn start_boot_args_default_to_empty() {
        let cmd: AgentCommand =
            serde_json::from_str(r#"{"type":"start","vm_name":"i-2-10"}"#).expect("decode");
        assert_eq!(
            cmd,
            AgentCommand::Start {
                vm_name: "i-2-10".into(),
                boot_args: String::new(),
            }
        );
    }

    #[test]
    fn answer_omits_missing_state() {
        let answer = Answer::success(&AgentCommand::Ready, "ready");
        let value = serde_json::to_value(&answer).expect("encode");
        assert!(value.get("state").is_none());

        let answer = answer.with_state(VmState::Stopped);
        let value = serde_json::to_value(&answer).expect("encode");
        assert_eq!(value["state"], "stopped");
    }
}
