use std::{fmt, path::PathBuf, process::Stdio, time::Duration};

use async_trait::async_trait;
use common::api::BootDevice;
use tokio::process::Command;
use tracing::debug;

use super::{ChannelCommand, ChannelError, ControlChannel};
use crate::config::{HostConfig, IpmiConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    On,
    /// ACPI shutdown request to the guest OS.
    Soft,
    /// Hard power cut.
    Off,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::On => "on",
            PowerAction::Soft => "soft",
            PowerAction::Off => "off",
        }
    }
}

/// Reachability probe. Its output doubles as the chassis power status.
pub fn ping() -> ChannelCommand {
    ChannelCommand::new("ping")
}

pub fn set_boot_device(device: BootDevice) -> ChannelCommand {
    ChannelCommand::new("boot_dev").param("dev", device.as_str())
}

pub fn reboot() -> ChannelCommand {
    ChannelCommand::new("reboot")
}

pub fn power(action: PowerAction) -> ChannelCommand {
    ChannelCommand::new("power").param("action", action.as_str())
}

pub fn boot_or_reboot() -> ChannelCommand {
    ChannelCommand::new("boot_or_reboot")
}

/// Runs the IPMI helper script for one host:
/// `<interpreter> <script> <verb> hostname=.. usrname=.. password=.. [key=value..]`.
#[derive(Clone)]
pub struct IpmiScript {
    interpreter: String,
    script_path: PathBuf,
    hostname: String,
    username: String,
    password: String,
    timeout: Duration,
}

impl fmt::Debug for IpmiScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpmiScript")
            .field("interpreter", &self.interpreter)
            .field("script_path", &self.script_path)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl IpmiScript {
    pub fn new(ipmi: &IpmiConfig, host: &HostConfig) -> Self {
        Self {
            interpreter: ipmi.interpreter.clone(),
            script_path: PathBuf::from(&ipmi.script_path),
            hostname: host.agent_ip.clone().unwrap_or_default(),
            username: host.username.clone(),
            password: host.password.clone(),
            timeout: Duration::from_secs(ipmi.timeout_secs.max(1)),
        }
    }

    fn build(&self, cmd: &ChannelCommand) -> Command {
        let mut command = Command::new(&self.interpreter);
        command
            .arg(&self.script_path)
            .arg(cmd.verb)
            .arg(format!("hostname={}", self.hostname))
            .arg(format!("usrname={}", self.username))
            .arg(format!("password={}", self.password));
        for (key, value) in &cmd.params {
            command.arg(format!("{key}={value}"));
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl ControlChannel for IpmiScript {
    async fn execute(&self, cmd: &ChannelCommand) -> Result<String, ChannelError> {
        debug!(command = %cmd.label(), host = %self.hostname, "running ipmi script");

        let output = match tokio::time::timeout(self.timeout, self.build(cmd).output()).await {
            Err(_) => {
                return Err(ChannelError::Timeout {
                    verb: cmd.verb,
                    timeout: self.timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(ChannelError::Launch {
                    verb: cmd.verb,
                    source,
                });
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostic = first_line(&stdout)
            .or_else(|| first_line(&stderr))
            .map(str::to_string)
            .unwrap_or_else(|| format!("exited with {}", output.status));
        Err(ChannelError::Failed {
            verb: cmd.verb,
            output: diagnostic,
        })
    }
}

fn first_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}
