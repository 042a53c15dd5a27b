use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

pub mod ipmi;
pub mod retry;

pub use ipmi::IpmiScript;
pub use retry::{CommandRunner, RetryPolicy, StopOutcome};

pub type DynControlChannel = Arc<dyn ControlChannel>;

/// One out-of-band invocation: a verb plus `key=value` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCommand {
    pub verb: &'static str,
    pub params: Vec<(&'static str, String)>,
}

impl ChannelCommand {
    pub fn new(verb: &'static str) -> Self {
        Self {
            verb,
            params: Vec::new(),
        }
    }

    pub fn param(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.params.push((key, value.into()));
        self
    }

    /// Label used in logs and metrics, e.g. `power action=soft`.
    pub fn label(&self) -> String {
        let mut label = self.verb.to_string();
        for (key, value) in &self.params {
            label.push(' ');
            label.push_str(key);
            label.push('=');
            label.push_str(value);
        }
        label
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{verb} failed: {output}")]
    Failed { verb: &'static str, output: String },
    #[error("{verb} timed out after {timeout:?}")]
    Timeout {
        verb: &'static str,
        timeout: Duration,
    },
    #[error("failed to launch {verb}: {source}")]
    Launch {
        verb: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ChannelError {
    /// Text the retry policy classifies; for a failed run this is the script's own output.
    pub fn diagnostic(&self) -> String {
        match self {
            ChannelError::Failed { output, .. } => output.clone(),
            other => other.to_string(),
        }
    }
}

/// Synchronous-from-the-caller control interface to a host (IPMI in production).
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Run `cmd` once. `Ok` carries the command's standard output.
    async fn execute(&self, cmd: &ChannelCommand) -> Result<String, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_lists_params_in_order() {
        let cmd = ChannelCommand::new("power").param("action", "soft");
        assert_eq!(cmd.label(), "power action=soft");
        assert_eq!(ChannelCommand::new("ping").label(), "ping");
    }

    #[test]
    fn failed_diagnostic_is_raw_output() {
        let err = ChannelError::Failed {
            verb: "ping",
            output: "Error: Unable to establish LAN session".into(),
        };
        assert_eq!(err.diagnostic(), "Error: Unable to establish LAN session");

        let err = ChannelError::Timeout {
            verb: "ping",
            timeout: Duration::from_secs(1),
        };
        assert!(err.diagnostic().contains("timed out"));
    }
}
