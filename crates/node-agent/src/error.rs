use thiserror::Error;

/// Failure taxonomy for host-agent operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The control interface stayed unreachable for every allowed attempt.
    #[error("{command}: control channel unreachable after {attempts} attempts: {detail}")]
    TransientChannel {
        command: String,
        attempts: u32,
        detail: String,
    },
    /// Power status text the agent does not recognise.
    #[error("cannot parse power status: {output:?}")]
    StatusParse { output: String },
    /// The command ran and definitively failed.
    #[error("{command} failed: {detail}")]
    TerminalCommand { command: String, detail: String },
    #[error("invalid host configuration: {0}")]
    Configuration(String),
}

impl AgentError {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::TransientChannel { .. } => "transient",
            AgentError::StatusParse { .. } => "status_parse",
            AgentError::TerminalCommand { .. } => "terminal",
            AgentError::Configuration(_) => "configuration",
        }
    }
}
