use serde::Deserialize;
use std::env;

use crate::error::AgentError;

pub const ENV_PREFIX: &str = "CLUSTER_AGENT";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub host: HostConfig,
    pub ipmi: IpmiConfig,
    /// Identifier the management server assigned to this host.
    pub host_id: i64,
    /// How often the status loop polls the host.
    pub status_interval_secs: u64,
    pub metrics_host: String,
    pub metrics_port: u16,
}

/// Inventory and credentials of the bare-metal host this agent drives.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub guid: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Address of the host's IPMI interface.
    #[serde(default)]
    pub agent_ip: Option<String>,
    pub mac: String,
    pub username: String,
    pub password: String,
    pub cpu_number: i64,
    pub cpu_speed_mhz: i64,
    pub memory_mb: i64,
    /// Guest already running on the host when the agent starts, if any.
    #[serde(default)]
    pub vm_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpmiConfig {
    pub script_path: String,
    pub interpreter: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub stop_max_rounds: u32,
    pub stop_poll_interval_ms: u64,
    pub ping_retry_delay_ms: u64,
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        require(&self.pod, "pod")?;
        require(&self.cluster, "cluster")?;
        require(&self.agent_ip, "agent_ip")?;
        require(&self.guid, "guid")?;

        let mac = self.mac.trim();
        if mac.eq_ignore_ascii_case("unknown") {
            return Err(AgentError::Configuration(
                "unable to get the host mac address".into(),
            ));
        }
        if !is_mac_address(mac) {
            return Err(AgentError::Configuration(format!(
                "wrong MAC format ({mac}); expected six colon-separated octets such as 00:11:ba:33:aa:dd"
            )));
        }

        if self.cpu_number <= 0 || self.cpu_speed_mhz <= 0 || self.memory_mb <= 0 {
            return Err(AgentError::Configuration(format!(
                "cpu_number ({}), cpu_speed_mhz ({}) and memory_mb ({}) must be positive",
                self.cpu_number, self.cpu_speed_mhz, self.memory_mb
            )));
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }
}

impl IpmiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.script_path.trim().is_empty() {
            anyhow::bail!("ipmi.script_path cannot be empty");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("ipmi.max_attempts must be >= 1");
        }
        if self.stop_max_rounds == 0 {
            anyhow::bail!("ipmi.stop_max_rounds must be >= 1");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("ipmi.timeout_secs must be > 0");
        }
        Ok(())
    }
}

fn require(value: &Option<String>, field: &str) -> Result<(), AgentError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(()),
        _ => Err(AgentError::Configuration(format!("host.{field} is required"))),
    }
}

fn is_mac_address(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| (1..=2).contains(&o.len()) && o.chars().all(|c| c.is_ascii_hexdigit()))
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("CLUSTER_AGENT_HOST_NAME", "host.name"),
    ("CLUSTER_AGENT_HOST_GUID", "host.guid"),
    ("CLUSTER_AGENT_HOST_ZONE", "host.zone"),
    ("CLUSTER_AGENT_HOST_POD", "host.pod"),
    ("CLUSTER_AGENT_HOST_CLUSTER", "host.cluster"),
    ("CLUSTER_AGENT_HOST_AGENT_IP", "host.agent_ip"),
    ("CLUSTER_AGENT_HOST_MAC", "host.mac"),
    ("CLUSTER_AGENT_HOST_USERNAME", "host.username"),
    ("CLUSTER_AGENT_HOST_PASSWORD", "host.password"),
    ("CLUSTER_AGENT_HOST_CPU_NUMBER", "host.cpu_number"),
    ("CLUSTER_AGENT_HOST_CPU_SPEED_MHZ", "host.cpu_speed_mhz"),
    ("CLUSTER_AGENT_HOST_MEMORY_MB", "host.memory_mb"),
    ("CLUSTER_AGENT_HOST_VM_NAME", "host.vm_name"),
    ("CLUSTER_AGENT_IPMI_SCRIPT_PATH", "ipmi.script_path"),
    ("CLUSTER_AGENT_IPMI_INTERPRETER", "ipmi.interpreter"),
    ("CLUSTER_AGENT_IPMI_TIMEOUT_SECS", "ipmi.timeout_secs"),
    ("CLUSTER_AGENT_IPMI_MAX_ATTEMPTS", "ipmi.max_attempts"),
    ("CLUSTER_AGENT_IPMI_STOP_MAX_ROUNDS", "ipmi.stop_max_rounds"),
    (
        "CLUSTER_AGENT_IPMI_STOP_POLL_INTERVAL_MS",
        "ipmi.stop_poll_interval_ms",
    ),
    (
        "CLUSTER_AGENT_IPMI_PING_RETRY_DELAY_MS",
        "ipmi.ping_retry_delay_ms",
    ),
    ("CLUSTER_AGENT_HOST_ID", "host_id"),
    ("CLUSTER_AGENT_STATUS_INTERVAL_SECS", "status_interval_secs"),
    ("CLUSTER_AGENT_METRICS_HOST", "metrics_host"),
    ("CLUSTER_AGENT_METRICS_PORT", "metrics_port"),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .set_default("host.name", "baremetal-host")?
        .set_default("host.mac", "unknown")?
        .set_default("host.username", "")?
        .set_default("host.password", "")?
        .set_default("host.cpu_number", 0)?
        .set_default("host.cpu_speed_mhz", 0)?
        .set_default("host.memory_mb", 0)?
        .set_default("ipmi.script_path", "scripts/util/ipmi.py")?
        .set_default("ipmi.interpreter", "python3")?
        .set_default("ipmi.timeout_secs", 60)?
        .set_default("ipmi.max_attempts", 5)?
        .set_default("ipmi.stop_max_rounds", 10)?
        .set_default("ipmi.stop_poll_interval_ms", 1_000)?
        .set_default("ipmi.ping_retry_delay_ms", 1_000)?
        .set_default("host_id", 0)?
        .set_default("status_interval_secs", 60)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9091)?;

    // Override with single-underscore environment variables.
    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(cfg_key, value)?;
        }
    }

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.host.mac = app.host.mac.trim().to_string();
    app.host.validate()?;
    app.ipmi.validate()?;
    Ok(app)
}
