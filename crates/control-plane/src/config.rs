use serde::Deserialize;

use crate::persistence::ServerIdentity;

pub const ENV_PREFIX: &str = "CLUSTER_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Identity this management-server process registers under.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub id: i64,
    pub msid: i64,
    pub name: String,
    pub service_ip: String,
    pub service_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// How often the process extends its own lease.
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age after which a peer is classified inactive.
    pub heartbeat_threshold_ms: u64,
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

impl NodeConfig {
    pub fn identity(&self) -> ServerIdentity {
        ServerIdentity {
            id: self.id,
            msid: self.msid,
            name: self.name.clone(),
            version: crate::version::VERSION.to_string(),
            service_ip: self.service_ip.clone(),
            service_port: self.service_port,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("node.name cannot be empty");
        }
        if self.service_ip.trim().is_empty() {
            anyhow::bail!("node.service_ip cannot be empty");
        }
        if self.service_port == 0 {
            anyhow::bail!("node.service_port must be > 0");
        }
        Ok(())
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_ms == 0 {
            anyhow::bail!("cluster.heartbeat_interval_ms must be > 0");
        }
        if self.heartbeat_threshold_ms <= self.heartbeat_interval_ms {
            anyhow::bail!(
                "cluster.heartbeat_threshold_ms ({}) must exceed cluster.heartbeat_interval_ms ({})",
                self.heartbeat_threshold_ms,
                self.heartbeat_interval_ms
            );
        }
        if self.sweep_interval_ms == 0 {
            anyhow::bail!("cluster.sweep_interval_ms must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("database.url", "sqlite://data/cluster.db")?
        .set_default("node.id", 1)?
        .set_default("node.msid", 1)?
        .set_default("node.name", "management-server")?
        .set_default("node.service_ip", "127.0.0.1")?
        .set_default("node.service_port", 8250)?
        .set_default("cluster.heartbeat_interval_ms", 1500u64)?
        .set_default("cluster.heartbeat_threshold_ms", 150_000u64)?
        .set_default("cluster.sweep_interval_ms", 10_000u64)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9464)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.node.name = app.node.name.trim().to_string();
    app.node.service_ip = app.node.service_ip.trim().to_string();
    app.node.validate()?;
    app.cluster.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_control_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        unsafe {
            for (key, _) in &existing {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }

        let result = panic::catch_unwind(test);

        unsafe {
            for (key, _) in vars {
                env::remove_var(key);
            }
            for (key, value) in existing {
                env::set_var(key, value);
            }
        }

        result.unwrap();
    }

    #[test]
    fn defaults_load_and_validate() {
        with_control_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.node.id, 1);
            assert_eq!(cfg.cluster.heartbeat_interval_ms, 1500);
            assert!(cfg.cluster.heartbeat_threshold_ms > cfg.cluster.heartbeat_interval_ms);
            assert_eq!(cfg.metrics.port, 9464);
        });
    }

    #[test]
    fn env_overrides_node_identity() {
        with_control_plane_env(
            &[
                ("CLUSTER_CP__NODE__ID", "7"),
                ("CLUSTER_CP__NODE__MSID", "345049103441"),
                ("CLUSTER_CP__NODE__NAME", "  ms-east-1  "),
                ("CLUSTER_CP__NODE__SERVICE_PORT", "9090"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.node.id, 7);
                assert_eq!(cfg.node.msid, 345049103441);
                assert_eq!(cfg.node.name, "ms-east-1");

                let identity = cfg.node.identity();
                assert_eq!(identity.service_port, 9090);
                assert_eq!(identity.version, crate::version::VERSION);
            },
        );
    }

    #[test]
    fn threshold_must_exceed_interval() {
        with_control_plane_env(
            &[
                ("CLUSTER_CP__CLUSTER__HEARTBEAT_INTERVAL_MS", "5000"),
                ("CLUSTER_CP__CLUSTER__HEARTBEAT_THRESHOLD_MS", "5000"),
            ],
            || {
                let err = load().expect_err("threshold equal to interval");
                assert!(err.to_string().contains("heartbeat_threshold_ms"));
            },
        );
    }

    #[test]
    fn empty_node_name_is_rejected() {
        with_control_plane_env(&[("CLUSTER_CP__NODE__NAME", "   ")], || {
            let err = load().expect_err("blank name");
            assert!(err.to_string().contains("node.name"));
        });
    }
}
