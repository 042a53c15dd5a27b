use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{AppConfig, HostConfig, IpmiConfig};
use crate::runtime::{ChannelCommand, ChannelError, CommandRunner, ControlChannel, RetryPolicy};

pub(crate) fn base_host() -> HostConfig {
    HostConfig {
        name: "bm-host-1".into(),
        guid: Some("bm-host-1-guid".into()),
        zone: Some("zone-1".into()),
        pod: Some("pod-1".into()),
        cluster: Some("cluster-1".into()),
        agent_ip: Some("10.0.0.5".into()),
        mac: "00:11:ba:33:aa:dd".into(),
        username: "admin".into(),
        password: "secret".into(),
        cpu_number: 4,
        cpu_speed_mhz: 2400,
        memory_mb: 2048,
        vm_name: None,
    }
}

pub(crate) fn base_config() -> AppConfig {
    AppConfig {
        host: base_host(),
        ipmi: IpmiConfig {
            script_path: "/bin/true".into(),
            interpreter: "sh".into(),
            timeout_secs: 5,
            max_attempts: 5,
            stop_max_rounds: 10,
            stop_poll_interval_ms: 0,
            ping_retry_delay_ms: 0,
        },
        host_id: 42,
        status_interval_secs: 3600,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
    }
}

pub(crate) fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        stop_poll_interval: Duration::ZERO,
        ..RetryPolicy::default()
    }
}

pub(crate) fn runner_for(channel: &ScriptedChannel) -> CommandRunner {
    CommandRunner::new(Arc::new(channel.clone()), fast_policy())
}

/// Replays queued results in order and records every command label it receives.
/// An exhausted queue answers with a non-transient failure.
#[derive(Clone, Default)]
pub(crate) struct ScriptedChannel {
    responses: Arc<StdMutex<VecDeque<Result<String, String>>>>,
    calls: Arc<StdMutex<Vec<String>>>,
}

impl ScriptedChannel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_ok(&self, output: &str) {
        self.responses
            .lock()
            .expect("lock")
            .push_back(Ok(output.to_string()));
    }

    pub(crate) fn push_err(&self, output: &str) {
        self.responses
            .lock()
            .expect("lock")
            .push_back(Err(output.to_string()));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ControlChannel for ScriptedChannel {
    async fn execute(&self, cmd: &ChannelCommand) -> Result<String, ChannelError> {
        self.calls.lock().expect("lock").push(cmd.label());
        let next = self.responses.lock().expect("lock").pop_front();
        match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(output)) => Err(ChannelError::Failed {
                verb: cmd.verb,
                output,
            }),
            None => Err(ChannelError::Failed {
                verb: cmd.verb,
                output: "no scripted response".into(),
            }),
        }
    }
}
