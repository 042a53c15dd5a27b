#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use node_agent::config::{AppConfig, HostConfig, IpmiConfig};
use node_agent::runtime::{
    ChannelCommand, ChannelError, CommandRunner, ControlChannel, RetryPolicy,
};

pub const LAN_DOWN: &str = "Error: Unable to establish LAN session";
pub const POWER_ON: &str = "Chassis Power is on";
pub const POWER_OFF: &str = "Chassis Power is off";

/// In-memory BMC: answers queued per verb, falls back to a default, records every call.
#[derive(Clone, Default)]
pub struct FakeBmc {
    inner: Arc<Mutex<FakeBmcState>>,
}

#[derive(Default)]
struct FakeBmcState {
    queued: Vec<(&'static str, VecDeque<Result<String, String>>)>,
    fallback: Vec<(&'static str, Result<String, String>)>,
    calls: Vec<String>,
}

impl FakeBmc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, verb: &'static str, result: Result<&str, &str>) {
        let result = result.map(str::to_string).map_err(str::to_string);
        let mut state = self.inner.lock().expect("lock");
        match state.queued.iter_mut().find(|(v, _)| *v == verb) {
            Some((_, queue)) => queue.push_back(result),
            None => state.queued.push((verb, VecDeque::from([result]))),
        }
    }

    pub fn queue_many(&self, verb: &'static str, result: Result<&str, &str>, times: usize) {
        for _ in 0..times {
            self.queue(verb, result);
        }
    }

    /// Answer used once the queue for `verb` is empty.
    pub fn always(&self, verb: &'static str, result: Result<&str, &str>) {
        let result = result.map(str::to_string).map_err(str::to_string);
        let mut state = self.inner.lock().expect("lock");
        state.fallback.retain(|(v, _)| *v != verb);
        state.fallback.push((verb, result));
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().expect("lock").calls.clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls().iter().filter(|call| *call == label).count()
    }
}

#[async_trait]
impl ControlChannel for FakeBmc {
    async fn execute(&self, cmd: &ChannelCommand) -> Result<String, ChannelError> {
        let mut state = self.inner.lock().expect("lock");
        state.calls.push(cmd.label());

        let queued = state
            .queued
            .iter_mut()
            .find(|(v, _)| *v == cmd.verb)
            .and_then(|(_, queue)| queue.pop_front());
        let result = queued.or_else(|| {
            state
                .fallback
                .iter()
                .find(|(v, _)| *v == cmd.verb)
                .map(|(_, r)| r.clone())
        });

        match result {
            Some(Ok(output)) => Ok(output),
            Some(Err(output)) => Err(ChannelError::Failed {
                verb: cmd.verb,
                output,
            }),
            None => Err(ChannelError::Failed {
                verb: cmd.verb,
                output: format!("fake bmc has no answer for {}", cmd.label()),
            }),
        }
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        stop_poll_interval: Duration::ZERO,
        ..RetryPolicy::default()
    }
}

pub fn runner(bmc: &FakeBmc) -> CommandRunner {
    CommandRunner::new(Arc::new(bmc.clone()), fast_policy())
}

pub fn test_config() -> AppConfig {
    AppConfig {
        host: HostConfig {
            name: "bm-itest".into(),
            guid: Some("bm-itest-guid".into()),
            zone: Some("zone-1".into()),
            pod: Some("pod-1".into()),
            cluster: Some("cluster-1".into()),
            agent_ip: Some("192.0.2.10".into()),
            mac: "00:11:ba:33:aa:dd".into(),
            username: "admin".into(),
            password: "secret".into(),
            cpu_number: 16,
            cpu_speed_mhz: 2600,
            memory_mb: 65536,
            vm_name: None,
        },
        ipmi: IpmiConfig {
            script_path: "/nonexistent/ipmi.py".into(),
            interpreter: "python3".into(),
            timeout_secs: 5,
            max_attempts: 5,
            stop_max_rounds: 10,
            stop_poll_interval_ms: 0,
            ping_retry_delay_ms: 0,
        },
        host_id: 11,
        status_interval_secs: 1,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
    }
}
