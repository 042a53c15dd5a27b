use std::collections::HashMap;
use std::sync::Arc;

use common::api::{StateChanges, VmState};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::runtime::{CommandRunner, ipmi};
use crate::telemetry;

/// What a fresh observation does to the recorded state of the tracked VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Externally caused change: record it and report it.
    RecordAndReport,
    /// Expected settle of a locally issued command: record it, report nothing.
    RecordSilently,
    /// Stale read inside a Starting/Stopping window.
    Ignore,
    /// Prior state can never be reached by this host class.
    Anomaly,
    Unchanged,
}

impl Reconciliation {
    pub fn records(&self) -> bool {
        matches!(
            self,
            Reconciliation::RecordAndReport | Reconciliation::RecordSilently
        )
    }

    pub fn reports(&self) -> bool {
        matches!(self, Reconciliation::RecordAndReport)
    }
}

pub fn reconcile(old: Option<VmState>, new: VmState) -> Reconciliation {
    use VmState::*;

    match (old, new) {
        (None, _) => Reconciliation::RecordAndReport,
        (Some(Migrating), _) => Reconciliation::Anomaly,
        (Some(Starting), Running) | (Some(Stopping), Stopped) => Reconciliation::RecordSilently,
        (Some(Starting), Stopped) | (Some(Stopping), Running) => Reconciliation::Ignore,
        (Some(old), new) if old == new => Reconciliation::Unchanged,
        (Some(_), _) => Reconciliation::RecordAndReport,
    }
}

#[derive(Debug, Default)]
struct HostAgentState {
    tracked_vm: Option<String>,
    states: HashMap<String, VmState>,
}

/// Last-known power state of the guest this host manages.
///
/// The lock is never held across a control-channel call: observations run first,
/// then classify-and-record happens in one critical section.
#[derive(Clone)]
pub struct VmStateTracker {
    inner: Arc<Mutex<HostAgentState>>,
    runner: CommandRunner,
}

impl VmStateTracker {
    pub fn new(runner: CommandRunner, tracked_vm: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HostAgentState {
                tracked_vm,
                states: HashMap::new(),
            })),
            runner,
        }
    }

    pub async fn observe(&self) -> Result<VmState, AgentError> {
        self.runner.query_power(&ipmi::ping()).await
    }

    pub async fn tracked_vm(&self) -> Option<String> {
        self.inner.lock().await.tracked_vm.clone()
    }

    pub async fn track(&self, vm_name: &str) {
        self.inner.lock().await.tracked_vm = Some(vm_name.to_string());
    }

    pub async fn lookup(&self, vm_name: &str) -> Option<VmState> {
        self.inner.lock().await.states.get(vm_name).copied()
    }

    pub async fn record(&self, vm_name: &str, state: VmState) -> Option<VmState> {
        self.inner
            .lock()
            .await
            .states
            .insert(vm_name.to_string(), state)
    }

    pub async fn remove(&self, vm_name: &str) -> Option<VmState> {
        self.inner.lock().await.states.remove(vm_name)
    }

    /// Unconditional report of the tracked VM, sent once per (re)connect.
    pub async fn full_sync(&self) -> StateChanges {
        let mut changes = StateChanges::new();
        let Some(vm_name) = self.tracked_vm().await else {
            return changes;
        };

        match self.observe().await {
            Ok(state) => {
                self.record(&vm_name, state).await;
                changes.insert(vm_name, state);
            }
            Err(err) => {
                warn!(
                    vm = %vm_name,
                    kind = err.kind(),
                    error = %err,
                    "full sync could not read power state"
                );
            }
        }
        changes
    }

    /// Reportable changes since the previous poll, or `None` when nothing is tracked or the
    /// observation was inconclusive.
    pub async fn delta_sync(&self) -> Option<StateChanges> {
        let vm_name = self.tracked_vm().await?;

        let observed = match self.observe().await {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    vm = %vm_name,
                    kind = err.kind(),
                    error = %err,
                    "cannot get power state; assuming unchanged"
                );
                return None;
            }
        };

        let mut guard = self.inner.lock().await;
        let old = guard.states.get(&vm_name).copied();
        let decision = reconcile(old, observed);

        match decision {
            Reconciliation::Ignore => debug!(
                vm = %vm_name,
                ?old,
                ?observed,
                "ignoring stale power read inside transition window"
            ),
            Reconciliation::Anomaly => warn!(
                vm = %vm_name,
                ?old,
                ?observed,
                "bare-metal guest recorded as migrating"
            ),
            _ => {}
        }

        if decision.records() {
            guard.states.insert(vm_name.clone(), observed);
        }
        drop(guard);

        let mut changes = StateChanges::new();
        if decision.reports() {
            telemetry::record_state_change(observed);
            changes.insert(vm_name, observed);
        }
        Some(changes)
    }
}
