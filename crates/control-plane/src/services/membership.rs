use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::{MembershipError, MembershipResult};
use crate::persistence::{
    Db, ManagementServerState, ServerIdentity, mshost as membership_store,
};
use crate::telemetry;

/// One management-server session: the identity it registered and the runid that fences it.
#[derive(Debug)]
pub struct ClusterMembership {
    db: Db,
    identity: ServerIdentity,
    runid: i64,
    heartbeat_interval: Duration,
}

impl ClusterMembership {
    /// Claim the node row under a fresh runid and move it from Starting to Up.
    pub async fn join(
        db: Db,
        identity: ServerIdentity,
        heartbeat_interval: Duration,
    ) -> MembershipResult<Self> {
        let runid = membership_store::new_runid();
        let now = Utc::now();
        membership_store::register(&db, &identity, runid, now).await?;
        membership_store::update_state(&db, identity.id, runid, ManagementServerState::Up, now)
            .await?;

        info!(
            id = identity.id,
            msid = identity.msid,
            runid,
            name = %identity.name,
            "joined management-server cluster"
        );

        Ok(Self {
            db,
            identity,
            runid,
            heartbeat_interval,
        })
    }

    pub fn id(&self) -> i64 {
        self.identity.id
    }

    pub fn runid(&self) -> i64 {
        self.runid
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Extend the lease and reassert Up, so a node the liveness sweep marked Down recovers
    /// as soon as it heartbeats again.
    pub async fn heartbeat_once(&self) -> MembershipResult<()> {
        let result = membership_store::heartbeat_with_identity(
            &self.db,
            &self.identity,
            self.runid,
            Utc::now(),
            ManagementServerState::Up,
        )
        .await;
        match &result {
            Ok(()) => telemetry::record_heartbeat_result("ok"),
            Err(err) if err.is_fencing() => telemetry::record_heartbeat_result("fenced"),
            Err(_) => telemetry::record_heartbeat_result("error"),
        }
        result
    }

    /// Heartbeat until shutdown. Returns the fencing error if the session is superseded;
    /// connectivity and other store errors are logged and retried on the next tick.
    pub async fn heartbeat_loop(&self, mut shutdown: watch::Receiver<bool>) -> MembershipResult<()> {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            match self.heartbeat_once().await {
                Ok(()) => {}
                Err(err) if err.is_fencing() => {
                    error!(
                        id = self.identity.id,
                        runid = self.runid,
                        "another session owns this node; stopping heartbeats"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        id = self.identity.id,
                        runid = self.runid,
                        kind = err.kind(),
                        error = %err,
                        "heartbeat failed; retrying next interval"
                    );
                }
            }
        }
    }

    /// Graceful shutdown: soft-delete the node row if this session still owns it.
    pub async fn leave(self) -> MembershipResult<bool> {
        let current = membership_store::get(&self.db, self.identity.id).await?;
        if current.as_ref().map(|row| row.runid) != Some(self.runid) {
            return Err(MembershipError::Fencing {
                id: self.identity.id,
                runid: self.runid,
            });
        }

        let removed = membership_store::remove(&self.db, self.identity.id).await?;
        info!(
            id = self.identity.id,
            runid = self.runid,
            removed,
            "left management-server cluster"
        );
        Ok(removed)
    }
}
