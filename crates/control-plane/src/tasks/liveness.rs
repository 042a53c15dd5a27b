use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::MembershipResult;
use crate::persistence::{Db, mshost as membership_store};
use crate::telemetry;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LivenessReport {
    pub inactive: usize,
    pub alerted: usize,
    pub marked_down: usize,
}

pub async fn liveness_loop(
    db: Db,
    threshold: Duration,
    sweep_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            return;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            _ = interval.tick() => {}
        }

        match liveness_sweep(&db, threshold).await {
            Ok(report) => {
                telemetry::record_liveness_sweep(&report);
                debug!(
                    inactive = report.inactive,
                    marked_down = report.marked_down,
                    "liveness sweep completed"
                );
            }
            Err(err) => warn!(kind = err.kind(), error = %err, "liveness sweep failed"),
        }
    }
}

/// Classify nodes whose heartbeat is older than `threshold` and mark them Down.
pub async fn liveness_sweep(db: &Db, threshold: Duration) -> MembershipResult<LivenessReport> {
    let cutoff = Utc::now()
        - ChronoDuration::from_std(threshold)
            .unwrap_or_else(|_| ChronoDuration::seconds(threshold.as_secs() as i64));
    liveness_sweep_at(db, cutoff).await
}

pub async fn liveness_sweep_at(db: &Db, cutoff: DateTime<Utc>) -> MembershipResult<LivenessReport> {
    let inactive = membership_store::list_inactive(db, cutoff).await?;
    let mut report = LivenessReport {
        inactive: inactive.len(),
        ..LivenessReport::default()
    };

    for node in &inactive {
        report.alerted += membership_store::increase_alert_count(db, node.id).await? as usize;

        let updated = membership_store::mark_down_if_stale(db, node.id, cutoff).await?;
        if updated > 0 {
            report.marked_down += 1;
            warn!(
                id = node.id,
                msid = node.msid,
                last_update = %node.last_update,
                "marking management server down after missed heartbeats"
            );
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations::{init_pool, run_migrations};
    use crate::persistence::{ManagementServerState, ServerIdentity};
    use chrono::TimeZone;

    async fn setup() -> Db {
        let pool = init_pool("sqlite::memory:").await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0)
            .single()
            .expect("valid timestamp")
    }

    fn identity(id: i64) -> ServerIdentity {
        ServerIdentity {
            id,
            msid: id,
            name: format!("ms-{id}"),
            version: "test".into(),
            service_ip: "10.0.0.1".into(),
            service_port: 8250,
        }
    }

    #[tokio::test]
    async fn sweep_marks_only_stale_nodes_down() {
        let db = setup().await;
        membership_store::register(&db, &identity(1), 11, at(0)).await.unwrap();
        membership_store::register(&db, &identity(2), 12, at(100)).await.unwrap();
        membership_store::update_state(&db, 1, 11, ManagementServerState::Up, at(0))
            .await
            .unwrap();
        membership_store::update_state(&db, 2, 12, ManagementServerState::Up, at(100))
            .await
            .unwrap();

        let report = liveness_sweep_at(&db, at(50)).await.expect("sweep");
        assert_eq!(
            report,
            LivenessReport {
                inactive: 1,
                alerted: 1,
                marked_down: 1,
            }
        );

        let stale = membership_store::get(&db, 1).await.unwrap().unwrap();
        assert_eq!(stale.state, ManagementServerState::Down);
        assert_eq!(stale.alert_count, 1);
        let fresh = membership_store::get(&db, 2).await.unwrap().unwrap();
        assert_eq!(fresh.state, ManagementServerState::Up);
        assert_eq!(fresh.alert_count, 0);
    }

    #[tokio::test]
    async fn repeated_sweeps_keep_alerting_but_mark_down_once() {
        let db = setup().await;
        membership_store::register(&db, &identity(1), 11, at(0)).await.unwrap();

        let first = liveness_sweep_at(&db, at(50)).await.expect("first sweep");
        let second = liveness_sweep_at(&db, at(60)).await.expect("second sweep");
        assert_eq!(first.marked_down, 1);
        assert_eq!(second.marked_down, 0);
        assert_eq!(second.alerted, 1);
        assert_eq!(membership_store::get(&db, 1).await.unwrap().unwrap().alert_count, 2);

        membership_store::heartbeat(&db, 1, 11, at(70)).await.expect("recovers");
        let row = membership_store::get(&db, 1).await.unwrap().unwrap();
        assert_eq!(row.alert_count, 0);
    }

    #[tokio::test]
    async fn liveness_loop_stops_on_shutdown() {
        let db = setup().await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(liveness_loop(
            db,
            Duration::from_secs(60),
            Duration::from_millis(5),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .expect("task joins");
    }
}
