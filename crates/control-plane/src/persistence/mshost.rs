//! Durable management-server membership rows.
//!
//! Every mutation made on behalf of a running session goes through a conditional
//! `UPDATE ... WHERE id = ? AND runid = ?`; zero affected rows means the session was
//! superseded (or invalidated) and is reported as [`MembershipError::Fencing`].

use chrono::{DateTime, Utc};
use rand::Rng;
use sqlx::{FromRow, QueryBuilder};
use tracing::{debug, warn};

use super::Db;
use crate::error::{MembershipError, MembershipResult};

/// runid stored for sessions that were explicitly invalidated.
pub const INVALID_RUNID: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum ManagementServerState {
    Starting,
    Up,
    Down,
}

impl ManagementServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementServerState::Starting => "Starting",
            ManagementServerState::Up => "Up",
            ManagementServerState::Down => "Down",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ManagementServerRecord {
    pub id: i64,
    pub msid: i64,
    pub runid: i64,
    pub name: String,
    pub state: ManagementServerState,
    pub version: String,
    pub service_ip: String,
    pub service_port: u16,
    pub last_update: DateTime<Utc>,
    pub removed: Option<DateTime<Utc>>,
    pub alert_count: i64,
}

/// Identity fields a management-server process claims when it registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub id: i64,
    pub msid: i64,
    pub name: String,
    pub version: String,
    pub service_ip: String,
    pub service_port: u16,
}

/// Fresh session token for a starting process. Never returns [`INVALID_RUNID`].
pub fn new_runid() -> i64 {
    rand::rng().random_range(1..i64::MAX)
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        msid,
        runid,
        name,
        state,
        version,
        service_ip,
        service_port,
        last_update,
        removed,
        alert_count
    FROM mshost
"#;

/// Claim the row for a new session. Not fenced: the new runid supersedes whatever was stored.
pub async fn register(
    pool: &Db,
    identity: &ServerIdentity,
    runid: i64,
    now: DateTime<Utc>,
) -> MembershipResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mshost (
            id,
            msid,
            runid,
            name,
            state,
            version,
            service_ip,
            service_port,
            last_update,
            removed,
            alert_count
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 0)
        ON CONFLICT(id) DO UPDATE SET
            msid = excluded.msid,
            runid = excluded.runid,
            name = excluded.name,
            state = excluded.state,
            version = excluded.version,
            service_ip = excluded.service_ip,
            service_port = excluded.service_port,
            last_update = excluded.last_update,
            removed = NULL,
            alert_count = 0
        "#,
    )
    .bind(identity.id)
    .bind(identity.msid)
    .bind(runid)
    .bind(&identity.name)
    .bind(ManagementServerState::Starting)
    .bind(&identity.version)
    .bind(&identity.service_ip)
    .bind(identity.service_port)
    .bind(now)
    .execute(pool)
    .await?;

    debug!(id = identity.id, msid = identity.msid, runid, "registered management server");
    Ok(())
}

/// Extend the session's lease.
pub async fn heartbeat(pool: &Db, id: i64, runid: i64, now: DateTime<Utc>) -> MembershipResult<()> {
    if runid == INVALID_RUNID {
        return Err(MembershipError::Fencing { id, runid });
    }

    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET last_update = ?3, removed = NULL, alert_count = 0
        WHERE id = ?1 AND runid = ?2
        "#,
    )
    .bind(id)
    .bind(runid)
    .bind(now)
    .execute(pool)
    .await?;

    fenced(id, runid, result.rows_affected())
}

/// Extend the lease and rewrite identity fields plus state in one fenced write.
pub async fn heartbeat_with_identity(
    pool: &Db,
    identity: &ServerIdentity,
    runid: i64,
    now: DateTime<Utc>,
    state: ManagementServerState,
) -> MembershipResult<()> {
    if runid == INVALID_RUNID {
        return Err(MembershipError::Fencing {
            id: identity.id,
            runid,
        });
    }

    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET
            name = ?3,
            version = ?4,
            service_ip = ?5,
            service_port = ?6,
            last_update = ?7,
            state = ?8,
            removed = NULL,
            alert_count = 0
        WHERE id = ?1 AND runid = ?2
        "#,
    )
    .bind(identity.id)
    .bind(runid)
    .bind(&identity.name)
    .bind(&identity.version)
    .bind(&identity.service_ip)
    .bind(identity.service_port)
    .bind(now)
    .bind(state)
    .execute(pool)
    .await?;

    fenced(identity.id, runid, result.rows_affected())
}

/// Fenced state transition, e.g. Starting to Up once the session is established.
pub async fn update_state(
    pool: &Db,
    id: i64,
    runid: i64,
    state: ManagementServerState,
    now: DateTime<Utc>,
) -> MembershipResult<()> {
    if runid == INVALID_RUNID {
        return Err(MembershipError::Fencing { id, runid });
    }

    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET state = ?3, last_update = ?4
        WHERE id = ?1 AND runid = ?2
        "#,
    )
    .bind(id)
    .bind(runid)
    .bind(state)
    .bind(now)
    .execute(pool)
    .await?;

    fenced(id, runid, result.rows_affected())
}

/// Surrender a session: zero the runid and force the node Down.
///
/// Returns the number of rows changed; zero means the session was already superseded.
pub async fn invalidate_session(pool: &Db, id: i64, runid: i64) -> MembershipResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET runid = ?3, state = ?4
        WHERE id = ?1 AND runid = ?2
        "#,
    )
    .bind(id)
    .bind(runid)
    .bind(INVALID_RUNID)
    .bind(ManagementServerState::Down)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

pub async fn increase_alert_count(pool: &Db, id: i64) -> MembershipResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET alert_count = alert_count + 1
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Non-removed nodes whose last heartbeat is newer than `cutoff`.
pub async fn list_active(
    pool: &Db,
    cutoff: DateTime<Utc>,
) -> MembershipResult<Vec<ManagementServerRecord>> {
    let records = sqlx::query_as::<_, ManagementServerRecord>(&format!(
        "{SELECT_COLUMNS} WHERE last_update > ?1 AND removed IS NULL ORDER BY id ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Non-removed nodes whose last heartbeat is at or before `cutoff`.
pub async fn list_inactive(
    pool: &Db,
    cutoff: DateTime<Utc>,
) -> MembershipResult<Vec<ManagementServerRecord>> {
    let records = sqlx::query_as::<_, ManagementServerRecord>(&format!(
        "{SELECT_COLUMNS} WHERE last_update <= ?1 AND removed IS NULL ORDER BY last_update ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Looks up by cluster-wide msid, removed rows included.
pub async fn find_by_msid(pool: &Db, msid: i64) -> MembershipResult<Option<ManagementServerRecord>> {
    let record = sqlx::query_as::<_, ManagementServerRecord>(&format!(
        "{SELECT_COLUMNS} WHERE msid = ?1 ORDER BY id ASC LIMIT 1"
    ))
    .bind(msid)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn get(pool: &Db, id: i64) -> MembershipResult<Option<ManagementServerRecord>> {
    let record = sqlx::query_as::<_, ManagementServerRecord>(&format!(
        "{SELECT_COLUMNS} WHERE id = ?1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(record)
}

pub async fn list_all(pool: &Db) -> MembershipResult<Vec<ManagementServerRecord>> {
    let records = sqlx::query_as::<_, ManagementServerRecord>(&format!(
        "{SELECT_COLUMNS} ORDER BY id ASC"
    ))
    .fetch_all(pool)
    .await?;

    Ok(records)
}

/// Non-removed nodes in any of `states`.
pub async fn list_by_state(
    pool: &Db,
    states: &[ManagementServerState],
) -> MembershipResult<Vec<ManagementServerRecord>> {
    if states.is_empty() {
        return Ok(Vec::new());
    }

    let mut qb = QueryBuilder::<sqlx::Sqlite>::new(SELECT_COLUMNS);
    qb.push(" WHERE removed IS NULL AND state IN (");
    let mut separated = qb.separated(", ");
    for state in states {
        separated.push_bind(*state);
    }
    separated.push_unseparated(") ORDER BY id ASC");

    let records = qb
        .build_query_as::<ManagementServerRecord>()
        .fetch_all(pool)
        .await?;
    Ok(records)
}

/// Liveness-sweep transition: force Down only if the row is still stale when the write lands.
pub async fn mark_down_if_stale(
    pool: &Db,
    id: i64,
    cutoff: DateTime<Utc>,
) -> MembershipResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE mshost
        SET state = ?2
        WHERE id = ?1
          AND state != ?2
          AND removed IS NULL
          AND last_update <= ?3
        "#,
    )
    .bind(id)
    .bind(ManagementServerState::Down)
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Soft-delete: force Down, then stamp `removed`, as one transaction.
///
/// Returns `false` when the row does not exist or is already removed; nothing is changed then.
pub async fn remove(pool: &Db, id: i64) -> MembershipResult<bool> {
    let mut tx = pool.begin().await?;

    let downed = sqlx::query(
        r#"
        UPDATE mshost
        SET state = ?2
        WHERE id = ?1 AND removed IS NULL
        "#,
    )
    .bind(id)
    .bind(ManagementServerState::Down)
    .execute(&mut *tx)
    .await?;

    if downed.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        UPDATE mshost
        SET removed = ?2
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(true)
}

fn fenced(id: i64, runid: i64, rows_affected: u64) -> MembershipResult<()> {
    if rows_affected == 0 {
        warn!(id, runid, "membership write rejected; session is no longer valid");
        return Err(MembershipError::Fencing { id, runid });
    }
    Ok(())
}
