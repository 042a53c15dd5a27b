use sqlx::Error as SqlxError;
use thiserror::Error;

/// Failure of a membership store operation.
///
/// `Fencing` means another session owns the row; the caller must stop acting as the owner and
/// re-register. `Unavailable` means the store could not be reached and the write may be retried.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("invalid cluster session detected: runid {runid} is no longer valid for node {id}")]
    Fencing { id: i64, runid: i64 },
    #[error("membership store unavailable: {0}")]
    Unavailable(#[source] SqlxError),
    #[error("membership store error: {0}")]
    Database(#[source] SqlxError),
}

pub type MembershipResult<T> = std::result::Result<T, MembershipError>;

impl MembershipError {
    pub fn is_fencing(&self) -> bool {
        matches!(self, MembershipError::Fencing { .. })
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, MembershipError::Unavailable(_))
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MembershipError::Fencing { .. } => "fenced",
            MembershipError::Unavailable(_) => "unavailable",
            MembershipError::Database(_) => "database",
        }
    }
}

impl From<SqlxError> for MembershipError {
    fn from(err: SqlxError) -> Self {
        crate::telemetry::record_db_error(&err);
        if is_connectivity_error(&err) {
            MembershipError::Unavailable(err)
        } else {
            MembershipError::Database(err)
        }
    }
}

// Primary SQLite result codes meaning the file could not be used right now.
const SQLITE_BUSY: u32 = 5;
const SQLITE_LOCKED: u32 = 6;
const SQLITE_IOERR: u32 = 10;
const SQLITE_CANTOPEN: u32 = 14;
const SQLITE_PROTOCOL: u32 = 15;

fn is_connectivity_error(err: &SqlxError) -> bool {
    match err {
        SqlxError::PoolTimedOut | SqlxError::PoolClosed => true,
        SqlxError::Io(_) | SqlxError::Tls(_) => true,
        SqlxError::Database(db_err) => {
            is_unreachable_store(db_err.code().as_deref(), db_err.message())
        }
        _ => false,
    }
}

/// `code` is SQLite's extended result code; its low byte is the primary code.
fn is_unreachable_store(code: Option<&str>, message: &str) -> bool {
    let primary = code.and_then(|c| c.parse::<u32>().ok()).map(|c| c & 0xff);
    if let Some(primary) = primary {
        return matches!(
            primary,
            SQLITE_BUSY | SQLITE_LOCKED | SQLITE_IOERR | SQLITE_CANTOPEN | SQLITE_PROTOCOL
        );
    }

    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_io_codes_mean_the_store_is_unreachable() {
        assert!(is_unreachable_store(Some("5"), "database is locked"));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_unreachable_store(Some("517"), "database is busy"));
        // SQLITE_IOERR_SHORT_READ
        assert!(is_unreachable_store(Some("522"), "disk I/O error"));
        assert!(is_unreachable_store(None, "database is locked"));
    }

    #[test]
    fn constraint_failures_are_plain_database_errors() {
        // SQLITE_CONSTRAINT_PRIMARYKEY
        assert!(!is_unreachable_store(
            Some("1555"),
            "UNIQUE constraint failed: mshost.id"
        ));
        assert!(!is_unreachable_store(Some("1"), "near \"SELEC\": syntax error"));
        assert!(!is_unreachable_store(None, "no such table: mshost"));
    }

    #[test]
    fn pool_timeouts_are_connectivity_loss_not_fencing() {
        let err = MembershipError::from(SqlxError::PoolTimedOut);
        assert!(err.is_unavailable());
        assert!(!err.is_fencing());
        assert_eq!(err.kind(), "unavailable");

        let err = MembershipError::from(SqlxError::RowNotFound);
        assert!(!err.is_unavailable());
        assert_eq!(err.kind(), "database");
    }

    #[test]
    fn fencing_error_names_the_stale_session() {
        let err = MembershipError::Fencing { id: 1, runid: 99 };
        assert!(err.is_fencing());
        assert!(err.to_string().contains("runid 99"));
    }
}
