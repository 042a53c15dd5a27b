use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use sqlx::migrate::{AppliedMigration, Migrate, Migrator};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};

use super::Db;
use crate::Result;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// How long a writer waits on a locked database before the statement fails as busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationLabel {
    pub version: i64,
    pub description: String,
}

/// Schema version recorded in the database versus the one compiled into the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current: Option<i64>,
    pub target: Option<i64>,
    pub pending: Vec<MigrationLabel>,
}

impl SchemaStatus {
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SchemaUpgrade {
    pub status: SchemaStatus,
    pub applied: Vec<MigrationLabel>,
}

/// Open the membership database.
///
/// `sqlite::memory:` resolves to a fresh temp file behind a single connection, so every
/// statement in a test observes the same data.
pub async fn init_pool(database_url: &str) -> Result<Db> {
    let in_memory = database_url.starts_with("sqlite::memory");

    let options = if in_memory {
        let path = std::env::temp_dir().join(format!(
            "mshost-{}-{:016x}.sqlite",
            std::process::id(),
            rand::random::<u64>()
        ));
        SqliteConnectOptions::new().filename(path)
    } else {
        if let Some(parent) = database_file(database_url).as_deref().and_then(|p| p.parent())
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        SqliteConnectOptions::from_str(database_url)?.journal_mode(SqliteJournalMode::Wal)
    };
    let options = options.create_if_missing(true).busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}

fn database_file(database_url: &str) -> Option<PathBuf> {
    let path = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Compare applied migrations with the embedded set, refusing unknown or altered ones.
pub async fn schema_status(pool: &Db) -> Result<SchemaStatus> {
    let applied = applied_migrations(pool).await?;

    for record in &applied {
        let Some(known) = MIGRATOR.iter().find(|m| m.version == record.version) else {
            anyhow::bail!("database has unknown migration version {}", record.version);
        };
        if known.checksum != record.checksum {
            anyhow::bail!(
                "migration {} checksum mismatch between database and binary",
                record.version
            );
        }
    }

    let pending = MIGRATOR
        .iter()
        .filter(|m| applied.iter().all(|a| a.version != m.version))
        .map(|m| MigrationLabel {
            version: m.version,
            description: m.description.to_string(),
        })
        .collect();

    Ok(SchemaStatus {
        current: applied.iter().map(|a| a.version).max(),
        target: MIGRATOR.iter().map(|m| m.version).max(),
        pending,
    })
}

pub async fn run_migrations(pool: &Db) -> Result<SchemaUpgrade> {
    let before = schema_status(pool).await?;
    if before.is_current() {
        return Ok(SchemaUpgrade {
            status: before,
            applied: Vec::new(),
        });
    }

    MIGRATOR
        .run(pool)
        .await
        .context("applying database migrations failed")?;

    let status = schema_status(pool).await?;
    Ok(SchemaUpgrade {
        status,
        applied: before.pending,
    })
}

async fn applied_migrations(pool: &Db) -> Result<Vec<AppliedMigration>> {
    let mut conn = pool.acquire().await?;
    conn.ensure_migrations_table()
        .await
        .context("ensure migrations table exists")?;

    if let Some(version) = conn.dirty_version().await? {
        anyhow::bail!("database is in a dirty migration state at version {version}");
    }

    Ok(conn
        .list_applied_migrations()
        .await
        .context("list applied migrations")?)
}
