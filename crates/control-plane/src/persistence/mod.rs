use sqlx::SqlitePool;

pub mod migrations;
pub mod mshost;

pub type Db = SqlitePool;

pub use migrations::{MigrationLabel, SchemaStatus, SchemaUpgrade};
pub use mshost::{ManagementServerRecord, ManagementServerState, ServerIdentity};
