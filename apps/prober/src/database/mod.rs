//! Record store.
//!
//! Raw probe samples live in a versioned SQLite file. All writes go through a
//! single [`GatewayHandle`]; reads use a pool of WAL readers.

pub mod gateway;
pub mod migrations;
pub mod records;

pub use gateway::{Commit, GatewayConfig, GatewayError, GatewayHandle};
pub use records::ProbeRecord;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use libsql::{Connection, Database};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pool::{LibsqlManager, LibsqlPool, build_pool};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libsql::Error,
    },

    #[error("migration from version {from} failed: {source}")]
    Migration {
        from: i64,
        #[source]
        source: libsql::Error,
    },

    #[error("store is at schema version {found}, newer than the supported {supported}")]
    UnsupportedVersion { found: i64, supported: i64 },

    #[error("store has no schema_version table and an unrecognized user_version {found}")]
    UnrecognizedUserVersion { found: i64 },

    #[error(transparent)]
    Database(#[from] libsql::Error),
}

/// The probe record store
pub struct RecordStore {
    database: Arc<Database>,
    path: PathBuf,
    busy_timeout: Duration,
}

impl RecordStore {
    /// Open the store, bringing its schema up to date
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let database = Arc::new(open_database(&path).await?);
        let store = Self { database, path, busy_timeout };

        let conn = store.database.connect()?;
        set_busy_timeout(&conn, busy_timeout).await?;
        migrations::run_migrations(&conn).await?;
        enable_wal(&conn).await?;

        Ok(store)
    }

    /// A fresh connection meant to be handed to the gateway
    pub async fn writer(&self) -> Result<Connection, StoreError> {
        let conn = self.database.connect()?;
        set_busy_timeout(&conn, self.busy_timeout).await?;
        Ok(conn)
    }

    /// Pool of read connections for the aggregator and reports
    pub fn readers(&self, max_size: usize) -> anyhow::Result<LibsqlPool> {
        build_pool(LibsqlManager::new(Arc::clone(&self.database), self.busy_timeout), max_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

pub(crate) async fn open_database(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        // A missing directory surfaces as an open error below.
        let _ = std::fs::create_dir_all(parent);
    }

    libsql::Builder::new_local(path)
        .build()
        .await
        .map_err(|source| StoreError::Open { path: path.to_path_buf(), source })
}

/// PRAGMAs return a row, so they go through `query`.
pub(crate) async fn set_busy_timeout(
    conn: &Connection,
    timeout: Duration,
) -> Result<(), libsql::Error> {
    let millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    let mut rows = conn.query(&format!("PRAGMA busy_timeout = {millis}"), ()).await?;
    while rows.next().await?.is_some() {}
    Ok(())
}

/// Switch to write-ahead logging so readers never block the writer.
pub(crate) async fn enable_wal(conn: &Connection) -> Result<(), libsql::Error> {
    let mut rows = conn.query("PRAGMA journal_mode = WAL", ()).await?;
    let mode = match rows.next().await? {
        Some(row) => row.get::<String>(0)?,
        None => String::new(),
    };

    if mode.eq_ignore_ascii_case("wal") {
        debug!("journal mode is WAL");
    } else {
        warn!(%mode, "store did not switch to WAL journaling");
    }
    Ok(())
}
