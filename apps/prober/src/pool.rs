use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{self, Pool, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError};

/// Hands out read connections to the record store
pub struct LibsqlManager {
    database: Arc<Database>,
    busy_timeout: Duration,
}

impl LibsqlManager {
    pub fn new(database: Arc<Database>, busy_timeout: Duration) -> Self {
        Self { database, busy_timeout }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        crate::database::set_busy_timeout(&conn, self.busy_timeout).await?;
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        conn.query("SELECT 1", ()).await?.next().await?.ok_or(LibsqlError::QueryReturnedNoRows)?;
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

pub fn build_pool(manager: LibsqlManager, max_size: usize) -> anyhow::Result<LibsqlPool> {
    Ok(Pool::builder(manager).max_size(max_size).build()?)
}
