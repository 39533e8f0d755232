//! Time-series store of hourly network estimates.
//!
//! A separate SQLite file holding one row per completed bucket, keyed by the
//! bucket's end. Its last row is the aggregator's progress marker.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use fcp::ProbeErrorType;
use libsql::{Connection, Database, Value, params};

use super::estimator::SizeEstimate;
use crate::database::{
    Commit, GatewayError, StoreError, enable_wal, open_database, set_busy_timeout,
};

/// Length of one bucket in seconds
pub const BUCKET_SECS: i64 = 3600;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS series_meta (start INTEGER NOT NULL, step INTEGER NOT NULL);
CREATE TABLE IF NOT EXISTS series (
    bucket_end INTEGER PRIMARY KEY,
    instantaneous_size REAL,
    daily_size REAL,
    effective_size REAL,
    store_capacity REAL,
    refused INTEGER NOT NULL,
    error_disconnected INTEGER NOT NULL,
    error_overload INTEGER NOT NULL,
    error_timeout INTEGER NOT NULL,
    error_unknown INTEGER NOT NULL,
    error_unrecognized INTEGER NOT NULL,
    error_cannot_forward INTEGER NOT NULL
);
";

/// Derived values for one bucket `[bucket_end - BUCKET_SECS, bucket_end)`
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRow {
    pub bucket_end: i64,
    pub instantaneous_size: SizeEstimate,
    pub daily_size: SizeEstimate,
    pub effective_size: SizeEstimate,
    /// Bytes; `None` without a weekly estimate or store size samples
    pub store_capacity: Option<f64>,
    pub refused: u64,
    /// Indexed by [`ProbeErrorType::code`]
    pub errors: [u64; ProbeErrorType::ALL.len()],
}

pub struct SeriesStore {
    database: Database,
    busy_timeout: Duration,
}

impl SeriesStore {
    pub async fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let database = open_database(path.as_ref()).await?;
        let store = Self { database, busy_timeout };

        let conn = store.connect().await?;
        conn.execute_batch(SCHEMA).await?;
        enable_wal(&conn).await?;

        Ok(store)
    }

    pub async fn connect(&self) -> Result<Connection, StoreError> {
        let conn = self.database.connect()?;
        set_busy_timeout(&conn, self.busy_timeout).await?;
        Ok(conn)
    }
}

/// End of the last stored bucket, or the series start when no bucket is stored
pub async fn last_bucket_end(conn: &Connection) -> Result<Option<i64>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT COALESCE((SELECT MAX(bucket_end) FROM series), \
                             (SELECT start FROM series_meta LIMIT 1))",
            (),
        )
        .await?;
    match rows.next().await? {
        Some(row) => row.get::<Option<i64>>(0),
        None => Ok(None),
    }
}

/// Stored buckets ending after `after`, in order
pub async fn load_rows(conn: &Connection, after: i64) -> Result<Vec<BucketRow>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT bucket_end, instantaneous_size, daily_size, effective_size, store_capacity, \
                    refused, error_disconnected, error_overload, error_timeout, error_unknown, \
                    error_unrecognized, error_cannot_forward \
             FROM series WHERE bucket_end > ?1 ORDER BY bucket_end",
            params![after],
        )
        .await?;

    let size = |value: Option<f64>| match value {
        Some(size) => SizeEstimate::Estimated(size as u64),
        None => SizeEstimate::Undetermined,
    };

    let mut buckets = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut errors = [0u64; ProbeErrorType::ALL.len()];
        for (offset, count) in errors.iter_mut().enumerate() {
            *count = row.get::<i64>(6 + offset as i32)? as u64;
        }
        buckets.push(BucketRow {
            bucket_end: row.get(0)?,
            instantaneous_size: size(row.get(1)?),
            daily_size: size(row.get(2)?),
            effective_size: size(row.get(3)?),
            store_capacity: row.get(4)?,
            refused: row.get::<i64>(5)? as u64,
            errors,
        });
    }
    Ok(buckets)
}

/// Fixes where the series starts; a no-op once set
pub struct SeriesStart {
    pub start: i64,
}

#[async_trait]
impl Commit for SeriesStart {
    async fn apply(&self, conn: &Connection) -> Result<(), GatewayError> {
        conn.execute(
            "INSERT INTO series_meta (start, step) \
             SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM series_meta)",
            params![self.start, BUCKET_SECS],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Commit for BucketRow {
    /// Appends the row, refusing anything but the bucket right after the last one
    async fn apply(&self, conn: &Connection) -> Result<(), GatewayError> {
        let last = last_bucket_end(conn)
            .await?
            .ok_or_else(|| GatewayError::Rejected("series has no start".into()))?;
        if self.bucket_end != last + BUCKET_SECS {
            return Err(GatewayError::Rejected(format!(
                "bucket ending {} does not follow {}",
                self.bucket_end, last
            )));
        }

        let size = |estimate: SizeEstimate| {
            estimate.value().map_or(Value::Null, |size| Value::Real(size as f64))
        };
        let capacity = self.store_capacity.map_or(Value::Null, Value::Real);
        let count = |n: u64| Value::Integer(i64::try_from(n).unwrap_or(i64::MAX));

        conn.execute(
            "INSERT INTO series (bucket_end, instantaneous_size, daily_size, effective_size, \
                                 store_capacity, refused, error_disconnected, error_overload, \
                                 error_timeout, error_unknown, error_unrecognized, \
                                 error_cannot_forward) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                self.bucket_end,
                size(self.instantaneous_size),
                size(self.daily_size),
                size(self.effective_size),
                capacity,
                count(self.refused),
                count(self.errors[0]),
                count(self.errors[1]),
                count(self.errors[2]),
                count(self.errors[3]),
                count(self.errors[4]),
                count(self.errors[5])
            ],
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{GatewayConfig, GatewayHandle};

    fn row(bucket_end: i64) -> BucketRow {
        BucketRow {
            bucket_end,
            instantaneous_size: SizeEstimate::Estimated(120),
            daily_size: SizeEstimate::Undetermined,
            effective_size: SizeEstimate::Estimated(900),
            store_capacity: None,
            refused: 3,
            errors: [1, 0, 2, 0, 0, 5],
        }
    }

    #[tokio::test]
    async fn test_rows_append_contiguously_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeriesStore::open(dir.path().join("series.db"), Duration::from_millis(500))
            .await
            .unwrap();
        let (gateway, _worker) =
            GatewayHandle::spawn(store.connect().await.unwrap(), GatewayConfig::default());

        assert!(matches!(gateway.commit(row(3600)).await, Err(GatewayError::Rejected(_))));

        gateway.commit(SeriesStart { start: 7200 }).await.unwrap();
        gateway.commit(SeriesStart { start: 0 }).await.unwrap();
        let conn = store.connect().await.unwrap();
        assert_eq!(last_bucket_end(&conn).await.unwrap(), Some(7200));

        gateway.commit(row(10800)).await.unwrap();
        assert!(matches!(gateway.commit(row(10800)).await, Err(GatewayError::Rejected(_))));
        assert!(matches!(gateway.commit(row(18000)).await, Err(GatewayError::Rejected(_))));
        gateway.commit(row(14400)).await.unwrap();

        let rows = load_rows(&conn, i64::MIN).await.unwrap();
        assert_eq!(rows, vec![row(10800), row(14400)]);
        assert_eq!(last_bucket_end(&conn).await.unwrap(), Some(14400));
    }
}
