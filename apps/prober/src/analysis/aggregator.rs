//! Incremental catch-up over fixed one-hour buckets.
//!
//! Each pass resumes after the last bucket in the time-series store and
//! appends one row per completed bucket up to the pass's start time. Stored
//! buckets are never recomputed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fcp::ProbeErrorType;
use libsql::{Connection, Value, params};
use tracing::{debug, info, warn};

use super::estimator::{SizeEstimate, estimate};
use super::series::{self, BUCKET_SECS, BucketRow, SeriesStart, SeriesStore};
use crate::database::GatewayHandle;
use crate::pool::LibsqlPool;

/// Window of the daily effective size estimate
const DAY_SECS: i64 = 24 * 3600;
/// Window of the weekly effective size estimate and store size mean
const WEEK_SECS: i64 = 7 * DAY_SECS;
const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// Store capacity in bytes from the mean advertised store size and the weekly
/// effective size. Half of a datastore is store, and each block is doubled for
/// FEC and then stored about three times.
pub fn store_capacity(mean_store_gib: Option<f64>, weekly: SizeEstimate) -> Option<f64> {
    let mean = mean_store_gib?;
    let size = weekly.value()?;
    Some(mean * size as f64 * BYTES_PER_GIB / 12.0)
}

pub struct Aggregator {
    records: LibsqlPool,
    series: Arc<SeriesStore>,
    writer: GatewayHandle,
}

impl Aggregator {
    pub fn new(records: LibsqlPool, series: Arc<SeriesStore>, writer: GatewayHandle) -> Self {
        Self { records, series, writer }
    }

    /// Append every bucket that ends no later than `run_start`.
    /// Returns how many buckets were appended.
    pub async fn catch_up(&self, run_start: i64) -> Result<usize> {
        let records = self.records.get().await.context("no record store reader available")?;
        let series_conn = self.series.connect().await?;

        let mut last_end = match series::last_bucket_end(&series_conn).await? {
            Some(end) => end,
            None => {
                let Some(first) = first_sample_time(&records).await? else {
                    info!("No identifier samples yet, nothing to aggregate");
                    return Ok(0);
                };
                let start = first.div_euclid(BUCKET_SECS) * BUCKET_SECS;
                self.writer.commit(SeriesStart { start }).await?;
                info!("Starting network size series at {}", start);
                start
            }
        };

        info!("Resuming network size computation after {}", last_end);

        let mut appended = 0;
        while last_end + BUCKET_SECS <= run_start {
            let bucket_end = last_end + BUCKET_SECS;
            let row = compute_bucket(&records, bucket_end)
                .await
                .with_context(|| format!("failed to compute bucket ending {bucket_end}"))?;
            self.writer
                .commit(row)
                .await
                .with_context(|| format!("failed to store bucket ending {bucket_end}"))?;

            last_end = bucket_end;
            appended += 1;
        }

        info!("Network size series is current up to {} ({} new buckets)", last_end, appended);
        Ok(appended)
    }

    /// The most recently stored bucket
    pub async fn latest(&self) -> Result<Option<BucketRow>> {
        let conn = self.series.connect().await?;
        let Some(last_end) = series::last_bucket_end(&conn).await? else {
            return Ok(None);
        };
        Ok(series::load_rows(&conn, last_end - BUCKET_SECS).await?.pop())
    }

    /// Start background aggregation task
    pub fn start_periodic(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;

                let run_start = chrono::Utc::now().timestamp();
                match self.catch_up(run_start).await {
                    Ok(appended) => {
                        debug!("Periodic aggregation completed: {} buckets appended", appended);
                    }
                    Err(e) => {
                        warn!("Periodic aggregation failed: {:#}", e);
                    }
                }
            }
        })
    }
}

async fn first_sample_time(conn: &Connection) -> Result<Option<i64>> {
    let mut rows = conn.query("SELECT MIN(time) FROM identifier", ()).await?;
    Ok(match rows.next().await? {
        Some(row) => row.get::<Option<i64>>(0)?,
        None => None,
    })
}

async fn compute_bucket(conn: &Connection, bucket_end: i64) -> Result<BucketRow> {
    let bucket_start = bucket_end - BUCKET_SECS;

    let (distinct, total) = instantaneous_counts(conn, bucket_start, bucket_end).await?;
    let instantaneous_size = estimate(distinct, total);
    debug!(
        "{}: {} samples | {} distinct samples | {} estimated instantaneous size",
        bucket_end, total, distinct, instantaneous_size
    );

    let (distinct, total) = recapture_counts(conn, bucket_end, DAY_SECS).await?;
    let daily_size = estimate(distinct, total);
    debug!(
        "{}: {} samples | {} distinct samples | {} estimated daily effective size",
        bucket_end, total, distinct, daily_size
    );

    let (distinct, total) = recapture_counts(conn, bucket_end, WEEK_SECS).await?;
    let effective_size = estimate(distinct, total);
    debug!(
        "{}: {} samples | {} distinct samples | {} estimated weekly effective size",
        bucket_end, total, distinct, effective_size
    );

    let mean_store_gib = mean_store_size(conn, bucket_end - WEEK_SECS, bucket_end).await?;

    Ok(BucketRow {
        bucket_end,
        instantaneous_size,
        daily_size,
        effective_size,
        store_capacity: store_capacity(mean_store_gib, effective_size),
        refused: refused_count(conn, bucket_start, bucket_end).await?,
        errors: error_counts(conn, bucket_start, bucket_end).await?,
    })
}

async fn count_pair(conn: &Connection, sql: &str, args: impl libsql::params::IntoParams) -> Result<(u64, u64)> {
    let mut rows = conn.query(sql, args).await?;
    match rows.next().await? {
        Some(row) => Ok((row.get::<i64>(0)? as u64, row.get::<i64>(1)? as u64)),
        None => Ok((0, 0)),
    }
}

/// Distinct and total identifiers seen in `[from, to)`
async fn instantaneous_counts(conn: &Connection, from: i64, to: i64) -> Result<(u64, u64)> {
    count_pair(
        conn,
        "SELECT COUNT(DISTINCT identifier), COUNT(identifier) FROM identifier \
         WHERE time >= ?1 AND time < ?2",
        params![from, to],
    )
    .await
}

/// Identifiers seen in `[end - 2w, end - w)` that were seen again in
/// `[end - w, end)`, counted once per matching pair
async fn recapture_counts(conn: &Connection, end: i64, window: i64) -> Result<(u64, u64)> {
    count_pair(
        conn,
        "SELECT COUNT(DISTINCT identifier), COUNT(identifier) FROM ( \
             SELECT i1.identifier FROM identifier i1 JOIN identifier i2 USING (identifier) \
             WHERE i1.time >= ?1 AND i1.time < ?2 AND i2.time >= ?2 AND i2.time < ?3 \
         )",
        params![end - 2 * window, end - window, end],
    )
    .await
}

async fn mean_store_size(conn: &Connection, from: i64, to: i64) -> Result<Option<f64>> {
    let mut rows = conn
        .query(
            "SELECT SUM(GiB), COUNT(GiB) FROM store_size WHERE time >= ?1 AND time < ?2",
            params![from, to],
        )
        .await?;
    let Some(row) = rows.next().await? else {
        return Ok(None);
    };

    let count = row.get::<i64>(1)?;
    if count == 0 {
        return Ok(None);
    }
    let sum = match row.get_value(0)? {
        Value::Real(sum) => sum,
        Value::Integer(sum) => sum as f64,
        _ => return Ok(None),
    };
    Ok(Some(sum / count as f64))
}

async fn refused_count(conn: &Connection, from: i64, to: i64) -> Result<u64> {
    let mut rows = conn
        .query("SELECT COUNT(*) FROM refused WHERE time >= ?1 AND time < ?2", params![from, to])
        .await?;
    Ok(match rows.next().await? {
        Some(row) => row.get::<i64>(0)? as u64,
        None => 0,
    })
}

async fn error_counts(
    conn: &Connection,
    from: i64,
    to: i64,
) -> Result<[u64; ProbeErrorType::ALL.len()]> {
    let mut rows = conn
        .query(
            "SELECT error_type, COUNT(*) FROM error WHERE time >= ?1 AND time < ?2 \
             GROUP BY error_type",
            params![from, to],
        )
        .await?;

    let mut counts = [0u64; ProbeErrorType::ALL.len()];
    while let Some(row) = rows.next().await? {
        let kind = match row.get_value(0)? {
            Value::Integer(code) => ProbeErrorType::from_code(code),
            _ => None,
        };
        let count = row.get::<i64>(1)? as u64;
        match kind {
            Some(kind) => counts[kind.code() as usize] += count,
            None => debug!("Ignoring {} errors of unknown type", count),
        }
    }
    Ok(counts)
}
