//! Distribution reports over recent samples.
//!
//! Plain `value weight` data files meant for plotting, one per distribution.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use libsql::{Connection, params};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub output_dir: PathBuf,
    /// Samples newer than this many seconds before the run start are recent
    pub recent_secs: i64,
    pub histogram_max: usize,
    pub uptime_histogram_max: usize,
}

/// Occurrences indexed by value, with everything at or above `max` summed
/// into the last bin. Values missing from `counts` are zero.
pub fn make_histogram(max: usize, counts: &[(i64, u64)]) -> Vec<u64> {
    let mut histogram = vec![0; max + 1];
    for &(value, occurrences) in counts {
        match usize::try_from(value) {
            Ok(value) => histogram[value.min(max)] += occurrences,
            Err(_) => debug!("Skipping {} occurrences of negative value {}", occurrences, value),
        }
    }
    histogram
}

/// `value pct%` lines, each bin as a share of the total
fn percentages(histogram: &[u64]) -> String {
    let total = histogram.iter().sum::<u64>().max(1) as f64;
    histogram
        .iter()
        .enumerate()
        .map(|(value, &count)| format!("{} {:.6}%\n", value, count as f64 / total * 100.0))
        .collect()
}

/// Sorted values each carrying an equal share, so a cumulative plot sums to 100%
fn cumulative(mut values: Vec<f64>) -> String {
    values.sort_by(f64::total_cmp);
    let height = 1.0 / values.len().max(1) as f64;
    values.iter().map(|value| format!("{} {:.6}%\n", value, height * 100.0)).collect()
}

/// Write every report for `[run_start - recent, run_start)` into the output directory
pub async fn write_reports(conn: &Connection, settings: &ReportSettings, run_start: i64) -> Result<()> {
    let from = run_start - settings.recent_secs;
    let dir = &settings.output_dir;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create report directory {}", dir.display()))?;

    info!("Querying peer count distribution");
    let peers = grouped_counts(
        conn,
        "SELECT peers, COUNT(peers) FROM peer_count WHERE time >= ?1 AND time < ?2 \
         GROUP BY peers ORDER BY peers",
        from,
        run_start,
    )
    .await?;
    let histogram = make_histogram(settings.histogram_max, &peers);
    write_report(dir, "peer_count.dat", percentages(&histogram)).await?;

    info!("Querying uptime reported with identifiers");
    let uptimes = grouped_counts(
        conn,
        "SELECT percent, COUNT(percent) FROM identifier WHERE time >= ?1 AND time < ?2 \
         GROUP BY percent ORDER BY percent",
        from,
        run_start,
    )
    .await?;
    let histogram = make_histogram(settings.uptime_histogram_max, &uptimes);
    write_report(dir, "uptime.dat", percentages(&histogram)).await?;

    info!("Querying link lengths");
    let lengths = reals(
        conn,
        "SELECT length FROM link_lengths WHERE time >= ?1 AND time < ?2",
        from,
        run_start,
    )
    .await?;
    write_report(dir, "link_lengths.dat", cumulative(lengths)).await?;

    info!("Querying locations");
    let locations = reals(
        conn,
        "SELECT DISTINCT location FROM location WHERE time >= ?1 AND time < ?2",
        from,
        run_start,
    )
    .await?;
    let weight = 1.0 / locations.len().max(1) as f64;
    let body: String = locations.iter().map(|location| format!("{location} {weight}\n")).collect();
    write_report(dir, "locations.dat", body).await?;

    info!("Reports written to {}", dir.display());
    Ok(())
}

async fn grouped_counts(conn: &Connection, sql: &str, from: i64, to: i64) -> Result<Vec<(i64, u64)>> {
    let mut rows = conn.query(sql, params![from, to]).await?;
    let mut counts = Vec::new();
    while let Some(row) = rows.next().await? {
        counts.push((row.get::<i64>(0)?, row.get::<i64>(1)? as u64));
    }
    Ok(counts)
}

async fn reals(conn: &Connection, sql: &str, from: i64, to: i64) -> Result<Vec<f64>> {
    let mut rows = conn.query(sql, params![from, to]).await?;
    let mut values = Vec::new();
    while let Some(row) = rows.next().await? {
        values.push(row.get::<f64>(0)?);
    }
    Ok(values)
}

async fn write_report(dir: &Path, name: &str, body: String) -> Result<()> {
    let path = dir.join(name);
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
