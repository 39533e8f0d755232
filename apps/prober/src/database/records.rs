use std::time::Duration;

use async_trait::async_trait;
use fcp::{ProbeOutcome, ProbeResult, ProbeType};
use libsql::{Connection, Value, params};

use super::gateway::{Commit, GatewayError};

/// One probe outcome as it is persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeRecord {
    /// POSIX seconds at which the request was sent
    pub observed_at: i64,
    pub hops_to_live: u8,
    /// Round-trip time of the request
    pub duration: Duration,
    /// The kind that was requested; errors and refusals carry no payload of their own
    pub probe_type: ProbeType,
    pub outcome: ProbeOutcome,
}

#[async_trait]
impl Commit for ProbeRecord {
    async fn apply(&self, conn: &Connection) -> Result<(), GatewayError> {
        let time = self.observed_at;
        let htl = i64::from(self.hops_to_live);
        let duration = self.duration.as_secs_f64();

        match &self.outcome {
            ProbeOutcome::Result(result) => match result {
                ProbeResult::Bandwidth { output_kib } => {
                    conn.execute(
                        "INSERT INTO bandwidth (time, htl, KiB, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *output_kib, duration],
                    )
                    .await?;
                }
                ProbeResult::Build { build } => {
                    conn.execute(
                        "INSERT INTO build (time, htl, build, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *build, duration],
                    )
                    .await?;
                }
                ProbeResult::Identifier { identifier, uptime_percent } => {
                    conn.execute(
                        "INSERT INTO identifier (time, htl, identifier, percent, duration) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![time, htl, *identifier, *uptime_percent, duration],
                    )
                    .await?;
                }
                ProbeResult::LinkLengths { lengths } => {
                    let peers = i64::try_from(lengths.len()).unwrap_or(i64::MAX);
                    conn.execute(
                        "INSERT INTO peer_count (time, htl, peers, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, peers, duration],
                    )
                    .await?;
                    // Link lengths join back to the peer count through its rowid.
                    let id = conn.last_insert_rowid();
                    for length in lengths {
                        conn.execute(
                            "INSERT INTO link_lengths (time, htl, length, id) VALUES (?1, ?2, ?3, ?4)",
                            params![time, htl, *length, id],
                        )
                        .await?;
                    }
                }
                ProbeResult::Location { location } => {
                    conn.execute(
                        "INSERT INTO location (time, htl, location, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *location, duration],
                    )
                    .await?;
                }
                ProbeResult::StoreSize { gib } => {
                    conn.execute(
                        "INSERT INTO store_size (time, htl, GiB, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *gib, duration],
                    )
                    .await?;
                }
                ProbeResult::Uptime48h { percent } => {
                    conn.execute(
                        "INSERT INTO uptime_48h (time, htl, percent, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *percent, duration],
                    )
                    .await?;
                }
                ProbeResult::Uptime7d { percent } => {
                    conn.execute(
                        "INSERT INTO uptime_7d (time, htl, percent, duration) VALUES (?1, ?2, ?3, ?4)",
                        params![time, htl, *percent, duration],
                    )
                    .await?;
                }
            },
            ProbeOutcome::Error { kind, code, local } => {
                let code = code.map_or(Value::Null, Value::Integer);
                conn.execute(
                    "INSERT INTO error (time, htl, probe_type, error_type, code, duration, local) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        time,
                        htl,
                        self.probe_type.code(),
                        kind.code(),
                        code,
                        duration,
                        i64::from(*local)
                    ],
                )
                .await?;
            }
            ProbeOutcome::Refused => {
                conn.execute(
                    "INSERT INTO refused (time, htl, probe_type, duration) VALUES (?1, ?2, ?3, ?4)",
                    params![time, htl, self.probe_type.code(), duration],
                )
                .await?;
            }
        }

        Ok(())
    }
}
