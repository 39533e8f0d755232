use fcp::{ProbeErrorType, ProbeType};
use libsql::{Connection, TransactionBehavior};

use super::StoreError;

/// Schema version - increment when making schema changes
pub const SCHEMA_VERSION: i64 = 6;

/// Every table holding probe samples, all of which carry a `time` column
const SAMPLE_TABLES: [&str; 11] = [
    "bandwidth",
    "build",
    "identifier",
    "peer_count",
    "link_lengths",
    "location",
    "store_size",
    "uptime_48h",
    "uptime_7d",
    "error",
    "refused",
];

/// Link lengths share the response time of their peer count row
const TIMED_TABLES: [&str; 10] = [
    "bandwidth",
    "build",
    "identifier",
    "peer_count",
    "location",
    "store_size",
    "uptime_48h",
    "uptime_7d",
    "error",
    "refused",
];

/// Newest `user_version` written by stores that predate the `schema_version` table
const LAST_USER_VERSION: i64 = 5;

const LATEST_SCHEMA: &str = "
CREATE TABLE bandwidth (time INTEGER, htl INTEGER, KiB REAL, duration REAL);
CREATE TABLE build (time INTEGER, htl INTEGER, build INTEGER, duration REAL);
CREATE TABLE identifier (time INTEGER, htl INTEGER, identifier INTEGER, percent INTEGER, duration REAL);
CREATE TABLE peer_count (time INTEGER, htl INTEGER, peers INTEGER, duration REAL);
CREATE TABLE link_lengths (time INTEGER, htl INTEGER, length REAL, id INTEGER);
CREATE TABLE location (time INTEGER, htl INTEGER, location REAL, duration REAL);
CREATE TABLE store_size (time INTEGER, htl INTEGER, GiB REAL, duration REAL);
CREATE TABLE uptime_48h (time INTEGER, htl INTEGER, percent REAL, duration REAL);
CREATE TABLE uptime_7d (time INTEGER, htl INTEGER, percent REAL, duration REAL);
CREATE TABLE error (
    time INTEGER,
    htl INTEGER,
    probe_type INTEGER,
    error_type INTEGER,
    code INTEGER,
    duration REAL,
    local INTEGER
);
CREATE TABLE refused (time INTEGER, htl INTEGER, probe_type INTEGER, duration REAL);
CREATE TABLE schema_version (version INTEGER NOT NULL);
";

/// Run database migrations
///
/// An empty store gets the latest schema directly. Otherwise every pending
/// step is applied in order, each in its own exclusive transaction.
/// Returns the version the store ends up at.
pub async fn run_migrations(conn: &Connection) -> Result<i64, StoreError> {
    migrate_to(conn, SCHEMA_VERSION).await
}

pub(crate) async fn migrate_to(conn: &Connection, target: i64) -> Result<i64, StoreError> {
    let current_version = match get_current_version(conn).await? {
        Some(version) => version,
        None => {
            create_latest_schema(conn)
                .await
                .map_err(|source| StoreError::Migration { from: 0, source })?;
            tracing::info!("Created new record store at schema version {}", SCHEMA_VERSION);
            return Ok(SCHEMA_VERSION);
        }
    };

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found: current_version,
            supported: SCHEMA_VERSION,
        });
    }
    if current_version >= target {
        tracing::info!("Record store schema is up to date (version {})", current_version);
        return Ok(current_version);
    }

    tracing::info!("Running migrations from version {} to {}", current_version, target);

    for from in current_version..target {
        let description = migration_step(conn, from)
            .await
            .map_err(|source| StoreError::Migration { from, source })?;
        tracing::info!("Applied migration v{}: {}", from + 1, description);
    }

    Ok(target)
}

/// Current schema version, or `None` for a store without any tables.
/// Stores written before the `schema_version` table existed are placed on the
/// step chain from their `user_version`.
async fn get_current_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    let tables = count(
        conn,
        "SELECT COUNT(*) FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'libsql_%'",
    )
    .await?;
    if tables == 0 {
        return Ok(None);
    }

    let versioned = count(
        conn,
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
    )
    .await?;
    if versioned == 0 {
        let user_version = count(conn, "PRAGMA user_version").await?;
        let version = chain_version(user_version)
            .ok_or(StoreError::UnrecognizedUserVersion { found: user_version })?;
        tracing::info!(
            "Record store without a version table has user_version {}, migrating from step {}",
            user_version,
            version
        );
        return Ok(Some(version));
    }

    let mut rows = conn.query("SELECT MAX(version) FROM schema_version", ()).await?;
    let version = match rows.next().await? {
        Some(row) => row.get::<Option<i64>>(0)?,
        None => None,
    };
    Ok(Some(version.unwrap_or(0)))
}

/// Step chain position matching a `user_version` stamp.
///
/// 0 is also what an unstamped store reports, so the column steps check what
/// already exists. Versions 3 and 5 only differ from 2 and 4 in their
/// indexes, which the index step rebuilds from scratch.
fn chain_version(user_version: i64) -> Option<i64> {
    match user_version {
        0 => Some(0),
        1 => Some(1),
        2 | 3 => Some(2),
        4 | LAST_USER_VERSION => Some(4),
        _ => None,
    }
}

async fn count(conn: &Connection, sql: &str) -> Result<i64, libsql::Error> {
    let mut rows = conn.query(sql, ()).await?;
    match rows.next().await? {
        Some(row) => row.get::<i64>(0),
        None => Ok(0),
    }
}

async fn create_latest_schema(conn: &Connection) -> Result<(), libsql::Error> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive).await?;
    let created = async {
        tx.execute_batch(LATEST_SCHEMA).await?;
        tx.execute_batch(&index_statements()).await?;
        tx.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            libsql::params![SCHEMA_VERSION],
        )
        .await?;
        Ok::<_, libsql::Error>(())
    }
    .await;
    finish(tx, created).await
}

/// Apply the single step leaving the store at `from + 1`
async fn migration_step(conn: &Connection, from: i64) -> Result<&'static str, libsql::Error> {
    // Journal mode cannot change inside a transaction.
    if from == 5 {
        super::enable_wal(conn).await?;
    }

    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive).await?;
    let applied = async {
        let description = match from {
            0 => {
                for table in TIMED_TABLES {
                    if !has_column(&tx, table, "duration").await? {
                        tx.execute(&format!("ALTER TABLE {table} ADD COLUMN duration"), ()).await?;
                    }
                }
                "Record response times"
            }
            1 => {
                if !has_column(&tx, "error", "local").await? {
                    tx.execute("ALTER TABLE error ADD COLUMN local", ()).await?;
                }
                "Record whether errors happened locally"
            }
            2 => {
                for table in SAMPLE_TABLES {
                    let unparseable = unparseable_times(&tx, table).await?;
                    if unparseable > 0 {
                        tracing::warn!(
                            "{} rows in {} have a timestamp that cannot be parsed; \
                             they keep a NULL time and fall outside every window",
                            unparseable,
                            table
                        );
                    }
                    tx.execute(
                        &format!(
                            "UPDATE {table} SET time = CAST(strftime('%s', time) AS INTEGER) \
                             WHERE typeof(time) = 'text'"
                        ),
                        (),
                    )
                    .await?;
                }
                "Store timestamps as POSIX seconds"
            }
            3 => {
                let probe_types = case_expression(
                    "probe_type",
                    ProbeType::ALL.into_iter().map(|kind| (kind.as_str(), kind.code())),
                );
                let error_types = case_expression(
                    "error_type",
                    ProbeErrorType::ALL.into_iter().map(|kind| (kind.as_str(), kind.code())),
                );
                tx.execute(
                    &format!(
                        "UPDATE error SET probe_type = {probe_types} WHERE typeof(probe_type) = 'text'"
                    ),
                    (),
                )
                .await?;
                tx.execute(
                    &format!(
                        "UPDATE error SET error_type = {error_types} WHERE typeof(error_type) = 'text'"
                    ),
                    (),
                )
                .await?;
                tx.execute(
                    &format!(
                        "UPDATE refused SET probe_type = {probe_types} WHERE typeof(probe_type) = 'text'"
                    ),
                    (),
                )
                .await?;
                "Store probe and error kinds as integer codes"
            }
            4 => {
                for name in explicit_indexes(&tx).await? {
                    tx.execute(&format!("DROP INDEX IF EXISTS \"{name}\""), ()).await?;
                }
                tx.execute_batch(&index_statements()).await?;
                "Rebuild indexes"
            }
            5 => "Write-ahead logging",
            _ => unreachable!("no migration starts at version {from}"),
        };

        tx.execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)", ())
            .await?;
        tx.execute("DELETE FROM schema_version", ()).await?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", libsql::params![from + 1])
            .await?;
        Ok::<_, libsql::Error>(description)
    }
    .await;

    finish(tx, applied).await
}

async fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE",
            libsql::params![table, column],
        )
        .await?;
    match rows.next().await? {
        Some(row) => Ok(row.get::<i64>(0)? > 0),
        None => Ok(false),
    }
}

/// Text timestamps in `table` that `strftime` turns into NULL
pub(crate) async fn unparseable_times(conn: &Connection, table: &str) -> Result<i64, libsql::Error> {
    count(
        conn,
        &format!(
            "SELECT COUNT(*) FROM {table} \
             WHERE typeof(time) = 'text' AND strftime('%s', time) IS NULL"
        ),
    )
    .await
}

/// Indexes created by statement, whatever release of the store named them
async fn explicit_indexes(conn: &Connection) -> Result<Vec<String>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT name FROM sqlite_master \
             WHERE type = 'index' AND sql IS NOT NULL AND tbl_name != 'schema_version'",
            (),
        )
        .await?;
    let mut names = Vec::new();
    while let Some(row) = rows.next().await? {
        names.push(row.get::<String>(0)?);
    }
    Ok(names)
}

/// Commit on success, roll back otherwise
async fn finish<T>(
    tx: libsql::Transaction,
    result: Result<T, libsql::Error>,
) -> Result<T, libsql::Error> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!("Rollback after failed migration also failed: {}", rollback);
            }
            Err(err)
        }
    }
}

const INDEXES: [(&str, &str); 14] = [
    ("idx_bandwidth_time", "bandwidth(time)"),
    ("idx_build_time", "build(time)"),
    ("idx_identifier_time", "identifier(time)"),
    ("idx_identifier_identifier", "identifier(identifier)"),
    ("idx_peer_count_time", "peer_count(time)"),
    ("idx_link_lengths_time", "link_lengths(time)"),
    ("idx_link_lengths_id", "link_lengths(id)"),
    ("idx_location_time", "location(time)"),
    ("idx_store_size_time", "store_size(time)"),
    ("idx_uptime_48h_time", "uptime_48h(time)"),
    ("idx_uptime_7d_time", "uptime_7d(time)"),
    ("idx_error_time", "error(time)"),
    ("idx_error_type_time", "error(error_type, time)"),
    ("idx_refused_time", "refused(time)"),
];

fn index_statements() -> String {
    INDEXES
        .iter()
        .map(|(name, target)| format!("CREATE INDEX IF NOT EXISTS {name} ON {target};\n"))
        .collect()
}

fn case_expression<'a>(column: &str, codes: impl Iterator<Item = (&'a str, i64)>) -> String {
    let arms: String = codes.map(|(name, code)| format!(" WHEN '{name}' THEN {code}")).collect();
    format!("CASE {column}{arms} ELSE {column} END")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::column_i64;

    /// Layout written before the store was versioned
    const LEGACY_SCHEMA: &str = "
    CREATE TABLE bandwidth (time, htl, KiB, duration);
    CREATE TABLE build (time, htl, build, duration);
    CREATE TABLE identifier (time, htl, identifier, percent, duration);
    CREATE TABLE peer_count (time, htl, peers, duration);
    CREATE TABLE link_lengths (time, htl, length, id);
    CREATE TABLE location (time, htl, location, duration);
    CREATE TABLE store_size (time, htl, GiB, duration);
    CREATE TABLE uptime_48h (time, htl, percent, duration);
    CREATE TABLE uptime_7d (time, htl, percent, duration);
    CREATE TABLE error (time, htl, probe_type, error_type, code, duration);
    CREATE TABLE refused (time, htl, probe_type, duration);
    ";

    /// Columns of each sample table ahead of `duration` and `local`
    const STAMPED_COLUMNS: [(&str, &str); 11] = [
        ("bandwidth", "time DATETIME, htl INTEGER, KiB FLOAT"),
        ("build", "time DATETIME, htl INTEGER, build INTEGER"),
        ("identifier", "time DATETIME, htl INTEGER, identifier INTEGER, percent INTEGER"),
        ("link_lengths", "time DATETIME, htl INTEGER, length FLOAT, id INTEGER"),
        ("peer_count", "time DATETIME, htl INTEGER, peers INTEGER"),
        ("location", "time DATETIME, htl INTEGER, location FLOAT"),
        ("store_size", "time DATETIME, htl INTEGER, GiB FLOAT"),
        ("uptime_48h", "time DATETIME, htl INTEGER, percent FLOAT"),
        ("uptime_7d", "time DATETIME, htl INTEGER, percent FLOAT"),
        ("error", "time DATETIME, htl INTEGER, probe_type INTEGER, error_type INTEGER, code INTEGER"),
        ("refused", "time DATETIME, htl INTEGER, probe_type INTEGER"),
    ];

    /// Layout, indexes and rows of a store stamped with `user_version`
    fn stamped_store_script(user_version: i64) -> String {
        let mut script = String::new();
        for (table, columns) in STAMPED_COLUMNS {
            let mut columns = columns.to_string();
            if user_version >= 1 && table != "link_lengths" {
                columns.push_str(", duration FLOAT");
            }
            if user_version >= 2 && table == "error" {
                columns.push_str(", local BOOLEAN");
            }
            script.push_str(&format!("CREATE TABLE {table} ({columns});\n"));
        }

        if user_version < 3 {
            script.push_str("CREATE INDEX time_index ON bandwidth(time);\n");
        } else {
            for table in SAMPLE_TABLES {
                let target = match (table, user_version) {
                    ("identifier", _) => continue,
                    ("store_size", 3 | 4) => "peer_count",
                    _ => table,
                };
                script.push_str(&format!("CREATE INDEX {table}_time_index ON {target}(time);\n"));
            }
            if user_version < LAST_USER_VERSION {
                script.push_str("CREATE INDEX identifier_time_index ON identifier(time);\n");
                script.push_str(
                    "CREATE INDEX identifier_identifier_index ON identifier(identifier);\n",
                );
            } else {
                script.push_str(
                    "CREATE INDEX identifier_identifier_time ON identifier(identifier, time);\n\
                     CREATE INDEX identifier_time_identifier ON identifier(time, identifier);\n",
                );
            }
        }

        let rows = if user_version < 4 {
            [
                "'2013-05-01 12:00:00'",
                "'2013-05-01 12:30:00'",
                "'2013-05-01 13:00:00'",
                "'LOCATION'",
                "'TIMEOUT'",
                "'UPTIME_7D'",
            ]
        } else {
            ["1367409600", "1367411400", "1367413200", "4", "2", "7"]
        };
        script.push_str(&format!(
            "INSERT INTO identifier (time, htl, identifier, percent) VALUES ({}, 30, 1234, 80);\n\
             INSERT INTO error (time, htl, probe_type, error_type) VALUES ({}, 30, {}, {});\n\
             INSERT INTO refused (time, htl, probe_type) VALUES ({}, 30, {});\n",
            rows[0], rows[1], rows[3], rows[4], rows[2], rows[5]
        ));
        script.push_str(&format!("PRAGMA user_version = {user_version};\n"));
        script
    }

    async fn stamped_store(user_version: i64) -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db = libsql::Builder::new_local(dir.path().join("stamped.db")).build().await.unwrap();
        let conn = db.connect().unwrap();
        conn.execute_batch(&stamped_store_script(user_version)).await.unwrap();
        (dir, conn)
    }

    async fn legacy_store() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let db = libsql::Builder::new_local(dir.path().join("legacy.db")).build().await.unwrap();
        let conn = db.connect().unwrap();
        conn.execute_batch(LEGACY_SCHEMA).await.unwrap();
        conn.execute_batch(
            "INSERT INTO identifier VALUES ('2013-05-01 12:00:00', 30, 1234, 80, 1.5);
             INSERT INTO error VALUES ('2013-05-01 12:30:00', 30, 'LOCATION', 'TIMEOUT', NULL, 4.0);
             INSERT INTO refused VALUES ('2013-05-01 13:00:00', 30, 'UPTIME_7D', 0.5);",
        )
        .await
        .unwrap();
        (dir, conn)
    }

    async fn table_names(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'libsql_%' ORDER BY name",
                (),
            )
            .await
            .unwrap();
        let mut names = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            names.push(row.get::<String>(0).unwrap());
        }
        names
    }

    #[tokio::test]
    async fn test_empty_store_gets_latest_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = libsql::Builder::new_local(dir.path().join("new.db")).build().await.unwrap();
        let conn = db.connect().unwrap();

        assert_eq!(run_migrations(&conn).await.unwrap(), SCHEMA_VERSION);
        assert_eq!(column_i64(&conn, "SELECT version FROM schema_version").await, vec![6]);

        let mut expected: Vec<String> = SAMPLE_TABLES.iter().map(|name| name.to_string()).collect();
        expected.push("schema_version".to_string());
        expected.sort();
        assert_eq!(table_names(&conn).await, expected);
    }

    #[tokio::test]
    async fn test_legacy_store_migrates_data() {
        let (_dir, conn) = legacy_store().await;

        assert_eq!(run_migrations(&conn).await.unwrap(), SCHEMA_VERSION);

        assert_eq!(column_i64(&conn, "SELECT version FROM schema_version").await, vec![6]);
        assert_eq!(column_i64(&conn, "SELECT time FROM identifier").await, vec![1367409600]);
        assert_eq!(column_i64(&conn, "SELECT time FROM error").await, vec![1367411400]);
        assert_eq!(column_i64(&conn, "SELECT probe_type FROM error").await, vec![4]);
        assert_eq!(column_i64(&conn, "SELECT error_type FROM error").await, vec![2]);
        assert_eq!(column_i64(&conn, "SELECT probe_type FROM refused").await, vec![7]);
        assert_eq!(column_i64(&conn, "SELECT COUNT(*) FROM error WHERE local IS NULL").await, vec![1]);
        assert_eq!(
            column_i64(
                &conn,
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name LIKE 'idx_%'"
            )
            .await,
            vec![INDEXES.len() as i64]
        );
    }

    #[tokio::test]
    async fn test_stamped_stores_reach_latest() {
        for user_version in 0..=LAST_USER_VERSION {
            let (_dir, conn) = stamped_store(user_version).await;

            assert_eq!(
                run_migrations(&conn).await.unwrap(),
                SCHEMA_VERSION,
                "user_version {user_version}"
            );
            assert_eq!(column_i64(&conn, "SELECT version FROM schema_version").await, vec![6]);
            assert_eq!(column_i64(&conn, "SELECT time FROM identifier").await, vec![1367409600]);
            assert_eq!(column_i64(&conn, "SELECT time FROM refused").await, vec![1367413200]);
            assert_eq!(column_i64(&conn, "SELECT probe_type FROM error").await, vec![4]);
            assert_eq!(column_i64(&conn, "SELECT error_type FROM error").await, vec![2]);
            assert_eq!(column_i64(&conn, "SELECT probe_type FROM refused").await, vec![7]);

            // Only the current indexes survive, under their current names.
            assert_eq!(
                column_i64(
                    &conn,
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND sql IS NOT NULL"
                )
                .await,
                vec![INDEXES.len() as i64],
                "user_version {user_version}"
            );

            conn.execute(
                "INSERT INTO bandwidth (time, htl, KiB, duration) VALUES (1367416800, 30, 12.5, 2.0)",
                (),
            )
            .await
            .unwrap();
            conn.execute(
                "INSERT INTO error (time, htl, probe_type, error_type, code, duration, local) \
                 VALUES (1367416800, 30, 0, 3, NULL, 1.0, 1)",
                (),
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_versionless_store_gains_duration_columns() {
        let (_dir, conn) = stamped_store(0).await;

        run_migrations(&conn).await.unwrap();

        for table in TIMED_TABLES {
            assert!(has_column(&conn, table, "duration").await.unwrap(), "{table}");
        }
        assert!(!has_column(&conn, "link_lengths", "duration").await.unwrap());
        assert!(has_column(&conn, "error", "local").await.unwrap());
        conn.execute(
            "INSERT INTO refused (time, htl, probe_type, duration) VALUES (1367416800, 30, 2, 0.25)",
            (),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_user_version_is_refused() {
        let (_dir, conn) = stamped_store(LAST_USER_VERSION).await;
        conn.execute_batch("PRAGMA user_version = 9;").await.unwrap();

        let err = run_migrations(&conn).await.unwrap_err();
        assert!(matches!(err, StoreError::UnrecognizedUserVersion { found: 9 }));
    }

    #[tokio::test]
    async fn test_unparseable_timestamps_are_counted() {
        let (_dir, conn) = legacy_store().await;
        conn.execute(
            "INSERT INTO identifier VALUES ('the first of May', 30, 99, 10, 1.0)",
            (),
        )
        .await
        .unwrap();
        assert_eq!(unparseable_times(&conn, "identifier").await.unwrap(), 1);
        assert_eq!(unparseable_times(&conn, "error").await.unwrap(), 0);

        assert_eq!(run_migrations(&conn).await.unwrap(), SCHEMA_VERSION);

        assert_eq!(column_i64(&conn, "SELECT COUNT(*) FROM identifier WHERE time IS NULL").await, vec![1]);
        assert_eq!(
            column_i64(&conn, "SELECT time FROM identifier WHERE time IS NOT NULL").await,
            vec![1367409600]
        );
        assert_eq!(unparseable_times(&conn, "identifier").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_every_prior_version_reaches_latest() {
        for start in 0..SCHEMA_VERSION {
            let (_dir, conn) = legacy_store().await;
            if start > 0 {
                assert_eq!(migrate_to(&conn, start).await.unwrap(), start);
            }

            assert_eq!(run_migrations(&conn).await.unwrap(), SCHEMA_VERSION, "from {start}");
            assert_eq!(column_i64(&conn, "SELECT version FROM schema_version").await, vec![6]);
            assert_eq!(column_i64(&conn, "SELECT time FROM identifier").await, vec![1367409600]);
        }
    }

    #[tokio::test]
    async fn test_rerunning_is_a_no_op() {
        let (_dir, conn) = legacy_store().await;
        run_migrations(&conn).await.unwrap();
        let tables = table_names(&conn).await;

        assert_eq!(run_migrations(&conn).await.unwrap(), SCHEMA_VERSION);
        assert_eq!(table_names(&conn).await, tables);
        assert_eq!(column_i64(&conn, "SELECT COUNT(*) FROM schema_version").await, vec![1]);
    }

    #[tokio::test]
    async fn test_failed_step_keeps_prior_version() {
        let (_dir, conn) = legacy_store().await;
        migrate_to(&conn, 4).await.unwrap();
        // Make the index rebuild fail.
        conn.execute("DROP TABLE link_lengths", ()).await.unwrap();

        let err = run_migrations(&conn).await.unwrap_err();

        assert!(matches!(err, StoreError::Migration { from: 4, .. }));
        assert_eq!(column_i64(&conn, "SELECT version FROM schema_version").await, vec![4]);
    }

    #[tokio::test]
    async fn test_newer_store_is_refused() {
        let (_dir, conn) = legacy_store().await;
        run_migrations(&conn).await.unwrap();
        conn.execute("UPDATE schema_version SET version = 99", ()).await.unwrap();

        let err = run_migrations(&conn).await.unwrap_err();
        assert!(matches!(err, StoreError::UnsupportedVersion { found: 99, .. }));
    }
}
