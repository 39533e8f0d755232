use std::{env, fmt, fs, path, time::Duration};

use fcp::{ProbeType, ReconnectPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::ReportSettings;
use crate::database::GatewayConfig;
use crate::probing::ScheduleConfig;

/// Highest hop budget a node accepts for a probe
const MAX_HOPS_TO_LIVE: u8 = 70;

/// Bounds on the per-stream period the scheduler ticks at
const MIN_PERIOD: Duration = Duration::from_millis(1);
const MAX_PERIOD: Duration = Duration::from_secs(7 * 24 * 3600);

const MAX_RECONNECT_DELAY_SECS: f64 = 24.0 * 3600.0;
const MAX_RECONNECT_FACTOR: f64 = 100.0;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {path}: {source}")]
    ReadFailed {
        path: path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    WriteFailed {
        path: path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    ParseFailed {
        path: path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize configuration: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("neither XDG_CONFIG_HOME nor a home directory is available")]
    ConfigPathUnavailable,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: Node,
    pub reconnect: Reconnect,
    pub probe: Probe,
    pub database: Database,
    pub analysis: Analysis,
    pub log: Log,
}

/// The trusted node probes are issued through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Node {
    pub host: String,
    pub port: u16,
    pub client_name: String,
    pub handshake_timeout_secs: u64,
    pub response_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Reconnect {
    pub initial_delay_secs: f64,
    pub max_delay_secs: f64,
    pub factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Probe {
    pub hops_to_live: u8,
    pub types: Vec<ProbeType>,
    /// Aggregate probes per minute across all streams
    pub rate: Option<f64>,
    /// Fixed wait between probes of one stream, used when `rate` is unset
    pub wait_secs: Option<f64>,
    pub streams: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: path::PathBuf,
    pub busy_timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
    pub reader_pool_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Analysis {
    pub series_path: path::PathBuf,
    pub output_dir: path::PathBuf,
    pub recent_hours: u64,
    pub histogram_max: usize,
    pub uptime_histogram_max: usize,
    /// Run the aggregator inside `fnprobe probe` on this cadence
    pub in_process_interval_minutes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Log {
    pub level: String,
    pub file: Option<path::PathBuf>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: fcp::DEFAULT_FCP_PORT,
            client_name: "fnprobe".into(),
            handshake_timeout_secs: 30,
            response_timeout_secs: 600,
        }
    }
}

impl Default for Reconnect {
    fn default() -> Self {
        Self { initial_delay_secs: 1.0, max_delay_secs: 3600.0, factor: std::f64::consts::E }
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self {
            hops_to_live: 25,
            types: ProbeType::ALL.to_vec(),
            rate: Some(30.0),
            wait_secs: None,
            streams: 5,
        }
    }
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: "probe.db".into(),
            busy_timeout_ms: 5_000,
            initial_backoff_ms: 50,
            max_backoff_ms: 5_000,
            max_attempts: 8,
            reader_pool_size: 4,
        }
    }
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            series_path: "series.db".into(),
            output_dir: "reports".into(),
            recent_hours: 168,
            histogram_max: 50,
            uptime_histogram_max: 120,
            in_process_interval_minutes: None,
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self { level: "info".into(), file: None }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/fnprobe/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("fnprobe/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let optional = |value: Option<String>| value.unwrap_or_else(|| "unset".into());

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Node")?;
        write_1(f, "Endpoint", &self.endpoint())?;
        write_1(f, "Client Name", &self.node.client_name)?;
        write_title_1(f, "Probe")?;
        write_1(f, "Hops To Live", &self.probe.hops_to_live)?;
        let types: Vec<&str> = self.probe.types.iter().map(|kind| kind.as_str()).collect();
        write_1(f, "Types", &types.join(", "))?;
        write_1(f, "Rate", &optional(self.probe.rate.map(|rate| format!("{rate}/min"))))?;
        write_1(f, "Wait", &optional(self.probe.wait_secs.map(|wait| format!("{wait}s"))))?;
        write_1(f, "Streams", &self.probe.streams)?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path.display())?;
        write_1(f, "Max Attempts", &self.database.max_attempts)?;
        write_title_1(f, "Analysis")?;
        write_1(f, "Series", &self.analysis.series_path.display())?;
        write_1(f, "Reports", &self.analysis.output_dir.display())?;
        write_title_1(f, "Log")?;
        write_1(f, "Level", &self.log.level)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/fnprobe/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())
                .map_err(|source| Error::ParseFailed { path: config_path.clone(), source })?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &std::path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Reject values the prober cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        let invalid = |message: &str| Err(Error::Invalid(message.to_string()));

        if self.probe.streams == 0 {
            return invalid("probe.streams must be at least 1");
        }
        if self.probe.types.is_empty() {
            return invalid("probe.types must name at least one probe type");
        }
        if !(1..=MAX_HOPS_TO_LIVE).contains(&self.probe.hops_to_live) {
            return invalid("probe.hops_to_live must be between 1 and 70");
        }
        match (self.probe.rate, self.probe.wait_secs) {
            (Some(rate), _) if !(rate > 0.0 && rate.is_finite()) => {
                return invalid("probe.rate must be positive");
            }
            (None, Some(wait)) if !(wait > 0.0 && wait.is_finite()) => {
                return invalid("probe.wait_secs must be positive");
            }
            (None, None) => return invalid("one of probe.rate or probe.wait_secs is required"),
            _ => {}
        }
        let period = self.period().ok_or_else(|| {
            Error::Invalid("probe.rate or probe.wait_secs gives an unusable period".to_string())
        })?;
        if !(MIN_PERIOD..=MAX_PERIOD).contains(&period) {
            return Err(Error::Invalid(format!(
                "probe.rate or probe.wait_secs gives a per-stream period of {period:?}, \
                 outside {MIN_PERIOD:?}..={MAX_PERIOD:?}"
            )));
        }
        let Reconnect { initial_delay_secs, max_delay_secs, factor } = self.reconnect;
        let delays = f64::MIN_POSITIVE..=MAX_RECONNECT_DELAY_SECS;
        if !delays.contains(&initial_delay_secs)
            || !delays.contains(&max_delay_secs)
            || max_delay_secs < initial_delay_secs
        {
            return invalid(
                "reconnect delays must be positive, at most a day, and max_delay_secs >= initial_delay_secs",
            );
        }
        if !(1.0..=MAX_RECONNECT_FACTOR).contains(&factor) {
            return invalid("reconnect.factor must be between 1 and 100");
        }
        if self.database.max_attempts == 0 {
            return invalid("database.max_attempts must be at least 1");
        }
        if self.database.reader_pool_size == 0 {
            return invalid("database.reader_pool_size must be at least 1");
        }
        if self.analysis.in_process_interval_minutes == Some(0) {
            return invalid("analysis.in_process_interval_minutes must be at least 1");
        }

        Ok(())
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.node.host, self.node.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            client_name: self.node.client_name.clone(),
            handshake_timeout: Duration::from_secs(self.node.handshake_timeout_secs),
            response_timeout: Duration::from_secs(self.node.response_timeout_secs),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let secs = |value: f64| Duration::try_from_secs_f64(value).unwrap_or(Duration::from_secs(1));
        ReconnectPolicy::new(
            secs(self.reconnect.initial_delay_secs),
            secs(self.reconnect.max_delay_secs),
            self.reconnect.factor,
        )
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            busy_timeout: Duration::from_millis(self.database.busy_timeout_ms),
            initial_backoff: Duration::from_millis(self.database.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.database.max_backoff_ms),
            max_attempts: self.database.max_attempts,
        }
    }

    pub fn report_settings(&self) -> ReportSettings {
        ReportSettings {
            output_dir: self.analysis.output_dir.clone(),
            recent_secs: i64::try_from(self.analysis.recent_hours.saturating_mul(3600))
                .unwrap_or(i64::MAX),
            histogram_max: self.analysis.histogram_max,
            uptime_histogram_max: self.analysis.uptime_histogram_max,
        }
    }

    /// Per-stream period: `60·streams/rate` seconds, or the fixed wait.
    /// `None` when the result is not a representable duration.
    fn period(&self) -> Option<Duration> {
        let secs = match (self.probe.rate, self.probe.wait_secs) {
            (Some(rate), _) => 60.0 * self.probe.streams as f64 / rate,
            (None, Some(wait)) => wait,
            (None, None) => 60.0,
        };
        Duration::try_from_secs_f64(secs).ok()
    }

    /// Per-stream timing derived from the rate, or the fixed wait
    pub fn schedule_config(&self) -> ScheduleConfig {
        let period = self.period().unwrap_or(Duration::from_secs(60)).clamp(MIN_PERIOD, MAX_PERIOD);

        ScheduleConfig {
            streams: self.probe.streams,
            period,
            hops_to_live: self.probe.hops_to_live,
            types: self.probe.types.clone(),
        }
    }
}
