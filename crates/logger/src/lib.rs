use std::env::var;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{
    Layer, Registry, filter::EnvFilter, fmt::MakeWriter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

/// Where formatted events end up
enum Destination {
    Stderr,
    File(Mutex<File>),
}

impl Destination {
    fn open(file: Option<&Path>) -> Result<Self, Error> {
        let Some(path) = file else {
            return Ok(Self::Stderr);
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|source| Error::OpenFile { path: path.to_path_buf(), source })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| Error::OpenFile { path: path.to_path_buf(), source })?;
        Ok(Self::File(Mutex::new(file)))
    }
}

/// Parse a verbosity name such as `info` or `debug`, falling back to INFO
pub fn parse_level(level: &str) -> LevelFilter {
    level.parse().unwrap_or_else(|_| {
        warn!("Unknown log level {level:?}, falling back to info");
        LevelFilter::INFO
    })
}

/// Install the global subscriber.
///
/// `level` is the default directive; `RUST_LOG` still overrides it.
/// Events go to stderr unless `file` names a log file, which is appended to.
pub fn init_tracing(level: LevelFilter, file: Option<&Path>) -> Result<(), Error> {
    let destination = Destination::open(file)?;
    initialize_tracing(level, destination)
}

/// Initialize tracing subscriber with the given default level.
fn initialize_tracing(level: LevelFilter, destination: Destination) -> Result<(), Error> {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT")
        .inspect_err(|error| {
            warn!("Failed to read RUST_LOG_FORMAT, falling back to default: {error}")
        })
        .unwrap_or_default();

    let log_layer = match destination {
        Destination::Stderr => format_layer::<Registry, _>(&log_format, std::io::stderr, true),
        Destination::File(file) => format_layer::<Registry, _>(&log_format, file, false),
    }
    .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(log_layer)
        .try_init()
        .map_err(|_| Error::AlreadyInitialized)
}

fn format_layer<S, W>(
    log_format: &str,
    writer: W,
    ansi: bool,
) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    match log_format {
        "json" => tracing_subscriber::fmt::layer().json().with_writer(writer).boxed(),
        _ => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    }
}
