#![warn(clippy::all)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fcp::ReconnectingClient;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

mod analysis;
mod config;
mod database;
mod pool;
mod probing;

use analysis::series::BUCKET_SECS;
use analysis::{Aggregator, ReportSettings, SeriesStore, write_reports};
use config::Config;
use database::{GatewayHandle, RecordStore};
use pool::LibsqlPool;
use probing::{Fatal, ProbeObserver, ProbeScheduler};

const EXIT_STARTUP: u8 = 1;
const EXIT_INCOMPATIBLE: u8 = 2;
const EXIT_STORE: u8 = 3;

#[derive(Parser)]
#[command(author, version, about = "Freenet network prober and population estimator")]
struct Cli {
    /// Configuration file, created with defaults when missing
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overriding the configuration file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the network through the configured node until interrupted
    Probe,
    /// Bring the network size series up to date
    Analyze {
        /// Also write the distribution reports
        #[arg(long)]
        reports: bool,
        /// Keep running, catching up once per bucket
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("fnprobe: {err}");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let level = logger::parse_level(cli.log_level.as_deref().unwrap_or(&config.log.level));
    if let Err(err) = logger::init_tracing(level, config.log.file.as_deref()) {
        eprintln!("fnprobe: {err}");
        return ExitCode::from(EXIT_STARTUP);
    }
    debug!("{}", config);

    let result = match cli.command {
        Command::Probe => probe(config).await,
        Command::Analyze { reports, watch } => {
            analyze(config, reports, watch).await.map(|()| ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(status) => status,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

async fn open_record_store(config: &Config) -> Result<RecordStore> {
    let path = &config.database.path;
    let store = RecordStore::open(path, Duration::from_millis(config.database.busy_timeout_ms))
        .await
        .with_context(|| format!("failed to open record store {}", path.display()))?;
    info!("Record store {} is ready", store.path().display());
    Ok(store)
}

/// Aggregator over the record store plus the writer of its time-series store
struct Analysis {
    readers: LibsqlPool,
    aggregator: Arc<Aggregator>,
    series_gateway: GatewayHandle,
    series_writer: JoinHandle<()>,
}

impl Analysis {
    async fn open(config: &Config, store: &RecordStore) -> Result<Self> {
        let path = &config.analysis.series_path;
        let series = SeriesStore::open(path, Duration::from_millis(config.database.busy_timeout_ms))
            .await
            .with_context(|| format!("failed to open series store {}", path.display()))?;
        let series = Arc::new(series);

        let (series_gateway, series_writer) =
            GatewayHandle::spawn(series.connect().await?, config.gateway_config());
        let readers = store.readers(config.database.reader_pool_size)?;
        let aggregator =
            Arc::new(Aggregator::new(readers.clone(), series, series_gateway.clone()));

        Ok(Self { readers, aggregator, series_gateway, series_writer })
    }

    /// One catch-up pass, optionally followed by the reports
    async fn run_once(&self, reports: Option<&ReportSettings>) -> Result<()> {
        let run_start = chrono::Utc::now().timestamp();
        self.aggregator.catch_up(run_start).await?;
        if let Some(row) = self.aggregator.latest().await? {
            info!(
                "Bucket ending {}: instantaneous size {} | daily effective size {} | weekly effective size {}",
                row.bucket_end, row.instantaneous_size, row.daily_size, row.effective_size
            );
        }

        if let Some(settings) = reports {
            let conn = self.readers.get().await.context("no record store reader available")?;
            write_reports(&conn, settings, run_start).await?;
        }
        Ok(())
    }

    async fn close(self) {
        self.series_gateway.shutdown().await;
        let _ = self.series_writer.await;
    }
}

async fn analyze(config: Config, reports: bool, watch: bool) -> Result<()> {
    let store = open_record_store(&config).await?;
    let analysis = Analysis::open(&config, &store).await?;
    let settings = reports.then(|| config.report_settings());

    let result = if watch {
        let mut ticker = tokio::time::interval(Duration::from_secs(BUCKET_SECS as u64));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
            }
            if let Err(err) = analysis.run_once(settings.as_ref()).await {
                break Err(err);
            }
        }
    } else {
        analysis.run_once(settings.as_ref()).await
    };

    analysis.close().await;
    result
}

async fn probe(config: Config) -> Result<ExitCode> {
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    let store = open_record_store(&config).await?;
    let (gateway, writer) = GatewayHandle::spawn(store.writer().await?, config.gateway_config());

    let (fatal_tx, mut fatal_rx) = mpsc::channel(8);
    let scheduler = Arc::new(ProbeScheduler::new(
        config.schedule_config(),
        Arc::new(gateway.clone()),
        fatal_tx,
    ));
    let observer = Arc::new(ProbeObserver::new(Arc::clone(&scheduler)));

    let analysis = match config.analysis.in_process_interval_minutes {
        Some(minutes) => {
            let analysis = Analysis::open(&config, &store).await?;
            let every = Duration::from_secs(minutes.saturating_mul(60));
            let task = Arc::clone(&analysis.aggregator).start_periodic(every);
            info!("Aggregating in process every {} minutes", minutes);
            Some((analysis, task))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let client = ReconnectingClient::new(
        config.endpoint(),
        config.session_config(),
        config.reconnect_policy(),
    );
    let mut client = tokio::spawn(client.run(observer, shutdown_rx));
    info!("Probing through {}", config.endpoint());

    let mut client_done = false;
    let status = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            ExitCode::SUCCESS
        }
        _ = terminate.recv() => {
            info!("Terminated, shutting down");
            ExitCode::SUCCESS
        }
        Some(fatal) = fatal_rx.recv() => {
            error!("{}", fatal);
            match fatal {
                Fatal::Incompatible(_) => ExitCode::from(EXIT_INCOMPATIBLE),
                Fatal::Store(_) => ExitCode::from(EXIT_STORE),
            }
        }
        result = &mut client => {
            client_done = true;
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(err)) => {
                    error!("Giving up on {}: {}", config.endpoint(), err);
                    ExitCode::from(EXIT_INCOMPATIBLE)
                }
                Err(err) => {
                    error!("Session task failed: {}", err);
                    ExitCode::from(EXIT_STARTUP)
                }
            }
        }
    };

    scheduler.stop();
    let _ = shutdown_tx.send(true);
    if !client_done {
        let _ = client.await;
    }
    if let Some((analysis, task)) = analysis {
        task.abort();
        analysis.close().await;
    }
    gateway.shutdown().await;
    let _ = writer.await;
    info!("Record store closed");

    Ok(status)
}
