use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fcp::{ProbeRequest, SessionError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use super::{Fatal, ProbeTransport, RecordSink, ScheduleConfig};
use crate::database::{GatewayError, ProbeRecord};

/// Probe scheduler - runs the configured number of probe streams against
/// whichever session is currently ready
pub struct ProbeScheduler {
    config: Arc<ScheduleConfig>,
    sink: Arc<dyn RecordSink>,
    fatal_tx: mpsc::Sender<Fatal>,
    streams: Mutex<Vec<JoinHandle<()>>>,
}

impl ProbeScheduler {
    pub fn new(config: ScheduleConfig, sink: Arc<dyn RecordSink>, fatal_tx: mpsc::Sender<Fatal>) -> Self {
        Self { config: Arc::new(config), sink, fatal_tx, streams: Mutex::new(Vec::new()) }
    }

    fn streams(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start every stream against `transport`, replacing any running ones.
    /// Stream `i` sends its first probe `i` staggers from now.
    pub fn start(&self, transport: Arc<dyn ProbeTransport>) {
        let stagger = self.config.stagger();
        let now = Instant::now();

        let mut streams = self.streams();
        for stream in streams.drain(..) {
            stream.abort();
        }
        for index in 0..self.config.streams {
            let first = now + stagger * index as u32;
            streams.push(tokio::spawn(run_stream(
                index,
                first,
                Arc::clone(&self.config),
                Arc::clone(&transport),
                Arc::clone(&self.sink),
                self.fatal_tx.clone(),
            )));
        }

        info!(
            "Started {} probe streams, one probe every {:?} per stream",
            self.config.streams, self.config.period
        );
    }

    /// Cancel every stream, including probes in flight
    pub fn stop(&self) {
        let mut streams = self.streams();
        if streams.is_empty() {
            return;
        }
        for stream in streams.drain(..) {
            stream.abort();
        }
        info!("Stopped probe streams");
    }

    /// Number of streams still running
    pub fn active_streams(&self) -> usize {
        let mut streams = self.streams();
        streams.retain(|stream| !stream.is_finished());
        streams.len()
    }
}

impl Drop for ProbeScheduler {
    fn drop(&mut self) {
        for stream in self.streams().drain(..) {
            stream.abort();
        }
    }
}

async fn run_stream(
    index: usize,
    first: Instant,
    config: Arc<ScheduleConfig>,
    transport: Arc<dyn ProbeTransport>,
    sink: Arc<dyn RecordSink>,
    fatal_tx: mpsc::Sender<Fatal>,
) {
    let mut timer = interval_at(first, config.period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut rng = StdRng::from_entropy();
    let mut failures: u32 = 0;

    loop {
        timer.tick().await;

        let Some(&probe_type) = config.types.choose(&mut rng) else {
            warn!(stream = index, "no probe types configured");
            return;
        };
        let request = ProbeRequest::new(probe_type, config.hops_to_live);

        let sent_at = chrono::Utc::now();
        let sent = Instant::now();
        let result = transport.probe(&request).await;
        let duration = sent.elapsed();
        // Outcomes are stamped when they arrive, on the monotonic clock.
        let observed_at = chrono::TimeDelta::from_std(duration)
            .ok()
            .and_then(|elapsed| sent_at.checked_add_signed(elapsed))
            .unwrap_or(sent_at)
            .timestamp();

        let outcome = match result {
            Ok(outcome) => {
                failures = 0;
                outcome
            }
            Err(SessionError::TransportLost(_) | SessionError::NotReady) => {
                debug!(stream = index, "session gone, stream pausing");
                return;
            }
            Err(err) if err.is_fatal() => {
                error!(stream = index, error = %err, "node rejected probe request");
                let _ = fatal_tx.send(Fatal::Incompatible(err)).await;
                return;
            }
            Err(err) => {
                log_repeated(failures, index, &err);
                failures = failures.saturating_add(1);
                continue;
            }
        };

        debug!(stream = index, %probe_type, ?duration, "probe answered");
        let record = ProbeRecord {
            observed_at,
            hops_to_live: config.hops_to_live,
            duration,
            probe_type,
            outcome,
        };
        match sink.record(record).await {
            Ok(()) => {}
            Err(GatewayError::Closed) => {
                debug!(stream = index, "store writer closed, stream stopping");
                return;
            }
            Err(err @ GatewayError::RetriesExhausted { .. }) => {
                error!(stream = index, error = %err, "failed to store probe outcome");
                let _ = fatal_tx.send(Fatal::Store(err)).await;
                return;
            }
            Err(err) => warn!(stream = index, error = %err, "dropping probe outcome"),
        }
    }
}

/// Repeated failures are logged at decreasing severity.
fn log_repeated(previous_failures: u32, stream: usize, err: &SessionError) {
    match previous_failures {
        0 => warn!(stream, error = %err, "probe failed"),
        1..=4 => info!(stream, error = %err, "probe failed"),
        _ => debug!(stream, error = %err, "probe failed"),
    }
}
