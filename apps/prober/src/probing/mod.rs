//! Probe scheduling.
//!
//! Streams issue probes through a [`ProbeTransport`] and hand every outcome to
//! a [`RecordSink`]. Conditions the process cannot recover from are reported
//! as [`Fatal`] on a channel owned by `main`.

pub mod observer;
pub mod scheduler;

pub use observer::ProbeObserver;
pub use scheduler::ProbeScheduler;

use std::time::Duration;

use async_trait::async_trait;
use fcp::{ProbeOutcome, ProbeRequest, ProbeSession, ProbeType, SessionError};
use thiserror::Error;

use crate::database::{GatewayError, GatewayHandle, ProbeRecord};

/// Timing and content of the probe streams
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub streams: usize,
    /// Time between two probes of the same stream
    pub period: Duration,
    pub hops_to_live: u8,
    pub types: Vec<ProbeType>,
}

impl ScheduleConfig {
    /// Offset between the first probes of consecutive streams
    pub fn stagger(&self) -> Duration {
        self.period / self.streams.max(1) as u32
    }
}

/// Something that can run a probe
#[async_trait]
pub trait ProbeTransport: Send + Sync {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeOutcome, SessionError>;
}

#[async_trait]
impl ProbeTransport for ProbeSession {
    async fn probe(&self, request: &ProbeRequest) -> Result<ProbeOutcome, SessionError> {
        self.send(request).await
    }
}

/// Where probe outcomes are persisted
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn record(&self, record: ProbeRecord) -> Result<(), GatewayError>;
}

#[async_trait]
impl RecordSink for GatewayHandle {
    async fn record(&self, record: ProbeRecord) -> Result<(), GatewayError> {
        self.commit(record).await
    }
}

/// Reasons the prober has to stop
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("node cannot serve probes: {0}")]
    Incompatible(SessionError),

    #[error("record store write failed: {0}")]
    Store(GatewayError),
}
