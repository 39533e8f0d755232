//! Automatic reconnection.
//!
//! [`ReconnectingClient`] keeps a session to the node alive for as long as
//! the process runs, reporting lifecycle changes to a [`SessionObserver`].
//! Only a node that cannot serve probes at all ends the loop with an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{ProbeSession, SessionConfig, SessionError, SessionState};

/// Receives session lifecycle events
#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// A session completed its handshake and is ready for probes
    async fn on_connected(&self, session: Arc<ProbeSession>);

    /// The current session is gone; a new one will be attempted
    async fn on_disconnected(&self, reason: &str);

    /// The node rejected us in a way retrying cannot fix
    async fn on_handshake_failed(&self, error: &SessionError);
}

/// Exponential backoff between connection attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(3600), std::f64::consts::E)
    }
}

impl ReconnectPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: factor.max(1.0),
            jitter: 0.12,
            current: initial_delay,
            attempts: 0,
        }
    }

    /// Relative jitter applied to each delay, e.g. `0.12` for ±12%
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; grows on every call until [`reset`](Self::reset)
    pub fn next_delay(&mut self) -> Duration {
        let base = if self.attempts == 0 {
            self.initial_delay
        } else {
            self.current.mul_f64(self.factor).min(self.max_delay)
        };
        self.current = base;
        self.attempts += 1;

        if self.jitter == 0.0 {
            return base;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(1.0 + spread).min(self.max_delay)
    }

    /// Forget previous failures after a successful connection
    pub fn reset(&mut self) {
        self.current = self.initial_delay;
        self.attempts = 0;
    }

    /// Consecutive attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Keeps a probe session alive across disconnects
pub struct ReconnectingClient {
    endpoint: String,
    config: SessionConfig,
    policy: ReconnectPolicy,
    state: watch::Sender<SessionState>,
}

impl ReconnectingClient {
    pub fn new(endpoint: impl Into<String>, config: SessionConfig, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self { endpoint: endpoint.into(), config, policy, state }
    }

    /// Follow the state of whichever session is current
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    async fn open(&self) -> Result<ProbeSession, SessionError> {
        self.state.send_replace(SessionState::Connecting);
        let stream = ProbeSession::dial(&self.endpoint).await?;
        self.state.send_replace(SessionState::AwaitingHandshake);
        ProbeSession::establish(self.endpoint.clone(), stream, self.config.clone()).await
    }

    /// Run until `shutdown` flips to `true` or the node proves incompatible
    pub async fn run(
        mut self,
        observer: Arc<dyn SessionObserver>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SessionError> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let opened = self.open().await;
            match opened {
                Ok(session) => {
                    info!(endpoint = %self.endpoint, "connected to node");
                    self.policy.reset();
                    self.state.send_replace(SessionState::Ready);
                    let session = Arc::new(session);
                    observer.on_connected(Arc::clone(&session)).await;

                    tokio::select! {
                        reason = session.closed() => {
                            self.state.send_replace(SessionState::Disconnected);
                            observer.on_disconnected(&reason).await;
                            warn!(endpoint = %self.endpoint, %reason, "lost connection to node");
                        }
                        _ = shutdown.changed() => {
                            session.close().await;
                            self.state.send_replace(SessionState::Disconnected);
                            observer.on_disconnected("shutting down").await;
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    self.state.send_replace(SessionState::Disconnected);
                    if err.is_fatal() {
                        error!(endpoint = %self.endpoint, error = %err, "node cannot serve probes");
                        observer.on_handshake_failed(&err).await;
                        return Err(err);
                    }
                    log_repeated(self.policy.attempts(), &self.endpoint, &err);
                }
            }

            let delay = self.policy.next_delay();
            debug!(?delay, attempt = self.policy.attempts(), "reconnecting after delay");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }
}

/// Repeated failures are logged at decreasing severity.
fn log_repeated(previous_attempts: u32, endpoint: &str, err: &SessionError) {
    match previous_attempts {
        0 => warn!(endpoint, error = %err, "connection attempt failed"),
        1..=4 => info!(endpoint, error = %err, "connection attempt failed"),
        _ => debug!(endpoint, error = %err, "connection attempt failed"),
    }
}
