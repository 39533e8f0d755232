use std::sync::Arc;

use async_trait::async_trait;
use fcp::{ProbeSession, SessionError, SessionObserver};
use tracing::{error, info};

use super::ProbeScheduler;

/// Runs the probe streams exactly while a session is ready
pub struct ProbeObserver {
    scheduler: Arc<ProbeScheduler>,
}

impl ProbeObserver {
    pub fn new(scheduler: Arc<ProbeScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl SessionObserver for ProbeObserver {
    async fn on_connected(&self, session: Arc<ProbeSession>) {
        info!("Session with {} is ready, starting probes", session.endpoint());
        self.scheduler.start(session);
    }

    async fn on_disconnected(&self, reason: &str) {
        self.scheduler.stop();
        info!("Probes paused until the node is reachable again: {}", reason);
    }

    async fn on_handshake_failed(&self, error: &SessionError) {
        self.scheduler.stop();
        error!(
            "The node refused the session ({}). It must run a build that supports \
             ProbeRequest over FCP; upgrade the node before restarting fnprobe.",
            error
        );
    }
}
