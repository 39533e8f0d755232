//! Single-writer gateway.
//!
//! One worker task owns the write connection. Callers queue commits through a
//! cloneable [`GatewayHandle`]; each commit runs in its own transaction and is
//! retried with exponential backoff while the store is locked by someone else.

use std::time::Duration;

use async_trait::async_trait;
use libsql::{Connection, TransactionBehavior};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// SQLITE_BUSY and SQLITE_LOCKED primary result codes
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

/// Pending commits buffered before callers have to wait
const QUEUE_DEPTH: usize = 256;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("store writer has shut down")]
    Closed,

    #[error("store stayed locked after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: libsql::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] libsql::Error),

    #[error("write rejected: {0}")]
    Rejected(String),
}

fn is_lock_contention(err: &libsql::Error) -> bool {
    match err {
        libsql::Error::SqliteFailure(code, _) => matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED),
        other => {
            let message = other.to_string();
            message.contains("database is locked") || message.contains("database table is locked")
        }
    }
}

/// A unit of work applied atomically by the gateway
#[async_trait]
pub trait Commit: Send + Sync + 'static {
    /// Issue the statements of this commit. Runs inside a transaction.
    async fn apply(&self, conn: &Connection) -> Result<(), GatewayError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub busy_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
            max_attempts: 8,
        }
    }
}

enum Command {
    Commit { op: Box<dyn Commit>, reply: oneshot::Sender<Result<(), GatewayError>> },
    Shutdown { done: oneshot::Sender<()> },
}

/// Cloneable handle to the writer task
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    /// Start the writer task. It owns `conn` until shutdown.
    pub fn spawn(conn: Connection, config: GatewayConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = tokio::spawn(run_writer(conn, config, rx));
        (Self { tx }, worker)
    }

    /// Queue `op` and wait until it is durably committed or has failed
    pub async fn commit<C: Commit>(&self, op: C) -> Result<(), GatewayError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Commit { op: Box::new(op), reply })
            .await
            .map_err(|_| GatewayError::Closed)?;
        response.await.map_err(|_| GatewayError::Closed)?
    }

    /// Finish every commit queued so far, then close the write connection
    pub async fn shutdown(&self) {
        let (done, finished) = oneshot::channel();
        if self.tx.send(Command::Shutdown { done }).await.is_ok() {
            let _ = finished.await;
        }
    }
}

async fn run_writer(conn: Connection, config: GatewayConfig, mut rx: mpsc::Receiver<Command>) {
    if let Err(err) = super::set_busy_timeout(&conn, config.busy_timeout).await {
        warn!(error = %err, "failed to set busy timeout on the write connection");
    }
    debug!("store writer started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Commit { op, reply } => {
                let result = commit_with_retry(&conn, op.as_ref(), &config).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { done } => {
                rx.close();
                // Commits queued behind the shutdown request still get written.
                while let Some(command) = rx.recv().await {
                    match command {
                        Command::Commit { op, reply } => {
                            let result = commit_with_retry(&conn, op.as_ref(), &config).await;
                            let _ = reply.send(result);
                        }
                        Command::Shutdown { done } => {
                            let _ = done.send(());
                        }
                    }
                }
                drop(conn);
                info!("store writer closed");
                let _ = done.send(());
                return;
            }
        }
    }

    debug!("all gateway handles dropped, store writer stopping");
}

async fn commit_with_retry(
    conn: &Connection,
    op: &dyn Commit,
    config: &GatewayConfig,
) -> Result<(), GatewayError> {
    let mut backoff = config.initial_backoff;
    let mut attempt = 1;

    loop {
        match commit_once(conn, op).await {
            Ok(()) => return Ok(()),
            Err(GatewayError::Database(source)) if is_lock_contention(&source) => {
                if attempt >= config.max_attempts {
                    error!(attempts = attempt, error = %source, "giving up on locked store");
                    return Err(GatewayError::RetriesExhausted { attempts: attempt, source });
                }

                if attempt == 1 {
                    warn!(attempt, ?backoff, error = %source, "store is locked, retrying");
                } else {
                    debug!(attempt, ?backoff, error = %source, "store is locked, retrying");
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

async fn commit_once(conn: &Connection, op: &dyn Commit) -> Result<(), GatewayError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;

    match op.apply(&tx).await {
        Ok(()) => {
            tx.commit().await?;
            Ok(())
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}
