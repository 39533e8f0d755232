//! Probe session with a single trusted node.
//!
//! A [`ProbeSession`] owns one FCP connection. It performs the
//! `ClientHello`/`NodeHello` handshake, then runs a reader task that routes
//! every reply to the request that is waiting for it. Requests are correlated
//! by an `Identifier` generated here, so any number of them may be in flight.

mod error;
mod reconnect;
mod state;

pub use error::SessionError;
pub use reconnect::{ReconnectPolicy, ReconnectingClient, SessionObserver};
pub use state::SessionState;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{FcpCodec, Message, ProbeOutcome, ProbeRequest};
use crate::FCP_VERSION;

/// Connection parameters for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name announced in `ClientHello`; must be unique per node
    pub client_name: String,

    /// How long to wait for `NodeHello`
    pub handshake_timeout: Duration,

    /// How long a single probe may take before it is abandoned
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            client_name: "fnprobe".to_string(),
            handshake_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(600),
        }
    }
}

type Waiters = HashMap<String, oneshot::Sender<Message>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the session handle and its reader task
struct Shared {
    waiters: Mutex<Waiters>,
    state: watch::Sender<SessionState>,
    reason: Mutex<Option<String>>,
}

impl Shared {
    fn waiters(&self) -> MutexGuard<'_, Waiters> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move to `Disconnected` and fail every outstanding request.
    /// The first reason recorded wins.
    fn disconnect(&self, reason: String) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.state.send_replace(SessionState::Disconnected);
        self.waiters().clear();
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string())
    }
}

/// Removes its waiter when dropped, so a cancelled or timed out request
/// never receives a late reply.
struct Registration<'a> {
    shared: &'a Shared,
    identifier: String,
}

impl<'a> Registration<'a> {
    fn insert(shared: &'a Shared, identifier: String, tx: oneshot::Sender<Message>) -> Self {
        shared.waiters().insert(identifier.clone(), tx);
        Self { shared, identifier }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.shared.waiters().remove(&self.identifier);
    }
}

/// An established FCP session
pub struct ProbeSession {
    endpoint: String,
    config: SessionConfig,
    writer: tokio::sync::Mutex<BoxedWriter>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl ProbeSession {
    /// Open the TCP connection a session is then established over
    pub(crate) async fn dial(endpoint: &str) -> Result<TcpStream, SessionError> {
        debug!(endpoint, "connecting to node");
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|source| SessionError::Connect { endpoint: endpoint.to_string(), source })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Perform the handshake over an already connected stream
    pub async fn establish<S>(
        endpoint: impl Into<String>,
        stream: S,
        config: SessionConfig,
    ) -> Result<Self, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let endpoint = endpoint.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);
        let mut writer: BoxedWriter = Box::new(write_half);
        let mut codec = FcpCodec;

        let hello = Message::new("ClientHello")
            .with_field("Name", &config.client_name)
            .with_field("ExpectedVersion", FCP_VERSION);
        codec.write_message(&mut writer, &hello).await?;

        let reply = timeout(config.handshake_timeout, codec.read_message(&mut reader))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(config.handshake_timeout))??;

        match reply {
            Some(message) if message.name == "NodeHello" => {
                debug!(
                    endpoint = %endpoint,
                    version = message.get("Version").unwrap_or("unknown"),
                    "handshake complete"
                );
            }
            Some(message) if message.name == "ProtocolError" => {
                return Err(SessionError::HandshakeIncompatible(message.describe()));
            }
            Some(message) if message.name == "CloseConnectionDuplicateClientName" => {
                return Err(SessionError::TransportLost(format!(
                    "another client is connected as {}",
                    config.client_name
                )));
            }
            Some(message) => {
                return Err(SessionError::HandshakeIncompatible(format!(
                    "unexpected {} during handshake",
                    message.name
                )));
            }
            None => {
                return Err(SessionError::TransportLost(
                    "node closed the connection during handshake".to_string(),
                ));
            }
        }

        let (state, _) = watch::channel(SessionState::Ready);
        let shared =
            Arc::new(Shared { waiters: Mutex::new(HashMap::new()), state, reason: Mutex::new(None) });
        let reader = tokio::spawn(read_loop(reader, Arc::clone(&shared)));

        Ok(Self { endpoint, config, writer: tokio::sync::Mutex::new(writer), shared, reader })
    }

    /// Send a probe request and wait for its outcome
    pub async fn send(&self, request: &ProbeRequest) -> Result<ProbeOutcome, SessionError> {
        let identifier = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let registration = Registration::insert(&self.shared, identifier.clone(), tx);

        // Checked after registering: a disconnect from here on clears our waiter.
        if self.state() != SessionState::Ready {
            return Err(SessionError::NotReady);
        }

        {
            let mut writer = self.writer.lock().await;
            let message = request.to_message(&identifier);
            if let Err(err) = FcpCodec.write_message(&mut *writer, &message).await {
                self.shared.disconnect(err.to_string());
                return Err(SessionError::TransportLost(err.to_string()));
            }
        }

        let reply = match timeout(self.config.response_timeout, rx).await {
            Err(_) => return Err(SessionError::ResponseTimeout(self.config.response_timeout)),
            Ok(Err(_)) => return Err(SessionError::TransportLost(self.shared.reason())),
            Ok(Ok(reply)) => reply,
        };
        drop(registration);

        if reply.name == "ProtocolError" {
            return Err(SessionError::HandshakeIncompatible(reply.describe()));
        }
        Ok(ProbeOutcome::from_message(request.probe_type, &reply)?)
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Resolves once the session is disconnected, yielding the reason
    pub async fn closed(&self) -> String {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `self.shared`, so this only returns on a match.
        let _ = state.wait_for(|state| *state == SessionState::Disconnected).await;
        self.shared.reason()
    }

    /// Say goodbye to the node and tear the session down
    pub async fn close(&self) {
        if self.state() == SessionState::Disconnected {
            return;
        }
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = FcpCodec.write_message(&mut *writer, &Message::new("Disconnect")).await
            {
                debug!(error = %err, "failed to send Disconnect");
            }
        }
        self.reader.abort();
        self.shared.disconnect("closed locally".to_string());
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Number of requests waiting for a reply
    pub fn in_flight(&self) -> usize {
        self.shared.waiters().len()
    }
}

impl Drop for ProbeSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>)
where
    R: AsyncBufRead + Unpin,
{
    let mut codec = FcpCodec;
    let reason = loop {
        match codec.read_message(&mut reader).await {
            Ok(Some(message)) => dispatch(&shared, message),
            Ok(None) => break "node closed the connection".to_string(),
            Err(err) => break err.to_string(),
        }
    };

    debug!(%reason, "session reader stopped");
    shared.disconnect(reason);
}

fn dispatch(shared: &Shared, message: Message) {
    if let Some(identifier) = message.identifier().map(str::to_owned) {
        let waiter = shared.waiters().remove(&identifier);
        match waiter {
            // The receiver may have given up in the meantime; nothing to do then.
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!(%message, "discarding reply for unknown or cancelled request"),
        }
    } else if message.name == "ProtocolError" {
        warn!(description = %message.describe(), "node reported a protocol error");
        for (_, tx) in shared.waiters().drain() {
            let _ = tx.send(message.clone());
        }
    } else {
        debug!(%message, "ignoring unsolicited message");
    }
}
