//! Session lifecycle states.

use std::fmt;

/// Lifecycle state of the probe session
///
/// [`super::ReconnectingClient`] publishes all four while it dials and
/// greets the node. A [`super::ProbeSession`] only exists once its handshake
/// has succeeded, so its own state is `Ready` until it becomes `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Dialing the node
    Connecting,
    /// Connected, waiting for `NodeHello`
    AwaitingHandshake,
    /// Handshake complete; probe requests may be sent
    Ready,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::AwaitingHandshake => write!(f, "awaiting handshake"),
            SessionState::Ready => write!(f, "ready"),
        }
    }
}
