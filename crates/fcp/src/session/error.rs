//! Session error taxonomy.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::DecodeError;

/// Errors raised while connecting to or talking with the node
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// The node answered with `ProtocolError`: it cannot serve probes at all
    #[error("node does not support probes: {0}")]
    HandshakeIncompatible(String),

    #[error("no NodeHello within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("no reply within {0:?}")]
    ResponseTimeout(Duration),

    #[error("session is not ready")]
    NotReady,

    #[error("malformed reply: {0}")]
    Decode(#[from] DecodeError),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SessionError {
    /// Whether retrying can never succeed against this node
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::HandshakeIncompatible(_))
    }
}
