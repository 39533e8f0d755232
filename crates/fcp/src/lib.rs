//! fcp - Freenet Client Protocol plumbing for network probing
//!
//! This library speaks just enough FCP to hold a long-lived session with a
//! trusted node and ask it to run network probes on our behalf.

pub mod protocol;
pub mod session;

// Re-export main types
pub use protocol::{
    DecodeError, FcpCodec, Message, ProbeErrorType, ProbeOutcome, ProbeRequest, ProbeResult,
    ProbeType,
};
pub use session::{
    ProbeSession, ReconnectPolicy, ReconnectingClient, SessionConfig, SessionError,
    SessionObserver, SessionState,
};

/// The FCP version announced in `ClientHello`
pub const FCP_VERSION: &str = "2.0";

/// Default FCP port of a Freenet node
pub const DEFAULT_FCP_PORT: u16 = 9481;
