//! Protocol module for FCP.
//!
//! This module contains the message representation, the line codec and the
//! mapping between probe messages and typed probe outcomes.

pub mod codec;
pub mod message;
pub mod probe;

pub use codec::FcpCodec;
pub use message::Message;
pub use probe::{DecodeError, ProbeErrorType, ProbeOutcome, ProbeRequest, ProbeResult, ProbeType};
