//! Probe message definitions.
//!
//! This module defines the closed set of probe kinds a node can be asked
//! for, the request message, and the typed outcome a reply decodes into.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::{Message, IDENTIFIER};

/// Kind of network probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeType {
    Bandwidth,
    Build,
    Identifier,
    LinkLengths,
    Location,
    StoreSize,
    #[serde(rename = "UPTIME_48H")]
    Uptime48h,
    #[serde(rename = "UPTIME_7D")]
    Uptime7d,
}

impl ProbeType {
    /// Every probe kind, ordered by storage code
    pub const ALL: [ProbeType; 8] = [
        ProbeType::Bandwidth,
        ProbeType::Build,
        ProbeType::Identifier,
        ProbeType::LinkLengths,
        ProbeType::Location,
        ProbeType::StoreSize,
        ProbeType::Uptime48h,
        ProbeType::Uptime7d,
    ];

    /// Name used in the `Type` field of a `ProbeRequest`
    pub fn as_str(self) -> &'static str {
        match self {
            ProbeType::Bandwidth => "BANDWIDTH",
            ProbeType::Build => "BUILD",
            ProbeType::Identifier => "IDENTIFIER",
            ProbeType::LinkLengths => "LINK_LENGTHS",
            ProbeType::Location => "LOCATION",
            ProbeType::StoreSize => "STORE_SIZE",
            ProbeType::Uptime48h => "UPTIME_48H",
            ProbeType::Uptime7d => "UPTIME_7D",
        }
    }

    /// Fixed integer code persisted in the record store
    pub fn code(self) -> i64 {
        match self {
            ProbeType::Bandwidth => 0,
            ProbeType::Build => 1,
            ProbeType::Identifier => 2,
            ProbeType::LinkLengths => 3,
            ProbeType::Location => 4,
            ProbeType::StoreSize => 5,
            ProbeType::Uptime48h => 6,
            ProbeType::Uptime7d => 7,
        }
    }

    /// Inverse of [`ProbeType::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }

    /// Name of the reply message carrying a result for this kind
    fn reply_name(self) -> &'static str {
        match self {
            ProbeType::Bandwidth => "ProbeBandwidth",
            ProbeType::Build => "ProbeBuild",
            ProbeType::Identifier => "ProbeIdentifier",
            ProbeType::LinkLengths => "ProbeLinkLengths",
            ProbeType::Location => "ProbeLocation",
            ProbeType::StoreSize => "ProbeStoreSize",
            ProbeType::Uptime48h | ProbeType::Uptime7d => "ProbeUptime",
        }
    }
}

impl fmt::Display for ProbeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownProbeType(s.to_string()))
    }
}

/// Error kinds a node reports in `ProbeError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeErrorType {
    Disconnected,
    Overload,
    Timeout,
    Unknown,
    UnrecognizedType,
    CannotForward,
}

impl ProbeErrorType {
    /// Every error kind, ordered by storage code
    pub const ALL: [ProbeErrorType; 6] = [
        ProbeErrorType::Disconnected,
        ProbeErrorType::Overload,
        ProbeErrorType::Timeout,
        ProbeErrorType::Unknown,
        ProbeErrorType::UnrecognizedType,
        ProbeErrorType::CannotForward,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProbeErrorType::Disconnected => "DISCONNECTED",
            ProbeErrorType::Overload => "OVERLOAD",
            ProbeErrorType::Timeout => "TIMEOUT",
            ProbeErrorType::Unknown => "UNKNOWN",
            ProbeErrorType::UnrecognizedType => "UNRECOGNIZED_TYPE",
            ProbeErrorType::CannotForward => "CANNOT_FORWARD",
        }
    }

    /// Fixed integer code persisted in the record store
    pub fn code(self) -> i64 {
        match self {
            ProbeErrorType::Disconnected => 0,
            ProbeErrorType::Overload => 1,
            ProbeErrorType::Timeout => 2,
            ProbeErrorType::Unknown => 3,
            ProbeErrorType::UnrecognizedType => 4,
            ProbeErrorType::CannotForward => 5,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for ProbeErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProbeErrorType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DecodeError::InvalidField { field: "Type", value: s.to_string() })
    }
}

/// A probe request to be sent to the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeRequest {
    /// The kind of probe
    pub probe_type: ProbeType,

    /// Hop budget for the probe's random walk
    pub hops_to_live: u8,
}

impl ProbeRequest {
    pub fn new(probe_type: ProbeType, hops_to_live: u8) -> Self {
        Self { probe_type, hops_to_live }
    }

    /// Build the wire message for this request
    pub fn to_message(&self, identifier: &str) -> Message {
        Message::new("ProbeRequest")
            .with_field(IDENTIFIER, identifier)
            .with_field("Type", self.probe_type.as_str())
            .with_field("HopsToLive", self.hops_to_live)
    }
}

/// Kind-specific payload of a successful probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// Output bandwidth limit in KiB/s
    Bandwidth { output_kib: f64 },
    Build { build: i64 },
    /// Per-session random identifier of the endpoint and its uptime
    Identifier { identifier: i64, uptime_percent: i64 },
    /// Distances to each of the endpoint's peers
    LinkLengths { lengths: Vec<f64> },
    Location { location: f64 },
    /// Datastore size in GiB
    StoreSize { gib: f64 },
    Uptime48h { percent: f64 },
    Uptime7d { percent: f64 },
}

impl ProbeResult {
    /// The probe kind this payload answers
    pub fn probe_type(&self) -> ProbeType {
        match self {
            ProbeResult::Bandwidth { .. } => ProbeType::Bandwidth,
            ProbeResult::Build { .. } => ProbeType::Build,
            ProbeResult::Identifier { .. } => ProbeType::Identifier,
            ProbeResult::LinkLengths { .. } => ProbeType::LinkLengths,
            ProbeResult::Location { .. } => ProbeType::Location,
            ProbeResult::StoreSize { .. } => ProbeType::StoreSize,
            ProbeResult::Uptime48h { .. } => ProbeType::Uptime48h,
            ProbeResult::Uptime7d { .. } => ProbeType::Uptime7d,
        }
    }
}

/// Terminal answer to one probe request
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Result(ProbeResult),
    Error { kind: ProbeErrorType, code: Option<i64>, local: bool },
    Refused,
}

impl ProbeOutcome {
    /// Decode the node's reply to a request of kind `requested`
    pub fn from_message(requested: ProbeType, message: &Message) -> Result<Self, DecodeError> {
        match message.name.as_str() {
            "ProbeRefused" => return Ok(ProbeOutcome::Refused),
            "ProbeError" => {
                let kind = required(message, "Type")?.parse()?;
                let code = message.get("Code").map(|raw| parse_field("Code", raw)).transpose()?;
                let local = match message.get("Local") {
                    Some(raw) => parse_bool("Local", raw)?,
                    None => false,
                };
                return Ok(ProbeOutcome::Error { kind, code, local });
            }
            name if name != requested.reply_name() => {
                return Err(DecodeError::UnexpectedReply {
                    requested,
                    received: message.name.clone(),
                })
            }
            _ => {}
        }

        let result = match requested {
            ProbeType::Bandwidth => {
                ProbeResult::Bandwidth { output_kib: parse_required(message, "OutputBandwidth")? }
            }
            ProbeType::Build => ProbeResult::Build { build: parse_required(message, "Build")? },
            ProbeType::Identifier => ProbeResult::Identifier {
                identifier: parse_required(message, "ProbeIdentifier")?,
                uptime_percent: parse_required(message, "UptimePercent")?,
            },
            ProbeType::LinkLengths => {
                let raw = required(message, "LinkLengths")?;
                let lengths = raw
                    .split(';')
                    .filter(|part| !part.is_empty())
                    .map(|part| parse_field("LinkLengths", part))
                    .collect::<Result<Vec<f64>, _>>()?;
                ProbeResult::LinkLengths { lengths }
            }
            ProbeType::Location => {
                ProbeResult::Location { location: parse_required(message, "Location")? }
            }
            ProbeType::StoreSize => {
                ProbeResult::StoreSize { gib: parse_required(message, "StoreSize")? }
            }
            ProbeType::Uptime48h => {
                ProbeResult::Uptime48h { percent: parse_required(message, "UptimePercent")? }
            }
            ProbeType::Uptime7d => {
                ProbeResult::Uptime7d { percent: parse_required(message, "UptimePercent")? }
            }
        };

        Ok(ProbeOutcome::Result(result))
    }
}

/// Reply could not be mapped onto a probe outcome
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown probe type {0:?}")]
    UnknownProbeType(String),
    #[error("reply is missing field {0}")]
    MissingField(&'static str),
    #[error("field {field} has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("requested {requested} but received {received}")]
    UnexpectedReply { requested: ProbeType, received: String },
}

fn required<'a>(message: &'a Message, field: &'static str) -> Result<&'a str, DecodeError> {
    message.get(field).ok_or(DecodeError::MissingField(field))
}

fn parse_required<T: FromStr>(message: &Message, field: &'static str) -> Result<T, DecodeError> {
    parse_field(field, required(message, field)?)
}

fn parse_field<T: FromStr>(field: &'static str, raw: &str) -> Result<T, DecodeError> {
    raw.trim()
        .parse()
        .map_err(|_| DecodeError::InvalidField { field, value: raw.to_string() })
}

fn parse_bool(field: &'static str, raw: &str) -> Result<bool, DecodeError> {
    match raw.trim() {
        "true" | "TRUE" | "True" => Ok(true),
        "false" | "FALSE" | "False" => Ok(false),
        _ => Err(DecodeError::InvalidField { field, value: raw.to_string() }),
    }
}
