//! FCP message representation.
//!
//! A message on the wire is a header line carrying the message name, any
//! number of `Key=Value` field lines and a terminating `EndMessage` line.

use std::fmt;

/// Terminator line of every message we send or accept
pub const END_MESSAGE: &str = "EndMessage";

/// Field used to correlate requests with their replies
pub const IDENTIFIER: &str = "Identifier";

/// A single FCP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message name, e.g. `ProbeRequest` or `NodeHello`
    pub name: String,

    /// Fields in wire order
    pub fields: Vec<(String, String)>,
}

impl Message {
    /// Create a message without fields
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new() }
    }

    /// Append a field
    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.push((key.into(), value.to_string()));
        self
    }

    /// Look up the first field with the given key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// The request identifier this message refers to, if any
    pub fn identifier(&self) -> Option<&str> {
        self.get(IDENTIFIER)
    }

    /// Human readable summary of a `ProtocolError` style message
    pub fn describe(&self) -> String {
        match (self.get("CodeDescription"), self.get("Code")) {
            (Some(description), Some(code)) => format!("{description} (code {code})"),
            (Some(description), None) => description.to_string(),
            (None, Some(code)) => format!("{} code {code}", self.name),
            (None, None) => self.name.clone(),
        }
    }

    /// Serialize into wire form, including the trailing newline
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.name.len() + 16 + self.fields.len() * 24);
        out.push_str(&self.name);
        out.push('\n');
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out.push_str(END_MESSAGE);
        out.push('\n');
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(identifier) = self.identifier() {
            write!(f, " [{identifier}]")?;
        }
        Ok(())
    }
}
