//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;

/// Global request ID counter for unique command identification.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for MPV commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Event name carried by property-change events.
pub const PROPERTY_CHANGE: &str = "property-change";

#[derive(Error, Debug)]
pub enum ProtocolError {
  #[error("Malformed message: {0}")]
  Malformed(#[from] serde_json::Error),
  #[error("Message is neither a response nor an event")]
  Unrecognized,
  #[error("Unknown mpv event \"{0}\"")]
  UnknownEvent(String),
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<serde_json::Value>,
  pub request_id: i64,
  /// Advisory; mpv runs the command asynchronously but still answers by request_id.
  #[serde(rename = "async", skip_serializing_if = "std::ops::Not::not")]
  pub is_async: bool,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
      is_async: false,
    }
  }

  pub fn with_async(mut self, is_async: bool) -> Self {
    self.is_async = is_async;
    self
  }

  /// Load a file for playback.
  pub fn loadfile(url: &str) -> Self {
    Self::new(vec!["loadfile".into(), url.into()])
  }

  /// Observe a property for changes.
  pub fn observe_property(id: i64, name: &str) -> Self {
    Self::new(vec!["observe_property".into(), id.into(), name.into()])
  }

  /// Serialize as one newline-terminated IPC line.
  pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<serde_json::Value>,
  /// Matching request ID.
  pub request_id: i64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }
}

/// Payload of a `property-change` event.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PropertyChange {
  /// Observer ID passed to `observe_property`.
  #[serde(default)]
  pub id: i64,
  pub name: String,
  /// Absent or null while the property is unavailable.
  #[serde(default)]
  pub data: Option<serde_json::Value>,
}

/// Unsolicited event sent by MPV.
#[derive(Debug, Clone, PartialEq)]
pub enum MpvEvent {
  PropertyChange(PropertyChange),
}

impl MpvEvent {
  pub fn name(&self) -> &'static str {
    match self {
      MpvEvent::PropertyChange(_) => PROPERTY_CHANGE,
    }
  }
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

#[derive(Deserialize)]
struct Header {
  #[serde(default)]
  request_id: Option<i64>,
  #[serde(default)]
  event: Option<String>,
}

impl MpvMessage {
  /// Classify one line from MPV.
  ///
  /// A non-zero `request_id` makes it a response. Anything else, including a
  /// reply with `request_id` 0, is parsed as an event by its `event` field.
  pub fn parse(line: &[u8]) -> Result<Self, ProtocolError> {
    let header: Header = serde_json::from_slice(line)?;

    if header.request_id.is_some_and(|id| id != 0) {
      let response: MpvResponse = serde_json::from_slice(line)?;
      return Ok(MpvMessage::Response(response));
    }

    match header.event.as_deref() {
      Some(PROPERTY_CHANGE) => {
        let change: PropertyChange = serde_json::from_slice(line)?;
        Ok(MpvMessage::Event(MpvEvent::PropertyChange(change)))
      }
      Some(other) => Err(ProtocolError::UnknownEvent(other.to_string())),
      None => Err(ProtocolError::Unrecognized),
    }
  }
}

/// Append-only buffer that yields complete newline-terminated messages.
#[derive(Debug, Default)]
pub struct FrameBuffer {
  buffer: Vec<u8>,
}

impl FrameBuffer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn extend(&mut self, chunk: &[u8]) {
    self.buffer.extend_from_slice(chunk);
  }

  /// Remove and return the next complete message, without its terminator.
  pub fn next_message(&mut self) -> Option<Vec<u8>> {
    let end = self.buffer.iter().position(|&b| b == b'\n')?;
    let mut message: Vec<u8> = self.buffer.drain(..=end).collect();
    message.pop();
    Some(message)
  }

  /// Bytes of an incomplete trailing message.
  pub fn remaining(&self) -> &[u8] {
    &self.buffer
  }
}
