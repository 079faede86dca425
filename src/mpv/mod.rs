//! MPV IPC module - spawns and controls external MPV player via JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection and process spawning
//! - `ipc.rs` - Command/response correlation and event delivery over one connection
//! - `protocol.rs` - JSON command/response/event types and line framing

mod ipc;
mod process;
mod protocol;

pub use ipc::{IpcError, MpvIpc};
pub use process::{find_mpv, spawn_mpv, ProcessError};
pub use protocol::{
  FrameBuffer, MpvCommand, MpvEvent, MpvMessage, MpvResponse, PropertyChange, ProtocolError,
};
