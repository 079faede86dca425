//! Local IPC plumbing shared by the mpv control channel and the
//! single-instance channel.
//!
//! - `transport.rs` - dial-with-retry and the read/write pumps of a [`Connection`]
//! - `listener.rs` - exclusive listener for the server side of a channel

mod listener;
mod transport;

pub use listener::{IpcListener, ServerStream};
pub use transport::{dial, Connection, TransportError, RETRY_INTERVAL};
