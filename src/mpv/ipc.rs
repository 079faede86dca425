//! Async IPC connection to MPV.
//!
//! Correlates command responses by request ID and forwards unsolicited events,
//! both multiplexed over one [`Connection`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{FrameBuffer, MpvCommand, MpvEvent, MpvMessage, MpvResponse, ProtocolError};
use crate::ipc::{self, Connection, TransportError};

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Transport error: {0}")]
  Transport(#[from] TransportError),
  #[error("Failed to encode command: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("MPV error: {0}")]
  Command(String),
  #[error("Invalid text command: {0}")]
  InvalidTextCommand(&'static str),
  #[error("Disconnected")]
  Disconnected,
}

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<Result<MpvResponse, IpcError>>;

/// Correlation state shared between callers and the dispatcher.
struct IpcState {
  pending: HashMap<i64, PendingRequest>,
  /// Set once the dispatcher has released every waiter; no new waiter may register.
  closed: bool,
}

/// MPV IPC connection.
pub struct MpvIpc {
  conn: Connection,
  state: Arc<Mutex<IpcState>>,
  event_rx: Receiver<MpvEvent>,
  next_observer_id: AtomicI64,
  dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl MpvIpc {
  /// Connect to the MPV IPC socket/pipe, retrying until `timeout` elapses.
  pub async fn connect(endpoint: &str, timeout: Duration) -> Result<Self, IpcError> {
    let conn = ipc::dial(endpoint, timeout).await?;
    log::info!("Connected to MPV IPC at {}", endpoint);
    Ok(Self::with_connection(conn))
  }

  /// Wrap an open connection and start dispatching its inbound traffic.
  pub fn with_connection(conn: Connection) -> Self {
    let state = Arc::new(Mutex::new(IpcState {
      pending: HashMap::new(),
      closed: false,
    }));
    let (event_tx, event_rx) = async_channel::unbounded();

    let dispatcher = tokio::spawn(Self::dispatch_loop(conn.inbound(), state.clone(), event_tx));

    Self {
      conn,
      state,
      event_rx,
      next_observer_id: AtomicI64::new(1),
      dispatcher: Mutex::new(Some(dispatcher)),
    }
  }

  async fn dispatch_loop(
    inbound: Receiver<Vec<u8>>,
    state: Arc<Mutex<IpcState>>,
    event_tx: Sender<MpvEvent>,
  ) {
    log::info!("MPV IPC reader loop started");
    let mut frames = FrameBuffer::new();

    while let Ok(chunk) = inbound.recv().await {
      frames.extend(&chunk);
      while let Some(line) = frames.next_message() {
        if line.iter().all(u8::is_ascii_whitespace) {
          continue;
        }
        Self::dispatch_message(&line, &state, &event_tx);
      }
    }

    if !frames.remaining().is_empty() {
      log::warn!(
        "Discarding {} bytes of unterminated MPV message",
        frames.remaining().len()
      );
    }

    let pending = {
      let mut state = state.lock();
      state.closed = true;
      std::mem::take(&mut state.pending)
    };
    if !pending.is_empty() {
      log::warn!("Releasing {} pending MPV requests", pending.len());
    }
    for (_, tx) in pending {
      let _ = tx.send(Err(IpcError::Disconnected));
    }

    log::info!("MPV IPC reader loop stopped");
  }

  fn dispatch_message(line: &[u8], state: &Mutex<IpcState>, event_tx: &Sender<MpvEvent>) {
    match MpvMessage::parse(line) {
      Ok(MpvMessage::Response(response)) => {
        log::debug!(
          "MPV reader: received response for request_id={}",
          response.request_id
        );
        let request_id = response.request_id;
        let waiter = state.lock().pending.remove(&request_id);
        match waiter {
          Some(tx) => {
            let result = if response.is_success() {
              Ok(response)
            } else {
              Err(IpcError::Command(response.error))
            };
            if tx.send(result).is_err() {
              log::debug!(
                "Caller for request_id={} went away, dropping response",
                request_id
              );
            }
          }
          None => log::warn!("Got response for unknown request_id={}", request_id),
        }
      }
      Ok(MpvMessage::Event(event)) => {
        log::trace!("MPV reader: received event {:?}", event);
        if event_tx.try_send(event).is_err() {
          log::warn!("MPV event queue closed, dropping event");
        }
      }
      Err(ProtocolError::UnknownEvent(name)) => {
        log::debug!("Ignoring unhandled MPV event \"{}\"", name);
      }
      Err(e) => {
        log::warn!(
          "Failed to parse MPV message: {} - {}",
          e,
          String::from_utf8_lossy(line)
        );
      }
    }
  }

  /// Send a command and wait for its response.
  ///
  /// There is no per-command timeout: the caller is released when the
  /// response arrives or when the connection goes away.
  pub async fn send(
    &self,
    args: Vec<serde_json::Value>,
    is_async: bool,
  ) -> Result<MpvResponse, IpcError> {
    self
      .send_command(MpvCommand::new(args).with_async(is_async))
      .await
  }

  /// Send a prepared command and wait for its response.
  pub async fn send_command(&self, cmd: MpvCommand) -> Result<MpvResponse, IpcError> {
    let request_id = cmd.request_id;
    let line = cmd.to_line()?;
    let (tx, rx) = oneshot::channel();

    {
      let mut state = self.state.lock();
      if state.closed {
        return Err(IpcError::Disconnected);
      }
      state.pending.insert(request_id, tx);
    }

    log::debug!(
      "Sending MPV command: {}",
      String::from_utf8_lossy(&line).trim_end()
    );

    if let Err(e) = self.conn.write(line) {
      self.state.lock().pending.remove(&request_id);
      return Err(e.into());
    }

    match rx.await {
      Ok(result) => result,
      Err(_) => {
        log::error!("MPV IPC response channel closed unexpectedly");
        Err(IpcError::Disconnected)
      }
    }
  }

  /// Write an input.conf style text command. MPV sends no response for these.
  pub fn send_text_command(&self, text: &str) -> Result<(), IpcError> {
    if text.is_empty() {
      return Err(IpcError::InvalidTextCommand("command is empty"));
    }
    if text.starts_with('{') {
      return Err(IpcError::InvalidTextCommand("text command cannot start with '{'"));
    }
    let mut line = text.as_bytes().to_vec();
    line.push(b'\n');
    self.conn.write(line)?;
    Ok(())
  }

  /// Observe a property for changes, returning the observer ID used.
  /// Changes arrive via [`events`](Self::events) as property-change events.
  pub async fn observe_property(&self, name: &str) -> Result<i64, IpcError> {
    let observer_id = self.next_observer_id.fetch_add(1, Ordering::SeqCst);
    self
      .send_command(MpvCommand::observe_property(observer_id, name))
      .await?;
    Ok(observer_id)
  }

  /// Get the event receiver. It ends once the connection is gone.
  pub fn events(&self) -> Receiver<MpvEvent> {
    self.event_rx.clone()
  }

  pub fn is_closed(&self) -> bool {
    self.conn.is_closed()
  }

  /// Close the connection and wait until the dispatcher has released every waiter.
  pub async fn close(&self) -> Result<(), IpcError> {
    let closed = self.conn.close().await;

    let dispatcher = self.dispatcher.lock().take();
    if let Some(handle) = dispatcher {
      if let Err(e) = handle.await {
        log::error!("MPV IPC dispatcher panicked: {}", e);
      }
    }

    closed.map_err(IpcError::from)
  }
}
