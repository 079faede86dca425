//! Owner of the MPV connection and the published player state.
//!
//! Holds at most one live [`MpvIpc`] at a time. A background task per
//! connection reduces property-change events into the [`PropertySet`] and
//! publishes every change on the [`Hub`]. When the connection goes away the
//! task tears it down, frees the slot and publishes `connected: false`; the
//! next explicit connect dials again.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::ConfigError;
use crate::hub::{Hub, Notification};
use crate::instance::InstanceError;
use crate::ipc::TransportError;
use crate::mpv::{IpcError, MpvCommand, MpvEvent, MpvIpc, MpvResponse, ProcessError};
use crate::properties::{PropertySet, PROPERTIES};

#[derive(Error, Debug)]
pub enum AppError {
  #[error("IPC error: {0}")]
  Ipc(#[from] IpcError),
  #[error("Not connected to MPV")]
  NotConnected,
  #[error("Process error: {0}")]
  Process(#[from] ProcessError),
  #[error("Instance error: {0}")]
  Instance(#[from] InstanceError),
  #[error("Config error: {0}")]
  Config(#[from] ConfigError),
}

pub struct App {
  endpoint: String,
  mpv: Mutex<Option<Arc<MpvIpc>>>,
  /// Event task of the current or most recent connection.
  events_task: Mutex<Option<JoinHandle<()>>>,
  /// Serializes dials so only one connection attempt runs at a time.
  connecting: tokio::sync::Mutex<()>,
  properties: PropertySet,
  hub: Hub,
}

impl App {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      mpv: Mutex::new(None),
      events_task: Mutex::new(None),
      connecting: tokio::sync::Mutex::new(()),
      properties: PropertySet::new(),
      hub: Hub::new(),
    }
  }

  pub fn endpoint(&self) -> &str {
    &self.endpoint
  }

  pub fn hub(&self) -> &Hub {
    &self.hub
  }

  /// Dial MPV and start observing every watched property.
  ///
  /// Returns `Ok(false)` if a live connection already exists.
  pub async fn connect_to_mpv(self: &Arc<Self>, timeout: Duration) -> Result<bool, AppError> {
    let _connecting = self.connecting.lock().await;

    if self.is_connected() {
      log::debug!("Already connected to MPV");
      return Ok(false);
    }
    self.wait_for_teardown().await;

    let ipc = MpvIpc::connect(&self.endpoint, timeout).await?;
    self.attach(ipc).await;
    Ok(true)
  }

  /// Install `ipc` as the live connection, start its event task and register
  /// the property observers. A rejected observer is logged and skipped; the
  /// connection stays installed.
  async fn attach(self: &Arc<Self>, ipc: MpvIpc) {
    let ipc = Arc::new(ipc);
    *self.mpv.lock() = Some(ipc.clone());
    self
      .hub
      .publish(&Notification::global_property("connected", true))
      .await;

    let task = tokio::spawn(self.clone().run_events(ipc.clone()));
    *self.events_task.lock() = Some(task);

    for spec in PROPERTIES {
      match ipc.observe_property(spec.wire_name).await {
        Ok(observer_id) => log::debug!("Observing {} as {}", spec.wire_name, observer_id),
        Err(e) => log::warn!("Failed to observe {}: {}", spec.wire_name, e),
      }
    }

    log::info!("Connected to MPV at {}", self.endpoint);
  }

  async fn run_events(self: Arc<Self>, ipc: Arc<MpvIpc>) {
    let events = ipc.events();

    while let Ok(event) = events.recv().await {
      match event {
        MpvEvent::PropertyChange(change) => {
          if let Some(update) = self.properties.update(&change.name, change.data.as_ref()) {
            self
              .hub
              .publish(&Notification::global_property(update.name, update.value))
              .await;
          }
        }
      }
    }

    match ipc.close().await {
      Ok(()) | Err(IpcError::Transport(TransportError::AlreadyClosed)) => {}
      Err(e) => log::warn!("Failed to close MPV connection: {}", e),
    }

    {
      let mut slot = self.mpv.lock();
      if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &ipc)) {
        *slot = None;
      }
    }

    log::info!("Disconnected from MPV");
    self
      .hub
      .publish(&Notification::global_property("connected", false))
      .await;
  }

  /// Wait until the previous connection's event task has finished tearing down.
  async fn wait_for_teardown(&self) {
    let task = self.events_task.lock().take();
    if let Some(task) = task {
      if let Err(e) = task.await {
        log::error!("MPV event task panicked: {}", e);
      }
    }
  }

  /// Close the live connection, if any, and wait for its teardown. Holds off
  /// new dials until the old pumps are joined.
  pub async fn disconnect(&self) {
    let _connecting = self.connecting.lock().await;
    let ipc = self.mpv.lock().clone();
    if let Some(ipc) = ipc {
      log::info!("Closing MPV connection");
      if let Err(e) = ipc.close().await {
        log::debug!("MPV connection was already closing: {}", e);
      }
    }
    self.wait_for_teardown().await;
  }

  fn current(&self) -> Result<Arc<MpvIpc>, AppError> {
    self
      .mpv
      .lock()
      .clone()
      .filter(|ipc| !ipc.is_closed())
      .ok_or(AppError::NotConnected)
  }

  /// Send a command to MPV and wait for its response.
  pub async fn send_command(
    &self,
    args: Vec<Value>,
    is_async: bool,
  ) -> Result<MpvResponse, AppError> {
    self
      .send(MpvCommand::new(args).with_async(is_async))
      .await
  }

  async fn send(&self, cmd: MpvCommand) -> Result<MpvResponse, AppError> {
    let ipc = self.current()?;
    Ok(ipc.send_command(cmd).await?)
  }

  /// Send an input.conf style text command.
  pub fn send_text_command(&self, text: &str) -> Result<(), AppError> {
    let ipc = self.current()?;
    Ok(ipc.send_text_command(text)?)
  }

  pub fn is_connected(&self) -> bool {
    self.current().is_ok()
  }

  /// Notifications a new viewer needs to render the current state.
  pub fn startup_events(&self) -> Vec<Notification> {
    let mut events = vec![Notification::global_property(
      "connected",
      self.is_connected(),
    )];
    events.extend(
      self
        .properties
        .snapshot()
        .into_iter()
        .map(|update| Notification::global_property(update.name, update.value)),
    );
    events.push(Notification::global_property("ready", true));
    events
  }

  /// Handle the argument list of a later launch: open its file argument.
  pub async fn handle_forwarded_args(self: &Arc<Self>, args: Vec<String>) {
    let Some(file) = args.get(1) else {
      log::debug!("Forwarded arguments carry no file: {:?}", args);
      return;
    };

    if !self.is_connected() {
      if let Err(e) = self.connect_to_mpv(Duration::ZERO).await {
        log::warn!("Failed to reconnect to MPV: {}", e);
      }
    }

    match self.send(MpvCommand::loadfile(file)).await {
      Ok(_) => log::info!("Loaded forwarded file {}", file),
      Err(e) => log::error!("Failed to send loadfile command to MPV: {}", e),
    }
  }

  /// Drop the connection and close every subscriber.
  pub async fn shutdown(&self) {
    self.disconnect().await;
    self.hub.close();
  }
}
