//! Fan-out of player notifications to live viewers.
//!
//! Publishing is synchronous per subscriber, in registration order. Each
//! subscriber has a queue of [`SUBSCRIBER_QUEUE`] messages; once a viewer stops
//! draining it and the queue fills, `publish` waits on that viewer and the
//! whole feed stalls until it drains or is unsubscribed.

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// Messages buffered per subscriber before `publish` waits on it.
pub const SUBSCRIBER_QUEUE: usize = 16;

pub type SubscriberId = u64;

/// Notification delivered to viewers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub event: &'static str,
  pub property_name: String,
  pub value: Value,
}

impl Notification {
  pub fn global_property(property_name: impl Into<String>, value: impl Into<Value>) -> Self {
    Self {
      event: "set-global-property",
      property_name: property_name.into(),
      value: value.into(),
    }
  }
}

/// A registered delivery sink.
pub struct Subscriber {
  id: SubscriberId,
  messages: Receiver<String>,
}

impl Subscriber {
  pub fn id(&self) -> SubscriberId {
    self.id
  }

  /// Next serialized notification, or `None` once unsubscribed.
  pub async fn recv(&self) -> Option<String> {
    self.messages.recv().await.ok()
  }

  /// Next queued notification without waiting.
  pub fn try_recv(&self) -> Option<String> {
    self.messages.try_recv().ok()
  }
}

struct HubState {
  subscribers: Vec<(SubscriberId, Sender<String>)>,
  counter: SubscriberId,
}

pub struct Hub {
  state: Mutex<HubState>,
  /// Keeps concurrent publishers from interleaving their deliveries.
  publishing: tokio::sync::Mutex<()>,
}

impl Hub {
  pub fn new() -> Self {
    Self {
      state: Mutex::new(HubState {
        subscribers: Vec::new(),
        counter: 0,
      }),
      publishing: tokio::sync::Mutex::new(()),
    }
  }

  pub fn subscribe(&self) -> Subscriber {
    let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE);
    let mut state = self.state.lock();
    state.counter += 1;
    let id = state.counter;
    state.subscribers.push((id, tx));
    log::debug!("Created subscriber {}", id);
    Subscriber { id, messages: rx }
  }

  /// Remove a subscriber and close its sink.
  ///
  /// A subscriber dropped without calling this is removed on the next
  /// `publish` instead.
  ///
  /// # Panics
  /// If `id` is not currently registered.
  pub fn unsubscribe(&self, id: SubscriberId) {
    let tx = {
      let mut state = self.state.lock();
      let Some(index) = state.subscribers.iter().position(|(sid, _)| *sid == id) else {
        panic!("unknown subscriber {}", id);
      };
      state.subscribers.remove(index).1
    };
    tx.close();
    log::debug!("Closed subscriber {}", id);
  }

  /// Deliver `notification` to every subscriber registered when the call starts.
  pub async fn publish(&self, notification: &Notification) {
    let message = match serde_json::to_string(notification) {
      Ok(message) => message,
      Err(e) => {
        log::error!("Failed to serialize notification: {}", e);
        return;
      }
    };

    let _publishing = self.publishing.lock().await;
    let sinks: Vec<_> = self
      .state
      .lock()
      .subscribers
      .iter()
      .map(|(id, tx)| (*id, tx.clone()))
      .collect();

    for (id, tx) in sinks {
      if tx.send(message.clone()).await.is_err() {
        self.prune(id);
      }
    }
  }

  /// Forget a subscriber whose receiver was dropped without unsubscribing.
  fn prune(&self, id: SubscriberId) {
    let mut state = self.state.lock();
    if let Some(index) = state.subscribers.iter().position(|(sid, _)| *sid == id) {
      state.subscribers.remove(index);
      log::debug!("Dropped subscriber {} without unsubscribe, removing it", id);
    } else {
      log::debug!("Subscriber {} left before delivery", id);
    }
  }

  pub fn len(&self) -> usize {
    self.state.lock().subscribers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Unsubscribe everyone, closing every sink.
  pub fn close(&self) {
    let subscribers = std::mem::take(&mut self.state.lock().subscribers);
    for (id, tx) in subscribers {
      tx.close();
      log::debug!("Closed subscriber {}", id);
    }
  }
}

impl Default for Hub {
  fn default() -> Self {
    Self::new()
  }
}
