//! Reducer from MPV property-change events to the published player state.
//!
//! The watched properties are a static table; each row names the MPV property,
//! the name it is published under, and how its raw value is interpreted.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

/// How a raw MPV value is turned into the stored value, with its default.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyKind {
  /// Seconds, stored as `HH:MM:SS`. Defaults to `00:00:00`.
  Duration,
  Flag(bool),
  Number(f64),
  Text(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct PropertySpec {
  /// Name MPV uses in `observe_property` and property-change events.
  pub wire_name: &'static str,
  /// Name the value is published under.
  pub name: &'static str,
  pub kind: PropertyKind,
}

/// Watched properties, in snapshot order.
pub const PROPERTIES: &[PropertySpec] = &[
  PropertySpec {
    wire_name: "playback-time",
    name: "playbackTime",
    kind: PropertyKind::Duration,
  },
  PropertySpec {
    wire_name: "duration",
    name: "duration",
    kind: PropertyKind::Duration,
  },
  PropertySpec {
    wire_name: "pause",
    name: "pause",
    kind: PropertyKind::Flag(false),
  },
  PropertySpec {
    wire_name: "volume",
    name: "volume",
    kind: PropertyKind::Number(100.0),
  },
  PropertySpec {
    wire_name: "path",
    name: "path",
    kind: PropertyKind::Text(""),
  },
  PropertySpec {
    wire_name: "speed",
    name: "speed",
    kind: PropertyKind::Number(1.0),
  },
];

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
  Bool(bool),
  Number(f64),
  String(String),
}

impl From<PropertyValue> for Value {
  fn from(value: PropertyValue) -> Self {
    match value {
      PropertyValue::Bool(b) => Value::Bool(b),
      PropertyValue::Number(n) => serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null),
      PropertyValue::String(s) => Value::String(s),
    }
  }
}

/// Format seconds as `HH:MM:SS`, truncating fractions. Negative or non-finite
/// input formats as `00:00:00`.
pub fn format_duration(seconds: f64) -> String {
  if !seconds.is_finite() || seconds < 0.0 {
    return "00:00:00".to_string();
  }
  let total = seconds as u64;
  let hours = total / 3600;
  let minutes = (total % 3600) / 60;
  format!("{:02}:{:02}:{:02}", hours, minutes, total % 60)
}

impl PropertySpec {
  pub fn lookup(wire_name: &str) -> Option<(usize, &'static PropertySpec)> {
    PROPERTIES
      .iter()
      .enumerate()
      .find(|(_, spec)| spec.wire_name == wire_name)
  }

  pub fn default_value(&self) -> PropertyValue {
    match self.kind {
      PropertyKind::Duration => PropertyValue::String(format_duration(0.0)),
      PropertyKind::Flag(b) => PropertyValue::Bool(b),
      PropertyKind::Number(n) => PropertyValue::Number(n),
      PropertyKind::Text(s) => PropertyValue::String(s.to_string()),
    }
  }

  /// Derive the stored value from a raw MPV value. Null resets to the default.
  pub fn derive(&self, raw: Option<&Value>) -> PropertyValue {
    let raw = match raw {
      None | Some(Value::Null) => {
        log::debug!("No value for {}, using default", self.wire_name);
        return self.default_value();
      }
      Some(raw) => raw,
    };

    let derived = match (self.kind, raw) {
      (PropertyKind::Duration, raw) => raw.as_f64().map(|s| PropertyValue::String(format_duration(s))),
      (PropertyKind::Flag(_), Value::Bool(b)) => Some(PropertyValue::Bool(*b)),
      (PropertyKind::Number(_), raw) => raw.as_f64().map(PropertyValue::Number),
      (PropertyKind::Text(_), Value::String(s)) => Some(PropertyValue::String(s.clone())),
      _ => None,
    };

    derived.unwrap_or_else(|| {
      log::warn!(
        "Unexpected value for {}: {}, using default",
        self.wire_name,
        raw
      );
      self.default_value()
    })
  }
}

/// A stored value that changed, under its published name.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyUpdate {
  pub name: &'static str,
  pub value: PropertyValue,
}

/// Last known value of every watched property.
pub struct PropertySet {
  values: Mutex<Vec<PropertyValue>>,
}

impl PropertySet {
  pub fn new() -> Self {
    Self {
      values: Mutex::new(PROPERTIES.iter().map(PropertySpec::default_value).collect()),
    }
  }

  /// Store a raw value, reporting whether the derived value changed.
  pub fn apply(&self, wire_name: &str, raw: Option<&Value>) -> bool {
    self.update(wire_name, raw).is_some()
  }

  /// Store a raw value, returning the new value if it differs from the old one.
  pub fn update(&self, wire_name: &str, raw: Option<&Value>) -> Option<PropertyUpdate> {
    let Some((index, spec)) = PropertySpec::lookup(wire_name) else {
      log::warn!("Ignoring change of unwatched property \"{}\"", wire_name);
      return None;
    };

    let value = spec.derive(raw);
    let mut values = self.values.lock();
    if values[index] == value {
      log::trace!("{} did not change", wire_name);
      return None;
    }
    values[index] = value.clone();

    Some(PropertyUpdate {
      name: spec.name,
      value,
    })
  }

  /// Current value of every property, in table order.
  pub fn snapshot(&self) -> Vec<PropertyUpdate> {
    let values = self.values.lock();
    PROPERTIES
      .iter()
      .zip(values.iter())
      .map(|(spec, value)| PropertyUpdate {
        name: spec.name,
        value: value.clone(),
      })
      .collect()
  }
}

impl Default for PropertySet {
  fn default() -> Self {
    Self::new()
  }
}
