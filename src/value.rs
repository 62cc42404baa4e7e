//! Dynamically-typed field values.
//!
//! Entities hold an arbitrary mapping of field name to `Value`. A value is
//! either a scalar, a reference to another entity, or a plain composite
//! (list or map) that is traversed transparently by the store.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::entity::Entity;

/// A dynamically-typed field value.
#[derive(Debug, Clone)]
pub enum Value {
  Null,
  Bool(bool),
  Integer(i64),
  Float(f64),
  String(String),
  /// Reference to another entity. Serialized as a lightweight pointer
  /// token, never as an embedded copy.
  Pointer(Arc<Entity>),
  List(Vec<Value>),
  Map(HashMap<String, Value>),
}

impl Value {
  pub fn is_null(&self) -> bool {
    matches!(self, Value::Null)
  }

  /// True for non-composite, non-pointer values.
  pub fn is_scalar(&self) -> bool {
    matches!(
      self,
      Value::Null | Value::Bool(_) | Value::Integer(_) | Value::Float(_) | Value::String(_)
    )
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Integer(n) => Some(*n),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Value::Float(n) => Some(*n),
      Value::Integer(n) => Some(*n as f64),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_entity(&self) -> Option<&Arc<Entity>> {
    match self {
      Value::Pointer(e) => Some(e),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Value]> {
    match self {
      Value::List(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
    match self {
      Value::Map(m) => Some(m),
      _ => None,
    }
  }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Value::Null, Value::Null) => true,
      (Value::Bool(a), Value::Bool(b)) => a == b,
      (Value::Integer(a), Value::Integer(b)) => a == b,
      (Value::Float(a), Value::Float(b)) => a == b,
      (Value::String(a), Value::String(b)) => a == b,
      // Pointers compare by instance identity, matching the one-live-object
      // guarantee of the identity cache.
      (Value::Pointer(a), Value::Pointer(b)) => Arc::ptr_eq(a, b),
      (Value::List(a), Value::List(b)) => a == b,
      (Value::Map(a), Value::Map(b)) => a == b,
      _ => false,
    }
  }
}

impl From<bool> for Value {
  fn from(v: bool) -> Self {
    Value::Bool(v)
  }
}

impl From<i32> for Value {
  fn from(v: i32) -> Self {
    Value::Integer(i64::from(v))
  }
}

impl From<i64> for Value {
  fn from(v: i64) -> Self {
    Value::Integer(v)
  }
}

impl From<f64> for Value {
  fn from(v: f64) -> Self {
    Value::Float(v)
  }
}

impl From<&str> for Value {
  fn from(v: &str) -> Self {
    Value::String(v.to_string())
  }
}

impl From<String> for Value {
  fn from(v: String) -> Self {
    Value::String(v)
  }
}

/// Timestamps are stored as RFC 3339 text with fixed precision so that
/// lexicographic comparison matches chronological order.
impl From<DateTime<Utc>> for Value {
  fn from(v: DateTime<Utc>) -> Self {
    Value::String(format_timestamp(v))
  }
}

impl From<Arc<Entity>> for Value {
  fn from(v: Arc<Entity>) -> Self {
    Value::Pointer(v)
  }
}

impl From<&Arc<Entity>> for Value {
  fn from(v: &Arc<Entity>) -> Self {
    Value::Pointer(Arc::clone(v))
  }
}

impl From<Vec<Value>> for Value {
  fn from(v: Vec<Value>) -> Self {
    Value::List(v)
  }
}

impl From<HashMap<String, Value>> for Value {
  fn from(v: HashMap<String, Value>) -> Self {
    Value::Map(v)
  }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self {
    v.map(Into::into).unwrap_or(Value::Null)
  }
}

/// Render a timestamp in the canonical persisted form.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
  ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp in the canonical persisted form.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .ok()
    .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_conversions() {
    assert_eq!(Value::from(3), Value::Integer(3));
    assert_eq!(Value::from("hi"), Value::String("hi".to_string()));
    assert_eq!(Value::from(Option::<i64>::None), Value::Null);
    assert!(Value::from(1.5).is_scalar());
    assert!(!Value::List(vec![]).is_scalar());
  }

  #[test]
  fn timestamp_round_trip() {
    let now = Utc::now();
    let text = format_timestamp(now);
    let back = parse_timestamp(&text).unwrap();
    // Canonical form keeps microsecond precision
    assert_eq!(back.timestamp_micros(), now.timestamp_micros());
  }

  #[test]
  fn pointer_equality_is_by_instance() {
    let a = Entity::new("Note");
    let b = Entity::new("Note");
    assert_eq!(Value::from(&a), Value::from(&a));
    assert_ne!(Value::from(&a), Value::from(&b));
  }
}
