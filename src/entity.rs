//! Entities: dynamically-typed mirrors of remote objects.
//!
//! An entity is identified by `(class_name, object_id)` and carries an
//! arbitrary field map. Entities are always handled through `Arc` so the
//! identity cache can hand out the same live instance to every caller;
//! reference identity (`Arc::ptr_eq`) is the notion of "same object"
//! throughout the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::value::Value;

/// A dynamically-typed record mirrored to storage.
///
/// An entity with no object id is "new": it has never been assigned an
/// identity by the remote system and cannot be persisted or pointed to.
pub struct Entity {
  class_name: String,
  inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
  object_id: Option<String>,
  fields: HashMap<String, Value>,
  created_at: Option<DateTime<Utc>>,
  updated_at: Option<DateTime<Utc>>,
}

impl Entity {
  /// Create a new, unsaved entity of the given class.
  pub fn new(class_name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      class_name: class_name.into(),
      inner: Mutex::new(Inner::default()),
    })
  }

  /// Create an empty placeholder for a known identity, with no fields
  /// hydrated yet.
  pub fn without_data(class_name: impl Into<String>, object_id: impl Into<String>) -> Arc<Self> {
    let entity = Self::new(class_name);
    entity
      .locked()
      .object_id
      .replace(object_id.into());
    entity
  }

  pub fn class_name(&self) -> &str {
    &self.class_name
  }

  pub fn object_id(&self) -> Option<String> {
    self.locked().object_id.clone()
  }

  /// True if the entity has never been assigned an object id.
  pub fn is_new(&self) -> bool {
    self.locked().object_id.is_none()
  }

  /// Assign the object id. Ids are handed out once by the remote system
  /// and immutable afterwards; re-assigning a different id is an error.
  pub fn set_object_id(&self, object_id: impl Into<String>) -> Result<()> {
    let object_id = object_id.into();
    let mut inner = self.locked();
    match &inner.object_id {
      Some(existing) if *existing != object_id => Err(Error::InvalidState(format!(
        "object id of {}#{} is immutable",
        self.class_name, existing
      ))),
      _ => {
        inner.object_id = Some(object_id);
        Ok(())
      }
    }
  }

  /// Get a field value, if set.
  pub fn get(&self, field: &str) -> Option<Value> {
    self.locked().fields.get(field).cloned()
  }

  /// Set a field value.
  pub fn set(&self, field: impl Into<String>, value: impl Into<Value>) {
    self.locked().fields.insert(field.into(), value.into());
  }

  /// Remove a field.
  pub fn unset(&self, field: &str) {
    self.locked().fields.remove(field);
  }

  /// Snapshot of the current field map.
  pub fn fields(&self) -> HashMap<String, Value> {
    self.locked().fields.clone()
  }

  pub fn created_at(&self) -> Option<DateTime<Utc>> {
    self.locked().created_at
  }

  pub fn set_created_at(&self, at: DateTime<Utc>) {
    self.locked().created_at = Some(at);
  }

  pub fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.locked().updated_at
  }

  pub fn set_updated_at(&self, at: DateTime<Utc>) {
    self.locked().updated_at = Some(at);
  }

  /// Replace the whole field map in one step; used when hydrating from a
  /// persisted payload.
  pub(crate) fn replace_fields(&self, fields: HashMap<String, Value>) {
    self.locked().fields = fields;
  }

  /// True if hydration has populated at least one field.
  pub fn is_hydrated(&self) -> bool {
    !self.locked().fields.is_empty()
  }

  fn locked(&self) -> MutexGuard<'_, Inner> {
    // A panic while holding the lock leaves plain data behind, which is
    // still safe to read.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl std::fmt::Debug for Entity {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.locked();
    f.debug_struct("Entity")
      .field("class_name", &self.class_name)
      .field("object_id", &inner.object_id)
      .field("fields", &inner.fields.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_entity_has_no_id() {
    let entity = Entity::new("Note");
    assert!(entity.is_new());
    assert_eq!(entity.object_id(), None);
  }

  #[test]
  fn object_id_is_write_once() {
    let entity = Entity::new("Note");
    entity.set_object_id("n1").unwrap();
    assert_eq!(entity.object_id().as_deref(), Some("n1"));

    // Same id again is fine, a different one is not
    entity.set_object_id("n1").unwrap();
    assert!(matches!(
      entity.set_object_id("n2"),
      Err(Error::InvalidState(_))
    ));
  }

  #[test]
  fn field_access() {
    let entity = Entity::new("Note");
    entity.set("text", "hi");
    entity.set("count", 2);
    assert_eq!(entity.get("text"), Some(Value::String("hi".to_string())));
    assert_eq!(entity.get("count"), Some(Value::Integer(2)));

    entity.unset("count");
    assert_eq!(entity.get("count"), None);
  }

  #[test]
  fn placeholder_is_not_hydrated() {
    let entity = Entity::without_data("Note", "n1");
    assert!(!entity.is_hydrated());
    assert_eq!(entity.object_id().as_deref(), Some("n1"));
  }
}
