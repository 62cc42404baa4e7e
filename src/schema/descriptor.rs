//! Schema descriptors: which persisted-record slots play which role.
//!
//! A schema maps one logical class name to a record type (a table in the
//! embedded store) and names the slots holding the object id, the encoded
//! payload, the optional timestamps, and any denormalized key fields
//! promoted out of the payload for querying. Role assignments are declared
//! explicitly through the builder; every configuration mistake surfaces as
//! `Error::Configuration` from `build()`, never at encode/decode time.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// The record-type slot roles of one persisted class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
  class_name: String,
  record_type: String,
  object_id_slot: String,
  payload_slot: String,
  created_at_slot: Option<String>,
  updated_at_slot: Option<String>,
  /// Slot holding the class name. Only present on the generic record type,
  /// which hosts rows of every unregistered class side by side.
  class_name_slot: Option<String>,
  /// field name -> slot, for scalars promoted out of the payload
  key_slots: HashMap<String, String>,
}

impl Schema {
  /// Start declaring a schema for `class_name`, persisted as records of
  /// type `record_type`.
  pub fn builder(class_name: impl Into<String>, record_type: impl Into<String>) -> SchemaBuilder {
    SchemaBuilder {
      class_name: class_name.into(),
      record_type: record_type.into(),
      object_id_slot: None,
      payload_slot: None,
      created_at_slot: None,
      updated_at_slot: None,
      key_slots: Vec::new(),
      duplicate_role: None,
    }
  }

  /// The record shape used for classes with no registered schema: a shared
  /// table keyed by `(class_name, object_id)` with payload and timestamps
  /// but no denormalized keys.
  pub(crate) fn generic() -> Self {
    Self {
      class_name: String::new(),
      record_type: "mirror_objects".to_string(),
      object_id_slot: "object_id".to_string(),
      payload_slot: "data".to_string(),
      created_at_slot: Some("created_at".to_string()),
      updated_at_slot: Some("updated_at".to_string()),
      class_name_slot: Some("class_name".to_string()),
      key_slots: HashMap::new(),
    }
  }

  pub fn class_name(&self) -> &str {
    &self.class_name
  }

  pub fn record_type(&self) -> &str {
    &self.record_type
  }

  pub fn object_id_slot(&self) -> &str {
    &self.object_id_slot
  }

  pub fn payload_slot(&self) -> &str {
    &self.payload_slot
  }

  pub fn created_at_slot(&self) -> Option<&str> {
    self.created_at_slot.as_deref()
  }

  pub fn updated_at_slot(&self) -> Option<&str> {
    self.updated_at_slot.as_deref()
  }

  pub(crate) fn class_name_slot(&self) -> Option<&str> {
    self.class_name_slot.as_deref()
  }

  /// True for the shared fallback record type.
  pub fn is_generic(&self) -> bool {
    self.class_name_slot.is_some()
  }

  pub fn key_slots(&self) -> &HashMap<String, String> {
    &self.key_slots
  }

  /// The slot a queryable field maps to: the object id, a timestamp role,
  /// or a declared key.
  pub(crate) fn slot_for_field(&self, field: &str) -> Option<&str> {
    match field {
      "objectId" => Some(&self.object_id_slot),
      "createdAt" => self.created_at_slot.as_deref(),
      "updatedAt" => self.updated_at_slot.as_deref(),
      _ => self.key_slots.get(field).map(String::as_str),
    }
  }

  /// Every slot of the record type, in stable order, for table creation.
  pub(crate) fn all_slots(&self) -> Vec<&str> {
    let mut slots = Vec::new();
    if let Some(s) = &self.class_name_slot {
      slots.push(s.as_str());
    }
    slots.push(self.object_id_slot.as_str());
    slots.push(self.payload_slot.as_str());
    if let Some(s) = &self.created_at_slot {
      slots.push(s.as_str());
    }
    if let Some(s) = &self.updated_at_slot {
      slots.push(s.as_str());
    }
    let mut keys: Vec<&str> = self.key_slots.values().map(String::as_str).collect();
    keys.sort_unstable();
    slots.extend(keys);
    slots
  }

  /// Specificity ordering used by the registry to arbitrate duplicate
  /// registrations: `self` refines `other` when it keeps every role and key
  /// assignment of `other` intact and possibly adds more.
  pub(crate) fn refines(&self, other: &Schema) -> bool {
    if self.object_id_slot != other.object_id_slot || self.payload_slot != other.payload_slot {
      return false;
    }
    let role_kept = |mine: &Option<String>, theirs: &Option<String>| match theirs {
      Some(slot) => mine.as_deref() == Some(slot),
      None => true,
    };
    if !role_kept(&self.created_at_slot, &other.created_at_slot)
      || !role_kept(&self.updated_at_slot, &other.updated_at_slot)
    {
      return false;
    }
    other
      .key_slots
      .iter()
      .all(|(field, slot)| self.key_slots.get(field) == Some(slot))
  }
}

/// Builder for `Schema`, the declarative replacement for slot-role
/// annotations on record types.
pub struct SchemaBuilder {
  class_name: String,
  record_type: String,
  object_id_slot: Option<String>,
  payload_slot: Option<String>,
  created_at_slot: Option<String>,
  updated_at_slot: Option<String>,
  key_slots: Vec<(String, String)>,
  duplicate_role: Option<&'static str>,
}

impl SchemaBuilder {
  /// Name the slot holding the object id. Required, at most once.
  pub fn object_id(mut self, slot: impl Into<String>) -> Self {
    if self.object_id_slot.replace(slot.into()).is_some() {
      self.duplicate_role = Some("object id");
    }
    self
  }

  /// Name the slot holding the JSON-encoded payload. Required, at most once.
  pub fn payload(mut self, slot: impl Into<String>) -> Self {
    if self.payload_slot.replace(slot.into()).is_some() {
      self.duplicate_role = Some("payload");
    }
    self
  }

  /// Name the slot holding the creation timestamp.
  pub fn created_at(mut self, slot: impl Into<String>) -> Self {
    if self.created_at_slot.replace(slot.into()).is_some() {
      self.duplicate_role = Some("created at");
    }
    self
  }

  /// Name the slot holding the update timestamp.
  pub fn updated_at(mut self, slot: impl Into<String>) -> Self {
    if self.updated_at_slot.replace(slot.into()).is_some() {
      self.duplicate_role = Some("updated at");
    }
    self
  }

  /// Promote a payload field into its own slot so it can be queried.
  pub fn key(mut self, field: impl Into<String>, slot: impl Into<String>) -> Self {
    self.key_slots.push((field.into(), slot.into()));
    self
  }

  pub fn build(self) -> Result<Schema> {
    if let Some(role) = self.duplicate_role {
      return Err(Error::Configuration(format!(
        "{role} role must be unique in schema for {}",
        self.class_name
      )));
    }
    if self.class_name.is_empty() {
      return Err(Error::Configuration("class name must not be empty".to_string()));
    }
    if self.record_type.is_empty() {
      return Err(Error::Configuration(format!(
        "record type for class {} must not be empty",
        self.class_name
      )));
    }

    let object_id_slot = self.object_id_slot.ok_or_else(|| {
      Error::Configuration(format!(
        "{} must provide object id and payload slots",
        self.class_name
      ))
    })?;
    let payload_slot = self.payload_slot.ok_or_else(|| {
      Error::Configuration(format!(
        "{} must provide object id and payload slots",
        self.class_name
      ))
    })?;

    let mut key_slots = HashMap::new();
    for (field, slot) in self.key_slots {
      if key_slots.insert(field.clone(), slot).is_some() {
        return Err(Error::Configuration(format!(
          "key role for field {field} must be unique"
        )));
      }
    }

    let schema = Schema {
      class_name: self.class_name,
      record_type: self.record_type,
      object_id_slot,
      payload_slot,
      created_at_slot: self.created_at_slot,
      updated_at_slot: self.updated_at_slot,
      class_name_slot: None,
      key_slots,
    };

    // Each role must map to its own slot
    let mut seen = std::collections::HashSet::new();
    for slot in schema.all_slots() {
      if slot.is_empty() {
        return Err(Error::Configuration(format!(
          "empty slot name in schema for {}",
          schema.class_name
        )));
      }
      if !seen.insert(slot.to_string()) {
        return Err(Error::Configuration(format!(
          "slot {slot} is assigned to more than one role in schema for {}",
          schema.class_name
        )));
      }
    }

    Ok(schema)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn note_schema() -> Schema {
    Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .build()
      .unwrap()
  }

  #[test]
  fn builder_requires_id_and_payload() {
    let err = Schema::builder("Note", "notes").payload("data").build();
    assert!(matches!(err, Err(Error::Configuration(_))));

    let err = Schema::builder("Note", "notes").object_id("id").build();
    assert!(matches!(err, Err(Error::Configuration(_))));
  }

  #[test]
  fn builder_rejects_slot_reuse() {
    let err = Schema::builder("Note", "notes")
      .object_id("id")
      .payload("id")
      .build();
    assert!(matches!(err, Err(Error::Configuration(_))));

    let err = Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .key("title", "title")
      .key("body", "title")
      .build();
    assert!(matches!(err, Err(Error::Configuration(_))));
  }

  #[test]
  fn builder_rejects_duplicate_role() {
    let err = Schema::builder("Note", "notes")
      .object_id("id")
      .object_id("other_id")
      .payload("data")
      .build();
    assert!(matches!(err, Err(Error::Configuration(_))));
  }

  #[test]
  fn builder_rejects_duplicate_key_field() {
    let err = Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .key("title", "a")
      .key("title", "b")
      .build();
    assert!(matches!(err, Err(Error::Configuration(_))));
  }

  #[test]
  fn slot_lookup_by_field() {
    let schema = Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .created_at("created")
      .key("title", "title_col")
      .build()
      .unwrap();

    assert_eq!(schema.slot_for_field("objectId"), Some("id"));
    assert_eq!(schema.slot_for_field("createdAt"), Some("created"));
    assert_eq!(schema.slot_for_field("updatedAt"), None);
    assert_eq!(schema.slot_for_field("title"), Some("title_col"));
    assert_eq!(schema.slot_for_field("body"), None);
  }

  #[test]
  fn refinement_is_slot_containment() {
    let base = note_schema();
    let extended = Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .key("title", "title_col")
      .build()
      .unwrap();

    assert!(extended.refines(&base));
    assert!(!base.refines(&extended));
    // Every schema refines itself
    assert!(base.refines(&base));

    let unrelated = Schema::builder("Note", "notes")
      .object_id("oid")
      .payload("data")
      .build()
      .unwrap();
    assert!(!unrelated.refines(&base));
    assert!(!base.refines(&unrelated));
  }

  #[test]
  fn generic_schema_shape() {
    let generic = Schema::generic();
    assert!(generic.is_generic());
    assert_eq!(generic.object_id_slot(), "object_id");
    assert_eq!(generic.payload_slot(), "data");
    assert!(generic.key_slots().is_empty());
  }
}
