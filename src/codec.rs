//! Graph codec: entities to persisted records and back.
//!
//! Encoding flattens an entity into a schema-shaped record whose payload
//! slot holds the field map as JSON. Nested entities are never embedded:
//! an entity-valued field serializes to a lightweight pointer token
//! `{"className": ..., "objectId": ...}`, so shared sub-objects and cycles
//! cost one record each no matter how often they are referenced.
//!
//! Decoding goes through the identity cache first: a record whose entity
//! is still live in memory decodes to that same instance, untouched, so
//! in-flight application edits are never clobbered by stale storage.
//! Pointer tokens resolve lazily: a token whose record is not present
//! locally becomes an empty placeholder awaiting hydration.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::types::Value as SqlValue;
use tracing::warn;

use crate::backend::{Record, Records, SqliteBackend};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::schema::{Schema, SchemaRegistry};
use crate::value::{format_timestamp, parse_timestamp, Value};

/// Resolves pointer tokens encountered while rebuilding an entity from a
/// serialized tree. Exposed so deserialization layers outside the store
/// can hydrate relations through the same identity-preserving path.
pub trait PointerDecoder {
  fn decode_pointer(&self, class_name: &str, object_id: &str) -> Result<Arc<Entity>>;
}

/// Encoder/decoder for one store's records.
#[derive(Clone)]
pub struct Codec {
  registry: Arc<SchemaRegistry>,
  identity: Arc<IdentityCache>,
  backend: Arc<SqliteBackend>,
}

impl Codec {
  pub fn new(
    registry: Arc<SchemaRegistry>,
    identity: Arc<IdentityCache>,
    backend: Arc<SqliteBackend>,
  ) -> Self {
    Self {
      registry,
      identity,
      backend,
    }
  }

  /// Encode one entity into its schema-shaped record and upsert it.
  ///
  /// The caller is responsible for the enclosing transaction and for
  /// walking the graph; this encodes exactly the given entity, with
  /// relations reduced to pointer tokens.
  pub fn encode(&self, records: &Records<'_>, entity: &Arc<Entity>) -> Result<()> {
    let class_name = entity.class_name();
    let schema = self.registry.resolve(class_name);
    let object_id = entity.object_id().ok_or_else(|| {
      Error::InvalidState(format!(
        "cannot persist {class_name} entity without an object id"
      ))
    })?;

    // Register the identity before serializing the payload so a relation
    // cycle back to this entity resolves against the cache instead of
    // recursing.
    self.identity.put(entity);

    let fields = entity.fields();
    let tree = self.encode_fields(&fields)?;
    let payload = serde_json::to_string(&tree)?;

    let mut record = Record::new();
    if let Some(slot) = schema.class_name_slot() {
      record.set(slot, SqlValue::Text(class_name.to_string()));
    }
    record.set(schema.object_id_slot(), SqlValue::Text(object_id));
    record.set(schema.payload_slot(), SqlValue::Text(payload));
    if let Some(slot) = schema.created_at_slot() {
      if let Some(at) = entity.created_at() {
        record.set(slot, SqlValue::Text(format_timestamp(at)));
      }
    }
    if let Some(slot) = schema.updated_at_slot() {
      if let Some(at) = entity.updated_at() {
        record.set(slot, SqlValue::Text(format_timestamp(at)));
      }
    }
    for (field, slot) in schema.key_slots() {
      if let Some(value) = fields.get(field) {
        record.set(slot, self.key_param(value)?);
      }
    }

    records.upsert(&schema, &record)
  }

  /// Decode a persisted record into its live entity.
  ///
  /// Idempotent with respect to identity: if the entity is already live,
  /// it is returned unchanged, even if the stored payload differs.
  pub fn decode(&self, class_name: &str, record: &Record) -> Result<Arc<Entity>> {
    let schema = self.registry.resolve(class_name);
    let object_id = record.text(schema.object_id_slot()).ok_or_else(|| {
      Error::InvalidState(format!(
        "persisted {class_name} record has no object id"
      ))
    })?;

    if let Some(live) = self.identity.get(class_name, object_id) {
      return Ok(live);
    }

    let entity = Entity::without_data(class_name, object_id);
    self.identity.put(&entity);
    self.hydrate(&entity, &schema, record)?;
    Ok(entity)
  }

  /// Resolve a pointer token to its entity: cache first, then the local
  /// record store. A token whose record is absent resolves to an empty
  /// placeholder; hydration happens if the record is ever mirrored.
  pub fn resolve_pointer(&self, class_name: &str, object_id: &str) -> Result<Arc<Entity>> {
    if let Some(live) = self.identity.get(class_name, object_id) {
      return Ok(live);
    }

    let entity = Entity::without_data(class_name, object_id);
    self.identity.put(&entity);

    let schema = self.registry.resolve(class_name);
    if let Some(record) = self.backend.find_by_id(&schema, class_name, object_id)? {
      self.hydrate(&entity, &schema, &record)?;
    }
    Ok(entity)
  }

  /// Populate an entity's fields and timestamps from a record.
  ///
  /// A missing payload means "not fetched locally yet" and leaves the
  /// entity unhydrated. A corrupt payload is logged and likewise leaves
  /// the entity as an id-only placeholder, so one bad record cannot sink
  /// a whole query result.
  fn hydrate(&self, entity: &Arc<Entity>, schema: &Schema, record: &Record) -> Result<()> {
    if let Some(payload) = record.text(schema.payload_slot()) {
      match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(serde_json::Value::Object(map)) => {
          let mut fields = HashMap::new();
          for (field, json) in map {
            fields.insert(field, self.decode_value(json)?);
          }
          entity.replace_fields(fields);
        }
        Ok(_) | Err(_) => {
          warn!(
            class_name = entity.class_name(),
            object_id = entity.object_id().as_deref().unwrap_or(""),
            "corrupt payload, leaving entity unhydrated"
          );
        }
      }
    }

    if let Some(slot) = schema.created_at_slot() {
      if let Some(at) = record.text(slot).and_then(parse_timestamp) {
        entity.set_created_at(at);
      }
    }
    if let Some(slot) = schema.updated_at_slot() {
      if let Some(at) = record.text(slot).and_then(parse_timestamp) {
        entity.set_updated_at(at);
      }
    }
    Ok(())
  }

  fn encode_fields(&self, fields: &HashMap<String, Value>) -> Result<serde_json::Value> {
    let mut map = serde_json::Map::with_capacity(fields.len());
    for (field, value) in fields {
      map.insert(field.clone(), self.encode_value(value)?);
    }
    Ok(serde_json::Value::Object(map))
  }

  fn encode_value(&self, value: &Value) -> Result<serde_json::Value> {
    Ok(match value {
      Value::Null => serde_json::Value::Null,
      Value::Bool(b) => serde_json::Value::Bool(*b),
      Value::Integer(n) => serde_json::Value::from(*n),
      Value::Float(n) => serde_json::Number::from_f64(*n)
        .map(serde_json::Value::Number)
        .ok_or_else(|| {
          Error::InvalidState("non-finite float cannot be serialized".to_string())
        })?,
      Value::String(s) => serde_json::Value::String(s.clone()),
      Value::Pointer(target) => {
        let object_id = target.object_id().ok_or_else(|| {
          Error::InvalidState(format!(
            "cannot create a pointer to an unsaved {} entity",
            target.class_name()
          ))
        })?;
        let mut token = serde_json::Map::with_capacity(2);
        token.insert(
          "className".to_string(),
          serde_json::Value::String(target.class_name().to_string()),
        );
        token.insert("objectId".to_string(), serde_json::Value::String(object_id));
        serde_json::Value::Object(token)
      }
      Value::List(items) => serde_json::Value::Array(
        items
          .iter()
          .map(|item| self.encode_value(item))
          .collect::<Result<_>>()?,
      ),
      Value::Map(map) => {
        let mut out = serde_json::Map::with_capacity(map.len());
        for (k, v) in map {
          out.insert(k.clone(), self.encode_value(v)?);
        }
        serde_json::Value::Object(out)
      }
    })
  }

  fn decode_value(&self, json: serde_json::Value) -> Result<Value> {
    Ok(match json {
      serde_json::Value::Null => Value::Null,
      serde_json::Value::Bool(b) => Value::Bool(b),
      serde_json::Value::Number(n) => {
        if let Some(i) = n.as_i64() {
          Value::Integer(i)
        } else {
          Value::Float(n.as_f64().unwrap_or_default())
        }
      }
      serde_json::Value::String(s) => Value::String(s),
      serde_json::Value::Array(items) => Value::List(
        items
          .into_iter()
          .map(|item| self.decode_value(item))
          .collect::<Result<_>>()?,
      ),
      serde_json::Value::Object(map) => {
        if let Some((class_name, object_id)) = pointer_token(&map) {
          Value::Pointer(self.resolve_pointer(&class_name, &object_id)?)
        } else {
          let mut out = HashMap::with_capacity(map.len());
          for (k, v) in map {
            out.insert(k, self.decode_value(v)?);
          }
          Value::Map(out)
        }
      }
    })
  }

  /// Stored representation of a denormalized key value. Scalars map to
  /// native column types; anything else falls back to its JSON text.
  fn key_param(&self, value: &Value) -> Result<SqlValue> {
    Ok(match value {
      Value::Null => SqlValue::Null,
      Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
      Value::Integer(n) => SqlValue::Integer(*n),
      Value::Float(n) => SqlValue::Real(*n),
      Value::String(s) => SqlValue::Text(s.clone()),
      other => SqlValue::Text(serde_json::to_string(&self.encode_value(other)?)?),
    })
  }
}

impl PointerDecoder for Codec {
  fn decode_pointer(&self, class_name: &str, object_id: &str) -> Result<Arc<Entity>> {
    self.resolve_pointer(class_name, object_id)
  }
}

/// A JSON object is a pointer token iff it has exactly the two token keys,
/// both strings.
fn pointer_token(map: &serde_json::Map<String, serde_json::Value>) -> Option<(String, String)> {
  if map.len() != 2 {
    return None;
  }
  let class_name = map.get("className")?.as_str()?;
  let object_id = map.get("objectId")?.as_str()?;
  Some((class_name.to_string(), object_id.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{TimeZone, Utc};

  fn test_codec() -> Codec {
    Codec::new(
      SchemaRegistry::new(),
      IdentityCache::new(),
      Arc::new(SqliteBackend::open_in_memory().unwrap()),
    )
  }

  fn encode_all(codec: &Codec, entities: &[&Arc<Entity>]) {
    codec
      .backend
      .transaction(|records| {
        for entity in entities {
          codec.encode(records, entity)?;
        }
        Ok(())
      })
      .unwrap();
  }

  fn stored_record(codec: &Codec, class_name: &str, object_id: &str) -> Record {
    let schema = codec.registry.resolve(class_name);
    codec
      .backend
      .find_by_id(&schema, class_name, object_id)
      .unwrap()
      .unwrap()
  }

  #[test]
  fn encode_writes_pointer_tokens() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    let n2 = Entity::without_data("Note", "n2");
    n1.set("text", "hi");
    n1.set("ref", &n2);

    encode_all(&codec, &[&n1, &n2]);

    let record = stored_record(&codec, "Note", "n1");
    let payload: serde_json::Value = serde_json::from_str(record.text("data").unwrap()).unwrap();
    assert_eq!(payload["text"], "hi");
    assert_eq!(payload["ref"]["className"], "Note");
    assert_eq!(payload["ref"]["objectId"], "n2");
  }

  #[test]
  fn decode_of_same_identity_returns_same_instance() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    n1.set("text", "hi");
    encode_all(&codec, &[&n1]);

    let record = stored_record(&codec, "Note", "n1");
    let first = codec.decode("Note", &record).unwrap();
    let second = codec.decode("Note", &record).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    // And both are the original live instance
    assert!(Arc::ptr_eq(&first, &n1));
  }

  #[test]
  fn decode_prefers_live_instance_over_storage() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    n1.set("text", "stored");
    encode_all(&codec, &[&n1]);

    // Application keeps editing in memory after the save
    n1.set("text", "edited");

    let record = stored_record(&codec, "Note", "n1");
    let decoded = codec.decode("Note", &record).unwrap();
    assert_eq!(decoded.get("text"), Some(Value::from("edited")));
  }

  #[test]
  fn decode_rehydrates_after_instance_dropped() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    n1.set("text", "hi");
    n1.set("rank", 7);
    encode_all(&codec, &[&n1]);
    drop(n1);

    let record = stored_record(&codec, "Note", "n1");
    let revived = codec.decode("Note", &record).unwrap();
    assert_eq!(revived.get("text"), Some(Value::from("hi")));
    assert_eq!(revived.get("rank"), Some(Value::from(7)));
  }

  #[test]
  fn cycle_round_trip_terminates_and_links_back() {
    let codec = test_codec();
    let a = Entity::without_data("Note", "a");
    let b = Entity::without_data("Note", "b");
    a.set("next", &b);
    b.set("back", &a);
    encode_all(&codec, &[&a, &b]);
    drop(a);
    drop(b);

    let record = stored_record(&codec, "Note", "a");
    let a2 = codec.decode("Note", &record).unwrap();
    let b2 = a2.get("next").unwrap().as_entity().unwrap().clone();
    let back = b2.get("back").unwrap().as_entity().unwrap().clone();
    assert!(Arc::ptr_eq(&a2, &back));
  }

  #[test]
  fn unresolvable_pointer_becomes_placeholder() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    let ghost = Entity::without_data("Note", "ghost");
    n1.set("ref", &ghost);
    // Only n1 is persisted; "ghost" has no record
    encode_all(&codec, &[&n1]);
    drop(n1);
    drop(ghost);

    let record = stored_record(&codec, "Note", "n1");
    let decoded = codec.decode("Note", &record).unwrap();
    let resolved = decoded.get("ref").unwrap().as_entity().unwrap().clone();
    assert_eq!(resolved.object_id().as_deref(), Some("ghost"));
    assert!(!resolved.is_hydrated());
  }

  #[test]
  fn empty_payload_leaves_entity_unhydrated() {
    let codec = test_codec();
    let mut record = Record::new();
    record.set("class_name", SqlValue::Text("Note".to_string()));
    record.set("object_id", SqlValue::Text("n1".to_string()));

    let decoded = codec.decode("Note", &record).unwrap();
    assert!(!decoded.is_hydrated());
  }

  #[test]
  fn corrupt_payload_recovers_to_placeholder() {
    let codec = test_codec();
    let mut record = Record::new();
    record.set("class_name", SqlValue::Text("Note".to_string()));
    record.set("object_id", SqlValue::Text("n1".to_string()));
    record.set("data", SqlValue::Text("{not json".to_string()));

    let decoded = codec.decode("Note", &record).unwrap();
    assert_eq!(decoded.object_id().as_deref(), Some("n1"));
    assert!(!decoded.is_hydrated());
  }

  #[test]
  fn decode_without_object_id_is_invalid() {
    let codec = test_codec();
    let record = Record::new();
    assert!(matches!(
      codec.decode("Note", &record),
      Err(Error::InvalidState(_))
    ));
  }

  #[test]
  fn encode_unsaved_entity_is_invalid() {
    let codec = test_codec();
    let entity = Entity::new("Note");
    let result = codec
      .backend
      .transaction(|records| codec.encode(records, &entity));
    assert!(matches!(result, Err(Error::InvalidState(_))));
  }

  #[test]
  fn pointer_to_unsaved_entity_is_invalid() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    n1.set("ref", &Entity::new("Note"));
    let result = codec
      .backend
      .transaction(|records| codec.encode(records, &n1));
    assert!(matches!(result, Err(Error::InvalidState(_))));
  }

  #[test]
  fn timestamps_round_trip_through_slots() {
    let codec = test_codec();
    let created = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).unwrap();
    let updated = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

    let n1 = Entity::without_data("Note", "n1");
    n1.set_created_at(created);
    n1.set_updated_at(updated);
    encode_all(&codec, &[&n1]);
    drop(n1);

    let record = stored_record(&codec, "Note", "n1");
    let revived = codec.decode("Note", &record).unwrap();
    assert_eq!(revived.created_at(), Some(created));
    assert_eq!(revived.updated_at(), Some(updated));
  }

  #[test]
  fn registered_schema_denormalizes_keys() {
    let codec = test_codec();
    codec
      .registry
      .register(
        Schema::builder("Note", "notes")
          .object_id("id")
          .payload("data")
          .key("title", "title")
          .build()
          .unwrap(),
      )
      .unwrap();

    let n1 = Entity::without_data("Note", "n1");
    n1.set("title", "hello");
    n1.set("body", "world");
    encode_all(&codec, &[&n1]);

    let record = stored_record(&codec, "Note", "n1");
    assert_eq!(record.text("title"), Some("hello"));
    // Non-key fields stay inside the payload
    let payload: serde_json::Value = serde_json::from_str(record.text("data").unwrap()).unwrap();
    assert_eq!(payload["body"], "world");
  }

  #[test]
  fn nested_map_with_extra_keys_is_not_a_pointer() {
    let codec = test_codec();
    let n1 = Entity::without_data("Note", "n1");
    let mut inner = HashMap::new();
    inner.insert("className".to_string(), Value::from("Note"));
    inner.insert("objectId".to_string(), Value::from("n2"));
    inner.insert("extra".to_string(), Value::from(1));
    n1.set("meta", inner);
    encode_all(&codec, &[&n1]);
    drop(n1);

    let record = stored_record(&codec, "Note", "n1");
    let decoded = codec.decode("Note", &record).unwrap();
    assert!(decoded.get("meta").unwrap().as_map().is_some());
  }
}
