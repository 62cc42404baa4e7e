//! Process-wide schema registry.
//!
//! One mutex guards the whole class-name -> schema table; every encode and
//! decode resolves through it, so registration changes are visible to all
//! store instances immediately.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::error::{Error, Result};

use super::descriptor::Schema;

/// Registry of persisted record shapes, keyed by logical class name.
#[derive(Default)]
pub struct SchemaRegistry {
  registered: Mutex<HashMap<String, Arc<Schema>>>,
}

static GLOBAL: OnceLock<Arc<SchemaRegistry>> = OnceLock::new();

static GENERIC: OnceLock<Arc<Schema>> = OnceLock::new();

impl SchemaRegistry {
  /// A private registry, detached from the process-wide one.
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// The process-wide registry shared by every store instance.
  pub fn global() -> Arc<Self> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::default())))
  }

  /// Register a schema for its class name.
  ///
  /// At most one schema may be live per class name. Re-registering is
  /// resolved by specificity: a schema that refines the registered one
  /// replaces it, a schema the registered one already refines is a no-op,
  /// and anything else is an ambiguity error.
  pub fn register(&self, schema: Schema) -> Result<()> {
    let mut registered = self.locked();

    if let Some(existing) = registered.get(schema.class_name()) {
      if existing.refines(&schema) {
        // Existing registration is more specific or equal, keep it.
        return Ok(());
      }
      if !schema.refines(existing) {
        return Err(Error::Configuration(format!(
          "tried to register conflicting schemas (record types {} and {}) for class {}; \
           neither refines the other",
          existing.record_type(),
          schema.record_type(),
          schema.class_name(),
        )));
      }
      // New registration refines the existing one, fall through and replace.
    }

    registered.insert(schema.class_name().to_string(), Arc::new(schema));
    Ok(())
  }

  /// Drop the registration for a class name, if any.
  pub fn unregister(&self, class_name: &str) {
    self.locked().remove(class_name);
  }

  /// The schema for a class name, falling back to the generic record shape
  /// when none is registered. Never fails.
  pub fn resolve(&self, class_name: &str) -> Arc<Schema> {
    match self.locked().get(class_name) {
      Some(schema) => Arc::clone(schema),
      None => Self::generic(),
    }
  }

  /// The shared fallback schema.
  pub fn generic() -> Arc<Schema> {
    Arc::clone(GENERIC.get_or_init(|| Arc::new(Schema::generic())))
  }

  fn locked(&self) -> MutexGuard<'_, HashMap<String, Arc<Schema>>> {
    self.registered.lock().unwrap_or_else(PoisonError::into_inner)
  }
}
