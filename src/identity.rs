//! Weak identity cache: one live in-memory instance per entity identity.
//!
//! The cache maps `(class_name, object_id)` to a weak handle on the entity,
//! guaranteeing that repeated decodes of the same logical record hand back
//! the same `Arc` as long as the application still holds one. The cache
//! never owns an entity: entries lapse when the last application reference
//! is dropped and are pruned when next touched.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use crate::entity::Entity;

type Key = (String, String);

/// Weak map from entity identity to its single live instance.
#[derive(Default)]
pub struct IdentityCache {
  entries: Mutex<HashMap<Key, Weak<Entity>>>,
}

static GLOBAL: OnceLock<Arc<IdentityCache>> = OnceLock::new();

impl IdentityCache {
  /// A private cache, detached from the process-wide one.
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// The process-wide cache shared by every store instance.
  pub fn global() -> Arc<Self> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::default())))
  }

  /// Install or overwrite the entry for the entity's identity. Entities
  /// with no object id are not cacheable; this is a no-op for them.
  pub fn put(&self, entity: &Arc<Entity>) {
    let Some(object_id) = entity.object_id() else {
      return;
    };
    self.locked().insert(
      (entity.class_name().to_string(), object_id),
      Arc::downgrade(entity),
    );
  }

  /// The live entity for an identity, if the application still holds it.
  pub fn get(&self, class_name: &str, object_id: &str) -> Option<Arc<Entity>> {
    let key = (class_name.to_string(), object_id.to_string());
    let mut entries = self.locked();
    match entries.get(&key) {
      Some(weak) => match weak.upgrade() {
        Some(entity) => Some(entity),
        None => {
          // Entity was dropped, the stale entry can go.
          entries.remove(&key);
          None
        }
      },
      None => None,
    }
  }

  /// Clear the entry for an identity, if present.
  pub fn remove(&self, class_name: &str, object_id: &str) {
    self
      .locked()
      .remove(&(class_name.to_string(), object_id.to_string()));
  }

  /// Number of entries whose entity is still alive.
  pub fn live_count(&self) -> usize {
    self
      .locked()
      .values()
      .filter(|weak| weak.strong_count() > 0)
      .count()
  }

  fn locked(&self) -> MutexGuard<'_, HashMap<Key, Weak<Entity>>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn put_and_get_same_instance() {
    let cache = IdentityCache::new();
    let entity = Entity::without_data("Note", "n1");
    cache.put(&entity);

    let hit = cache.get("Note", "n1").unwrap();
    assert!(Arc::ptr_eq(&hit, &entity));
  }

  #[test]
  fn put_without_id_is_noop() {
    let cache = IdentityCache::new();
    let entity = Entity::new("Note");
    cache.put(&entity);
    assert_eq!(cache.live_count(), 0);
  }

  #[test]
  fn entry_lapses_when_entity_dropped() {
    let cache = IdentityCache::new();
    let entity = Entity::without_data("Note", "n1");
    cache.put(&entity);
    drop(entity);

    assert!(cache.get("Note", "n1").is_none());
    // The dead entry was pruned on access
    assert_eq!(cache.live_count(), 0);
  }

  #[test]
  fn remove_clears_entry() {
    let cache = IdentityCache::new();
    let entity = Entity::without_data("Note", "n1");
    cache.put(&entity);
    cache.remove("Note", "n1");
    assert!(cache.get("Note", "n1").is_none());
  }

  #[test]
  fn identities_are_per_class() {
    let cache = IdentityCache::new();
    let note = Entity::without_data("Note", "x1");
    let task = Entity::without_data("Task", "x1");
    cache.put(&note);
    cache.put(&task);

    assert!(Arc::ptr_eq(&cache.get("Note", "x1").unwrap(), &note));
    assert!(Arc::ptr_eq(&cache.get("Task", "x1").unwrap(), &task));
  }
}
