//! Visit-once traversal over entity graphs.
//!
//! Walks every entity reachable from a root through pointer fields, lists
//! and maps, visiting each distinct entity at most once no matter how many
//! paths lead to it. Cycles and shared sub-objects are handled by a
//! visited set keyed on instance identity; plain composites are traversed
//! transparently without being yielded themselves. The walk uses an
//! explicit work stack, so graph depth is not bounded by the call stack.

use std::collections::HashSet;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::Result;
use crate::value::Value;

/// Visit-once walk over the reachability closure of a root entity.
pub struct Traverser {
  yield_root: bool,
  traverse_pointers: bool,
}

impl Default for Traverser {
  fn default() -> Self {
    Self::new()
  }
}

impl Traverser {
  pub fn new() -> Self {
    Self {
      yield_root: true,
      traverse_pointers: true,
    }
  }

  /// Whether the root entity itself is passed to the visitor.
  pub fn yield_root(mut self, yield_root: bool) -> Self {
    self.yield_root = yield_root;
    self
  }

  /// Whether to descend into the fields of nested entities. When off, the
  /// walk yields the root's direct entity references and stops there.
  pub fn traverse_pointers(mut self, traverse_pointers: bool) -> Self {
    self.traverse_pointers = traverse_pointers;
    self
  }

  /// Walk the graph reachable from `root`, calling `visit` once per
  /// distinct entity. An error from the visitor aborts the walk.
  pub fn traverse<F>(&self, root: &Arc<Entity>, mut visit: F) -> Result<()>
  where
    F: FnMut(&Arc<Entity>) -> Result<()>,
  {
    self.walk(root, &mut HashSet::new(), &mut visit)
  }

  /// Walk the combined reachability closure of several roots with one
  /// shared visited set, so an entity reachable from two roots is still
  /// visited only once.
  pub fn traverse_all<F>(&self, roots: &[Arc<Entity>], mut visit: F) -> Result<()>
  where
    F: FnMut(&Arc<Entity>) -> Result<()>,
  {
    let mut visited: HashSet<*const Entity> = HashSet::new();
    for root in roots {
      self.walk(root, &mut visited, &mut visit)?;
    }
    Ok(())
  }

  fn walk<F>(
    &self,
    root: &Arc<Entity>,
    visited: &mut HashSet<*const Entity>,
    visit: &mut F,
  ) -> Result<()>
  where
    F: FnMut(&Arc<Entity>) -> Result<()>,
  {
    if !visited.insert(Arc::as_ptr(root)) {
      return Ok(());
    }

    if self.yield_root {
      visit(root)?;
    }

    let mut stack: Vec<Value> = root.fields().into_values().collect();
    while let Some(value) = stack.pop() {
      match value {
        Value::List(items) => stack.extend(items),
        Value::Map(map) => stack.extend(map.into_values()),
        Value::Pointer(entity) => {
          if !visited.insert(Arc::as_ptr(&entity)) {
            continue;
          }
          visit(&entity)?;
          if self.traverse_pointers {
            stack.extend(entity.fields().into_values());
          }
        }
        _ => {}
      }
    }

    Ok(())
  }
}
