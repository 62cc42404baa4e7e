//! Queries over one mirrored class.
//!
//! A query pairs a class name with a predicate over its schema's slots and
//! decodes matching records through the identity-preserving codec. The
//! synchronous variants read directly; the async variants run on the
//! store's write worker, so their results observe every write enqueued
//! before them; `watch` re-runs the query whenever a write batch touches
//! the class's record type.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::backend::Record;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::store::{CommitEvent, Store};
use crate::value::Value;

/// A predicate-building query over one class.
#[derive(Clone)]
pub struct Query {
  store: Store,
  class_name: String,
  filter: Filter,
}

impl Query {
  pub(crate) fn new(store: Store, class_name: String) -> Self {
    Self {
      store,
      class_name,
      filter: Filter::new(),
    }
  }

  // Predicate builders, passed through to the compiled filter. Queryable
  // fields are `objectId`, `createdAt`, `updatedAt` and declared keys.

  pub fn equal_to(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter = self.filter.equal_to(field, value);
    self
  }

  pub fn not_equal_to(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter = self.filter.not_equal_to(field, value);
    self
  }

  pub fn greater_than(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter = self.filter.greater_than(field, value);
    self
  }

  pub fn greater_than_or_equal_to(
    mut self,
    field: impl Into<String>,
    value: impl Into<Value>,
  ) -> Self {
    self.filter = self.filter.greater_than_or_equal_to(field, value);
    self
  }

  pub fn less_than(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filter = self.filter.less_than(field, value);
    self
  }

  pub fn less_than_or_equal_to(
    mut self,
    field: impl Into<String>,
    value: impl Into<Value>,
  ) -> Self {
    self.filter = self.filter.less_than_or_equal_to(field, value);
    self
  }

  pub fn between(
    mut self,
    field: impl Into<String>,
    from: impl Into<Value>,
    to: impl Into<Value>,
  ) -> Self {
    self.filter = self.filter.between(field, from, to);
    self
  }

  pub fn contains(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter = self.filter.contains(field, value);
    self
  }

  pub fn begins_with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter = self.filter.begins_with(field, value);
    self
  }

  pub fn ends_with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
    self.filter = self.filter.ends_with(field, value);
    self
  }

  pub fn is_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
    self.filter = self.filter.is_in(field, values);
    self
  }

  pub fn is_null(mut self, field: impl Into<String>) -> Self {
    self.filter = self.filter.is_null(field);
    self
  }

  pub fn is_not_null(mut self, field: impl Into<String>) -> Self {
    self.filter = self.filter.is_not_null(field);
    self
  }

  pub fn begin_group(mut self) -> Self {
    self.filter = self.filter.begin_group();
    self
  }

  pub fn end_group(mut self) -> Self {
    self.filter = self.filter.end_group();
    self
  }

  pub fn or(mut self) -> Self {
    self.filter = self.filter.or();
    self
  }

  pub fn not(mut self) -> Self {
    self.filter = self.filter.not();
    self
  }

  /// First matching entity, if any.
  pub fn find_first(&self) -> Result<Option<Arc<Entity>>> {
    let mut found = self.fetch(Some(1))?;
    Ok(found.pop())
  }

  /// All matching entities.
  pub fn find_all(&self) -> Result<Vec<Arc<Entity>>> {
    self.fetch(None)
  }

  /// First matching entity, evaluated on the store's worker after every
  /// previously enqueued write has committed.
  pub async fn find_first_async(&self) -> Result<Option<Arc<Entity>>> {
    let query = self.clone();
    self.store.run(move || query.find_first()).await
  }

  /// All matching entities, evaluated on the store's worker after every
  /// previously enqueued write has committed.
  pub async fn find_all_async(&self) -> Result<Vec<Arc<Entity>>> {
    let query = self.clone();
    self.store.run(move || query.find_all()).await
  }

  /// Subscribe to this query: each time a write batch touches the class's
  /// record type, the watcher yields the refreshed result set.
  pub fn watch(&self) -> Watcher {
    let schema = self.store.registry().resolve(&self.class_name);
    Watcher {
      query: self.clone(),
      record_type: schema.record_type().to_string(),
      events: self.store.subscribe(),
    }
  }

  fn fetch(&self, limit: Option<usize>) -> Result<Vec<Arc<Entity>>> {
    let schema = self.store.registry().resolve(&self.class_name);
    let compiled = self.filter.compile(&schema, &self.class_name)?;

    // Collect raw records first and decode after the read is done, since
    // decoding may itself read the backend to resolve pointers.
    let records: Vec<Record> = self
      .store
      .backend()
      .read(|records| records.select(&schema, &self.class_name, Some(&compiled), limit))?;

    let codec = self.store.codec();
    let mut entities = Vec::with_capacity(records.len());
    for record in &records {
      match codec.decode(&self.class_name, record) {
        Ok(entity) => entities.push(entity),
        // One undecodable record must not sink the whole result set
        Err(e) => warn!(
          class_name = %self.class_name,
          error = %e,
          "skipping undecodable record"
        ),
      }
    }
    Ok(entities)
  }
}

/// Live view of a query, yielding fresh results after each relevant
/// commit.
pub struct Watcher {
  query: Query,
  record_type: String,
  events: broadcast::Receiver<CommitEvent>,
}

impl Watcher {
  /// Wait for the next commit touching the watched record type and return
  /// the refreshed result set.
  pub async fn next(&mut self) -> Result<Vec<Arc<Entity>>> {
    loop {
      match self.events.recv().await {
        Ok(event) if event.record_type == self.record_type => return self.query.find_all(),
        Ok(_) => continue,
        // Falling behind means commits were missed; re-query regardless
        Err(broadcast::error::RecvError::Lagged(_)) => return self.query.find_all(),
        Err(broadcast::error::RecvError::Closed) => {
          return Err(Error::Queue("store commit feed closed".to_string()))
        }
      }
    }
  }
}
