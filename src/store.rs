//! Store: transactional batches over entity graphs, serialized per instance.
//!
//! Every mutating call is wrapped in a unit of work and appended to a
//! single-consumer queue owned by the store instance, so at most one write
//! transaction is in flight at a time and batches commit in enqueue order.
//! Callers await the outcome over a oneshot channel; the calling task is
//! free to do other work meanwhile. Queued units run to completion: there
//! is no cancellation, failures surface as the awaited outcome.
//!
//! The schema registry and identity cache default to the process-wide
//! instances, shared across all stores; the record backend belongs to one
//! store alone.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::backend::SqliteBackend;
use crate::codec::Codec;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::identity::IdentityCache;
use crate::query::Query;
use crate::schema::{Schema, SchemaRegistry};
use crate::traverse::Traverser;

/// Emitted after a write batch commits, once per touched record type.
#[derive(Debug, Clone)]
pub struct CommitEvent {
  pub record_type: String,
}

type Job = Box<dyn FnOnce() + Send>;

struct StoreInner {
  backend: Arc<SqliteBackend>,
  registry: Arc<SchemaRegistry>,
  identity: Arc<IdentityCache>,
  jobs: mpsc::UnboundedSender<Job>,
  commits: broadcast::Sender<CommitEvent>,
}

/// Handle to one mirrored database. Cheap to clone; all clones share the
/// same backend, write queue and commit feed.
#[derive(Clone)]
pub struct Store {
  inner: Arc<StoreInner>,
}

impl Store {
  /// Open a store at the given path, using the process-wide schema
  /// registry and identity cache. Must be called within a Tokio runtime;
  /// the store's write worker lives on it.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self::with_parts(
      SqliteBackend::open(path)?,
      SchemaRegistry::global(),
      IdentityCache::global(),
    ))
  }

  /// Open a store at the default platform data location.
  pub fn open_default() -> Result<Self> {
    Ok(Self::with_parts(
      SqliteBackend::open_default()?,
      SchemaRegistry::global(),
      IdentityCache::global(),
    ))
  }

  /// Open an in-memory store, using the process-wide schema registry and
  /// identity cache.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::with_parts(
      SqliteBackend::open_in_memory()?,
      SchemaRegistry::global(),
      IdentityCache::global(),
    ))
  }

  /// Assemble a store from explicit parts. A private registry and cache
  /// isolate the store completely, which is what tests want.
  pub fn with_parts(
    backend: SqliteBackend,
    registry: Arc<SchemaRegistry>,
    identity: Arc<IdentityCache>,
  ) -> Self {
    let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
    tokio::spawn(async move {
      while let Some(job) = queue.recv().await {
        job();
      }
      debug!("store write worker stopped");
    });

    let (commits, _) = broadcast::channel(64);

    Self {
      inner: Arc::new(StoreInner {
        backend: Arc::new(backend),
        registry,
        identity,
        jobs,
        commits,
      }),
    }
  }

  /// Register a schema with the shared registry. Fails fast on bad or
  /// ambiguous registrations; see `SchemaRegistry::register`.
  pub fn register_schema(&self, schema: Schema) -> Result<()> {
    self.inner.registry.register(schema)
  }

  /// Drop the schema registration for a class name.
  pub fn unregister_schema(&self, class_name: &str) {
    self.inner.registry.unregister(class_name);
  }

  /// Persist the full reachability closure of the given roots in one
  /// transaction: every reachable entity is encoded exactly once, with
  /// relations stored as pointer tokens. Either the whole batch commits
  /// or none of it does.
  pub async fn save(&self, roots: Vec<Arc<Entity>>) -> Result<()> {
    let codec = self.codec();
    let registry = Arc::clone(&self.inner.registry);
    let backend = Arc::clone(&self.inner.backend);
    let commits = self.inner.commits.clone();

    self
      .run(move || {
        let touched = backend.transaction(|records| {
          let mut touched: HashSet<String> = HashSet::new();
          Traverser::new().traverse_all(&roots, |entity| {
            codec.encode(records, entity)?;
            touched.insert(registry.resolve(entity.class_name()).record_type().to_string());
            Ok(())
          })?;
          Ok(touched)
        })?;
        debug!(batch = touched.len(), "save batch committed");
        notify(&commits, touched);
        Ok(())
      })
      .await
  }

  /// Persist a single entity and everything reachable from it.
  pub async fn save_one(&self, entity: &Arc<Entity>) -> Result<()> {
    self.save(vec![Arc::clone(entity)]).await
  }

  /// Delete the persisted records of the given roots and of every
  /// reachable entity, in one transaction. Entities stay alive in memory;
  /// only their records go.
  pub async fn remove(&self, roots: Vec<Arc<Entity>>) -> Result<()> {
    self.remove_where(roots, |_| true).await
  }

  /// Delete a single entity's record and, cascading, every record
  /// reachable from it.
  pub async fn remove_one(&self, entity: &Arc<Entity>) -> Result<()> {
    self.remove(vec![Arc::clone(entity)]).await
  }

  /// Delete the records of the roots plus every reachable entity accepted
  /// by `cascade`. Reachable entities the predicate rejects keep their
  /// records; the roots themselves are always deleted.
  pub async fn remove_where(
    &self,
    roots: Vec<Arc<Entity>>,
    cascade: impl Fn(&Arc<Entity>) -> bool + Send + 'static,
  ) -> Result<()> {
    let registry = Arc::clone(&self.inner.registry);
    let backend = Arc::clone(&self.inner.backend);
    let commits = self.inner.commits.clone();

    self
      .run(move || {
        let touched = backend.transaction(|records| {
          let root_ptrs: HashSet<*const Entity> = roots.iter().map(Arc::as_ptr).collect();
          let mut touched: HashSet<String> = HashSet::new();
          Traverser::new().traverse_all(&roots, |entity| {
            if !root_ptrs.contains(&Arc::as_ptr(entity)) && !cascade(entity) {
              return Ok(());
            }
            // Entities that were never saved have no record to delete
            let Some(object_id) = entity.object_id() else {
              return Ok(());
            };
            let schema = registry.resolve(entity.class_name());
            if records.delete(&schema, entity.class_name(), &object_id)? {
              touched.insert(schema.record_type().to_string());
            }
            Ok(())
          })?;
          Ok(touched)
        })?;
        debug!(batch = touched.len(), "remove batch committed");
        notify(&commits, touched);
        Ok(())
      })
      .await
  }

  /// Start building a query over one class.
  pub fn query(&self, class_name: impl Into<String>) -> Query {
    Query::new(self.clone(), class_name.into())
  }

  /// Resolve an identity to its live or locally mirrored entity; an
  /// identity with no local record resolves to an empty placeholder.
  pub fn resolve(&self, class_name: &str, object_id: &str) -> Result<Arc<Entity>> {
    self.codec().resolve_pointer(class_name, object_id)
  }

  /// The pointer-resolving codec for this store, usable by external
  /// deserialization layers.
  pub fn codec(&self) -> Codec {
    Codec::new(
      Arc::clone(&self.inner.registry),
      Arc::clone(&self.inner.identity),
      Arc::clone(&self.inner.backend),
    )
  }

  /// Run a unit of work on this store's write worker, after everything
  /// already enqueued. The outcome resolves once the unit has run.
  pub(crate) async fn run<T: Send + 'static>(
    &self,
    unit: impl FnOnce() -> Result<T> + Send + 'static,
  ) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    let job: Job = Box::new(move || {
      let _ = tx.send(unit());
    });
    self
      .inner
      .jobs
      .send(job)
      .map_err(|_| Error::Queue("write queue is closed".to_string()))?;
    rx.await
      .map_err(|_| Error::Queue("write worker dropped the unit".to_string()))?
  }

  pub(crate) fn subscribe(&self) -> broadcast::Receiver<CommitEvent> {
    self.inner.commits.subscribe()
  }

  pub(crate) fn backend(&self) -> &SqliteBackend {
    &self.inner.backend
  }

  pub(crate) fn registry(&self) -> &SchemaRegistry {
    &self.inner.registry
  }
}

fn notify(commits: &broadcast::Sender<CommitEvent>, touched: HashSet<String>) {
  for record_type in touched {
    // No receivers is fine
    let _ = commits.send(CommitEvent { record_type });
  }
}
