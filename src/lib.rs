//! # mirrorstore - offline mirror of remote object graphs
//!
//! A local persistence cache for schema-less, id-identified remote objects
//! ("class name + object id" records with dynamic fields), mirrored into
//! an embedded SQLite store for offline reads and queued writes.
//!
//! mirrorstore provides:
//! - A graph codec that flattens possibly-cyclic entity graphs into flat
//!   records, storing relations as pointer tokens instead of embedded
//!   copies
//! - A weak identity cache guaranteeing one live in-memory instance per
//!   entity identity across repeated decodes and concurrent callers
//! - A schema registry resolving, per class, which record shape to persist
//!   into, with a generic fallback for unregistered classes
//! - A store serializing all write transactions of one database through an
//!   ordered task queue, with sync, async and live query variants
//!
//! # Example
//!
//! ```no_run
//! use mirrorstore::{Entity, Schema, Store};
//!
//! # async fn demo() -> mirrorstore::Result<()> {
//! let store = Store::open_in_memory()?;
//! store.register_schema(
//!   Schema::builder("Note", "notes")
//!     .object_id("id")
//!     .payload("data")
//!     .key("title", "title")
//!     .build()?,
//! )?;
//!
//! let note = Entity::without_data("Note", "n1");
//! note.set("title", "hello");
//! store.save_one(&note).await?;
//!
//! let found = store.query("Note").equal_to("title", "hello").find_first()?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod entity;
pub mod error;
pub mod filter;
pub mod identity;
pub mod query;
pub mod schema;
pub mod store;
pub mod traverse;
pub mod value;

// Re-exports for convenient access
pub use codec::{Codec, PointerDecoder};
pub use entity::Entity;
pub use error::{Error, Result};
pub use filter::Filter;
pub use identity::IdentityCache;
pub use query::{Query, Watcher};
pub use schema::{Schema, SchemaRegistry};
pub use store::{CommitEvent, Store};
pub use traverse::Traverser;
pub use value::Value;
