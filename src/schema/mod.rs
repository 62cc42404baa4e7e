//! Per-class persisted record shapes and their process-wide registry.

mod descriptor;
mod registry;

pub use descriptor::{Schema, SchemaBuilder};
pub use registry::SchemaRegistry;
