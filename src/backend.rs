//! Embedded store backend over SQLite.
//!
//! Persisted records are rows in one table per record type, created on
//! demand from the schema's slot list. Registered classes get their own
//! table; every unregistered class shares the generic `mirror_objects`
//! table, keyed by `(class_name, object_id)`.
//!
//! All access goes through one connection behind a mutex. Writers take the
//! lock for the duration of a transaction; the store serializes them on a
//! single worker so the lock is never contended between two write batches.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};

use crate::error::{Error, Result};
use crate::filter::CompiledFilter;
use crate::schema::Schema;

/// A persisted record: slot name -> stored value.
#[derive(Debug, Clone, Default)]
pub struct Record {
  slots: HashMap<String, SqlValue>,
}

impl Record {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, slot: impl Into<String>, value: SqlValue) {
    self.slots.insert(slot.into(), value);
  }

  pub fn get(&self, slot: &str) -> Option<&SqlValue> {
    self.slots.get(slot)
  }

  /// Text content of a slot; `None` when absent or null.
  pub fn text(&self, slot: &str) -> Option<&str> {
    match self.slots.get(slot) {
      Some(SqlValue::Text(s)) => Some(s),
      _ => None,
    }
  }
}

/// SQLite-backed record store.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
}

impl SqliteBackend {
  /// Open or create the backing database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    Ok(Self::with_connection(conn))
  }

  /// Open or create the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// In-memory database, for tests and scratch mirrors.
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self::with_connection(Connection::open_in_memory()?))
  }

  fn with_connection(conn: Connection) -> Self {
    Self {
      conn: Mutex::new(conn),
    }
  }

  /// Default database path under the platform data directory.
  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| {
        Error::Io(std::io::Error::new(
          std::io::ErrorKind::NotFound,
          "could not determine data directory",
        ))
      })?;
    Ok(data_dir.join("mirrorstore").join("mirror.db"))
  }

  /// Run `f` against the record store inside one transaction. Commits when
  /// `f` succeeds, rolls back when it fails; nothing is partially visible.
  pub fn transaction<T>(&self, f: impl FnOnce(&Records<'_>) -> Result<T>) -> Result<T> {
    let conn = self.locked_conn();
    conn.execute("BEGIN IMMEDIATE TRANSACTION", [])?;
    let records = Records { conn: &conn };
    match f(&records) {
      Ok(value) => {
        conn.execute("COMMIT", [])?;
        Ok(value)
      }
      Err(e) => {
        // Roll back on a best-effort basis; the original error wins.
        let _ = conn.execute("ROLLBACK", []);
        Err(e)
      }
    }
  }

  /// Run `f` against the record store without opening a transaction, for
  /// read paths.
  pub fn read<T>(&self, f: impl FnOnce(&Records<'_>) -> Result<T>) -> Result<T> {
    let conn = self.locked_conn();
    f(&Records { conn: &conn })
  }

  /// Look up a single record by identity.
  pub fn find_by_id(
    &self,
    schema: &Schema,
    class_name: &str,
    object_id: &str,
  ) -> Result<Option<Record>> {
    self.read(|records| records.find_by_id(schema, class_name, object_id))
  }

  fn locked_conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

/// Record operations bound to a live connection, either inside or outside
/// a transaction.
pub struct Records<'a> {
  conn: &'a Connection,
}

impl Records<'_> {
  /// Create the table for a record type if it does not exist yet. Table
  /// creation participates in the enclosing transaction, so it must stay
  /// idempotent rather than cached: a rolled-back batch takes its DDL
  /// with it.
  fn ensure_table(&self, schema: &Schema) -> Result<()> {
    let mut columns: Vec<String> = Vec::new();
    if let Some(slot) = schema.class_name_slot() {
      columns.push(format!("\"{slot}\" TEXT NOT NULL"));
    }
    columns.push(format!("\"{}\" TEXT NOT NULL", schema.object_id_slot()));
    columns.push(format!("\"{}\" TEXT", schema.payload_slot()));
    if let Some(slot) = schema.created_at_slot() {
      columns.push(format!("\"{slot}\" TEXT"));
    }
    if let Some(slot) = schema.updated_at_slot() {
      columns.push(format!("\"{slot}\" TEXT"));
    }
    let mut key_slots: Vec<&str> = schema.key_slots().values().map(String::as_str).collect();
    key_slots.sort_unstable();
    for slot in key_slots {
      // Denormalized keys keep SQLite's dynamic typing
      columns.push(format!("\"{slot}\""));
    }

    let primary_key = match schema.class_name_slot() {
      Some(class_slot) => format!("\"{class_slot}\", \"{}\"", schema.object_id_slot()),
      None => format!("\"{}\"", schema.object_id_slot()),
    };

    let sql = format!(
      "CREATE TABLE IF NOT EXISTS \"{}\" ({}, PRIMARY KEY ({}))",
      schema.record_type(),
      columns.join(", "),
      primary_key,
    );
    self.conn.execute(&sql, [])?;

    if let Some(class_slot) = schema.class_name_slot() {
      let index = format!(
        "CREATE INDEX IF NOT EXISTS \"idx_{}_{class_slot}\" ON \"{}\"(\"{class_slot}\")",
        schema.record_type(),
        schema.record_type(),
      );
      self.conn.execute(&index, [])?;
    }

    Ok(())
  }

  /// Insert or replace the record for its identity.
  pub fn upsert(&self, schema: &Schema, record: &Record) -> Result<()> {
    self.ensure_table(schema)?;

    let slots = schema.all_slots();
    let columns: Vec<String> = slots.iter().map(|s| format!("\"{s}\"")).collect();
    let placeholders: Vec<&str> = slots.iter().map(|_| "?").collect();
    let values: Vec<SqlValue> = slots
      .iter()
      .map(|slot| record.get(slot).cloned().unwrap_or(SqlValue::Null))
      .collect();

    let sql = format!(
      "INSERT OR REPLACE INTO \"{}\" ({}) VALUES ({})",
      schema.record_type(),
      columns.join(", "),
      placeholders.join(", "),
    );
    self.conn.execute(&sql, params_from_iter(values))?;
    Ok(())
  }

  /// Look up a single record by identity.
  pub fn find_by_id(
    &self,
    schema: &Schema,
    class_name: &str,
    object_id: &str,
  ) -> Result<Option<Record>> {
    let filter = CompiledFilter::equals(schema.object_id_slot(), object_id);
    let mut found = self.select(schema, class_name, Some(&filter), Some(1))?;
    Ok(found.pop())
  }

  /// All records of a class matching the compiled predicate.
  pub fn select(
    &self,
    schema: &Schema,
    class_name: &str,
    filter: Option<&CompiledFilter>,
    limit: Option<usize>,
  ) -> Result<Vec<Record>> {
    self.ensure_table(schema)?;

    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();

    // The shared table hosts many classes; scope every query to one.
    if let Some(class_slot) = schema.class_name_slot() {
      clauses.push(format!("\"{class_slot}\" = ?"));
      params.push(SqlValue::Text(class_name.to_string()));
    }
    if let Some(filter) = filter {
      if !filter.clause.is_empty() {
        clauses.push(format!("({})", filter.clause));
        params.extend(filter.params.iter().cloned());
      }
    }

    let mut sql = format!("SELECT * FROM \"{}\"", schema.record_type());
    if !clauses.is_empty() {
      sql.push_str(" WHERE ");
      sql.push_str(&clauses.join(" AND "));
    }
    if let Some(limit) = limit {
      sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = self.conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let rows = stmt.query_map(params_from_iter(params), |row| {
      let mut record = Record::new();
      for (i, name) in column_names.iter().enumerate() {
        record.set(name.clone(), row.get::<_, SqlValue>(i)?);
      }
      Ok(record)
    })?;

    let mut records = Vec::new();
    for row in rows {
      records.push(row?);
    }
    Ok(records)
  }

  /// Delete the record for an identity. Returns whether a record existed.
  pub fn delete(&self, schema: &Schema, class_name: &str, object_id: &str) -> Result<bool> {
    self.ensure_table(schema)?;

    let mut sql = format!(
      "DELETE FROM \"{}\" WHERE \"{}\" = ?",
      schema.record_type(),
      schema.object_id_slot(),
    );
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(object_id.to_string())];
    if let Some(class_slot) = schema.class_name_slot() {
      sql.push_str(&format!(" AND \"{class_slot}\" = ?"));
      params.push(SqlValue::Text(class_name.to_string()));
    }

    let deleted = self.conn.execute(&sql, params_from_iter(params))?;
    Ok(deleted > 0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn note_schema() -> Schema {
    Schema::builder("Note", "notes")
      .object_id("id")
      .payload("data")
      .key("title", "title")
      .build()
      .unwrap()
  }

  fn note_record(id: &str, payload: &str, title: &str) -> Record {
    let mut record = Record::new();
    record.set("id", SqlValue::Text(id.to_string()));
    record.set("data", SqlValue::Text(payload.to_string()));
    record.set("title", SqlValue::Text(title.to_string()));
    record
  }

  #[test]
  fn upsert_and_find_by_id() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let schema = note_schema();

    backend
      .transaction(|records| records.upsert(&schema, &note_record("n1", "{}", "first")))
      .unwrap();

    let found = backend.find_by_id(&schema, "Note", "n1").unwrap().unwrap();
    assert_eq!(found.text("data"), Some("{}"));
    assert_eq!(found.text("title"), Some("first"));

    assert!(backend.find_by_id(&schema, "Note", "missing").unwrap().is_none());
  }

  #[test]
  fn upsert_replaces_by_identity() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let schema = note_schema();

    backend
      .transaction(|records| {
        records.upsert(&schema, &note_record("n1", "{}", "first"))?;
        records.upsert(&schema, &note_record("n1", "{\"a\":1}", "second"))
      })
      .unwrap();

    let all = backend
      .read(|records| records.select(&schema, "Note", None, None))
      .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].text("title"), Some("second"));
  }

  #[test]
  fn failed_transaction_rolls_back() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let schema = note_schema();

    let result: Result<()> = backend.transaction(|records| {
      records.upsert(&schema, &note_record("n1", "{}", "first"))?;
      Err(Error::InvalidState("abort".to_string()))
    });
    assert!(result.is_err());

    let all = backend
      .read(|records| records.select(&schema, "Note", None, None))
      .unwrap();
    assert!(all.is_empty());
  }

  #[test]
  fn generic_table_scopes_by_class() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let schema = Schema::generic();

    backend
      .transaction(|records| {
        let mut note = Record::new();
        note.set("class_name", SqlValue::Text("Note".to_string()));
        note.set("object_id", SqlValue::Text("x1".to_string()));
        note.set("data", SqlValue::Text("{}".to_string()));
        records.upsert(&schema, &note)?;

        let mut task = Record::new();
        task.set("class_name", SqlValue::Text("Task".to_string()));
        task.set("object_id", SqlValue::Text("x1".to_string()));
        task.set("data", SqlValue::Text("{}".to_string()));
        records.upsert(&schema, &task)
      })
      .unwrap();

    let notes = backend
      .read(|records| records.select(&schema, "Note", None, None))
      .unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].text("class_name"), Some("Note"));

    // Same object id under another class is a distinct record
    assert!(backend.find_by_id(&schema, "Task", "x1").unwrap().is_some());
    backend
      .transaction(|records| records.delete(&schema, "Task", "x1").map(|_| ()))
      .unwrap();
    assert!(backend.find_by_id(&schema, "Task", "x1").unwrap().is_none());
    assert!(backend.find_by_id(&schema, "Note", "x1").unwrap().is_some());
  }

  #[test]
  fn delete_reports_absence() {
    let backend = SqliteBackend::open_in_memory().unwrap();
    let schema = note_schema();

    backend
      .transaction(|records| {
        records.upsert(&schema, &note_record("n1", "{}", "t"))?;
        assert!(records.delete(&schema, "Note", "n1")?);
        assert!(!records.delete(&schema, "Note", "n1")?);
        Ok(())
      })
      .unwrap();
  }

  #[test]
  fn open_on_disk_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("mirror.db");
    let backend = SqliteBackend::open(&path).unwrap();

    let schema = note_schema();
    backend
      .transaction(|records| records.upsert(&schema, &note_record("n1", "{}", "t")))
      .unwrap();
    assert!(path.exists());
  }
}
