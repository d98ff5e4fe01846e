//! SQLite-backed item store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::cache::TagSet;

use super::keys::write_tags;
use super::store::ItemStore;
use super::types::{Item, ListQuery, NewItem};

/// Schema for the items table.
const ITEMS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_items_name ON items(name);
"#;

/// SQLite-based item storage.
pub struct SqliteItemStore {
  conn: Mutex<Connection>,
}

impl SqliteItemStore {
  /// Open or create the database at `path`, or at the default location.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[allow(dead_code)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("items-cache").join("items.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(ITEMS_SCHEMA)
      .map_err(|e| eyre!("Failed to run item migrations: {}", e))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Columns read by `item_from_row`, in order
const ITEM_COLUMNS: &str = "id, name, created_at, updated_at";

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String)> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_item((id, name, created_at, updated_at): (i64, String, String, String)) -> Result<Item> {
  Ok(Item {
    id,
    name,
    created_at: parse_datetime(&created_at)?,
    updated_at: parse_datetime(&updated_at)?,
  })
}

impl SqliteItemStore {
  fn fetch(conn: &Connection, id: i64) -> Result<Option<Item>> {
    let row = conn
      .query_row(
        &format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS),
        params![id],
        item_from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to get item {}: {}", id, e))?;

    row.map(into_item).transpose()
  }
}

impl ItemStore for SqliteItemStore {
  fn list(&self, query: &ListQuery) -> Result<Vec<Item>> {
    let conn = self.conn()?;
    // LIMIT -1 means no limit in SQLite
    let limit = query.limit.map_or(-1, i64::from);

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM items
         WHERE ?1 IS NULL OR instr(lower(name), ?1) > 0
         ORDER BY id
         LIMIT ?2 OFFSET ?3",
        ITEM_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare item query: {}", e))?;

    let rows = stmt
      .query_map(params![query.name, limit, query.offset], item_from_row)
      .map_err(|e| eyre!("Failed to query items: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read item row: {}", e))?;

    rows.into_iter().map(into_item).collect()
  }

  fn get(&self, id: i64) -> Result<Option<Item>> {
    let conn = self.conn()?;
    Self::fetch(&conn, id)
  }

  fn create(&self, item: &NewItem) -> Result<(Item, TagSet)> {
    let conn = self.conn()?;
    let now = format_datetime(Utc::now());

    conn
      .execute(
        "INSERT INTO items (name, created_at, updated_at) VALUES (?, ?, ?)",
        params![item.name, now, now],
      )
      .map_err(|e| eyre!("Failed to create item: {}", e))?;

    let id = conn.last_insert_rowid();
    let created =
      Self::fetch(&conn, id)?.ok_or_else(|| eyre!("Item {} vanished after insert", id))?;
    Ok((created, write_tags(id)))
  }

  fn update(&self, id: i64, item: &NewItem) -> Result<Option<(Item, TagSet)>> {
    let conn = self.conn()?;

    let changed = conn
      .execute(
        "UPDATE items SET name = ?, updated_at = ? WHERE id = ?",
        params![item.name, format_datetime(Utc::now()), id],
      )
      .map_err(|e| eyre!("Failed to update item {}: {}", id, e))?;

    if changed == 0 {
      return Ok(None);
    }

    Ok(Self::fetch(&conn, id)?.map(|updated| (updated, write_tags(id))))
  }

  fn delete(&self, id: i64) -> Result<Option<TagSet>> {
    let changed = self
      .conn()?
      .execute("DELETE FROM items WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete item {}: {}", id, e))?;

    Ok((changed > 0).then(|| write_tags(id)))
  }
}

fn format_datetime(dt: DateTime<Utc>) -> String {
  dt.to_rfc3339()
}

/// Parse a datetime string stored by `format_datetime`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
