//! Record store trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::traits::{collections, CacheRecord};

/// Current store schema generation.
///
/// Bumping this drops and recreates the cache record table on next open.
pub const SCHEMA_VERSION: u32 = 3;

/// Secondary indexes available for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordIndex {
  /// Records tagged with an owner id
  Owner,
}

/// A raw row of the pending mutation table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
  /// Assigned by the store on insert, strictly increasing
  pub id: i64,
  pub kind: String,
  pub owner_id: String,
  pub payload: Value,
  pub timestamp: i64,
}

/// Trait for record store backends.
///
/// Every operation is one transaction: it either fully applies or returns an error.
pub trait RecordStore: Send + Sync {
  /// Open (creating and migrating if needed) the underlying database.
  ///
  /// Safe to call repeatedly and concurrently; only the first call opens.
  fn init(&self) -> Result<()>;

  /// Insert or overwrite a record.
  fn put(&self, collection: &str, record: &CacheRecord<Value>) -> Result<()>;

  /// Get a record by primary key.
  fn get(&self, collection: &str, key: &str) -> Result<Option<CacheRecord<Value>>>;

  /// Get all records in a collection whose index field equals `value`.
  fn get_all_by_index(
    &self,
    collection: &str,
    index: RecordIndex,
    value: &str,
  ) -> Result<Vec<CacheRecord<Value>>>;

  fn delete(&self, collection: &str, key: &str) -> Result<()>;

  fn clear(&self, collection: &str) -> Result<()>;

  /// Append to the pending mutation table, returning the assigned id.
  fn queue_push(&self, kind: &str, owner_id: &str, payload: &Value, timestamp: i64)
    -> Result<i64>;

  /// All pending mutations ordered by id.
  fn queue_entries(&self) -> Result<Vec<QueueEntry>>;

  fn queue_remove(&self, id: i64) -> Result<()>;

  fn queue_len(&self) -> Result<usize>;
}

enum Location {
  File(PathBuf),
  Memory,
}

/// SQLite-based record store.
///
/// The connection is opened lazily by [`RecordStore::init`]; every other
/// operation initialises on demand.
pub struct SqliteStore {
  location: Location,
  conn: Mutex<Option<Connection>>,
  opens: AtomicUsize,
}

impl SqliteStore {
  /// A store at the default location.
  pub fn open_default() -> Result<Self> {
    Ok(Self::at(Self::default_path()?))
  }

  /// A store backed by the database file at `path`.
  pub fn at(path: impl Into<PathBuf>) -> Self {
    Self {
      location: Location::File(path.into()),
      conn: Mutex::new(None),
      opens: AtomicUsize::new(0),
    }
  }

  /// A store that lives only as long as this value.
  pub fn in_memory() -> Self {
    Self {
      location: Location::Memory,
      conn: Mutex::new(None),
      opens: AtomicUsize::new(0),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stickersync").join("cache.db"))
  }

  /// How many times a connection has actually been opened.
  pub fn open_count(&self) -> usize {
    self.opens.load(Ordering::SeqCst)
  }

  fn connect(&self) -> Result<Connection> {
    let conn = match &self.location {
      Location::File(path) => {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
          std::fs::create_dir_all(parent)
            .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
        }
        open_file(path)?
      }
      Location::Memory => Connection::open_in_memory()
        .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?,
    };
    self.opens.fetch_add(1, Ordering::SeqCst);

    run_migrations(&conn)?;
    Ok(conn)
  }

  /// Lock the connection slot, opening the database if this is the first use.
  fn lock(&self) -> Result<MutexGuard<'_, Option<Connection>>> {
    let mut guard = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if guard.is_none() {
      *guard = Some(self.connect()?);
    }
    Ok(guard)
  }

  fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> Result<R>) -> Result<R> {
    let guard = self.lock()?;
    let conn = guard
      .as_ref()
      .ok_or_else(|| eyre!("Cache database is not open"))?;
    f(conn)
  }
}

fn open_file(path: &Path) -> Result<Connection> {
  Connection::open(path)
    .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))
}

/// Schema for the store tables.
const STORE_SCHEMA: &str = r#"
-- Cached records, one row per (collection, key)
CREATE TABLE IF NOT EXISTS cache_records (
    collection TEXT NOT NULL,
    record_key TEXT NOT NULL,
    owner_id TEXT,
    data BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    schema_version INTEGER NOT NULL,
    PRIMARY KEY (collection, record_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_records_owner
    ON cache_records(collection, owner_id);

-- Writes waiting to be replayed against the remote endpoint
CREATE TABLE IF NOT EXISTS pending_mutations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    payload BLOB NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_owner
    ON pending_mutations(owner_id);
"#;

/// Bring the schema up to [`SCHEMA_VERSION`].
///
/// A generation change drops the cache record table; cached data can always be
/// fetched again. The pending mutation table is kept as-is.
fn run_migrations(conn: &Connection) -> Result<()> {
  let version: u32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  if version != SCHEMA_VERSION {
    if version != 0 {
      info!(from = version, to = SCHEMA_VERSION, "recreating cache tables");
    }
    conn
      .execute_batch("DROP TABLE IF EXISTS cache_records;")
      .map_err(|e| eyre!("Failed to drop cache tables: {}", e))?;
  }

  conn
    .execute_batch(STORE_SCHEMA)
    .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

  conn
    .pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

  Ok(())
}

fn check_collection(collection: &str) -> Result<()> {
  if collections::ALL.contains(&collection) {
    Ok(())
  } else {
    Err(eyre!("Unknown collection: {}", collection))
  }
}

fn decode_record(
  key: String,
  owner_id: Option<String>,
  data: &[u8],
  timestamp: i64,
  schema_version: u32,
) -> Result<CacheRecord<Value>> {
  let data: Value =
    serde_json::from_slice(data).map_err(|e| eyre!("Failed to deserialize record: {}", e))?;
  Ok(CacheRecord {
    key,
    data,
    timestamp,
    schema_version,
    owner_id,
  })
}

impl RecordStore for SqliteStore {
  fn init(&self) -> Result<()> {
    self.lock().map(|_| ())
  }

  fn put(&self, collection: &str, record: &CacheRecord<Value>) -> Result<()> {
    check_collection(collection)?;
    let data =
      serde_json::to_vec(&record.data).map_err(|e| eyre!("Failed to serialize record: {}", e))?;

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT OR REPLACE INTO cache_records
             (collection, record_key, owner_id, data, timestamp, schema_version)
           VALUES (?, ?, ?, ?, ?, ?)",
          params![
            collection,
            record.key,
            record.owner_id,
            data,
            record.timestamp,
            record.schema_version
          ],
        )
        .map_err(|e| eyre!("Failed to store record {}/{}: {}", collection, record.key, e))?;
      Ok(())
    })
  }

  fn get(&self, collection: &str, key: &str) -> Result<Option<CacheRecord<Value>>> {
    check_collection(collection)?;

    self.with_conn(|conn| {
      let row: Option<(Option<String>, Vec<u8>, i64, u32)> = conn
        .query_row(
          "SELECT owner_id, data, timestamp, schema_version FROM cache_records
           WHERE collection = ? AND record_key = ?",
          params![collection, key],
          |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()
        .map_err(|e| eyre!("Failed to read record {}/{}: {}", collection, key, e))?;

      match row {
        Some((owner_id, data, timestamp, version)) => {
          decode_record(key.to_string(), owner_id, &data, timestamp, version).map(Some)
        }
        None => Ok(None),
      }
    })
  }

  fn get_all_by_index(
    &self,
    collection: &str,
    index: RecordIndex,
    value: &str,
  ) -> Result<Vec<CacheRecord<Value>>> {
    check_collection(collection)?;
    let sql = match index {
      RecordIndex::Owner => {
        "SELECT record_key, owner_id, data, timestamp, schema_version FROM cache_records
         WHERE collection = ? AND owner_id = ?
         ORDER BY record_key"
      }
    };

    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(sql)
        .map_err(|e| eyre!("Failed to prepare index query: {}", e))?;

      let rows = stmt
        .query_map(params![collection, value], |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, u32>(4)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query index: {}", e))?;

      let mut records = Vec::new();
      for row in rows {
        let (key, owner_id, data, timestamp, version) =
          row.map_err(|e| eyre!("Failed to read indexed record: {}", e))?;
        records.push(decode_record(key, owner_id, &data, timestamp, version)?);
      }
      Ok(records)
    })
  }

  fn delete(&self, collection: &str, key: &str) -> Result<()> {
    check_collection(collection)?;

    self.with_conn(|conn| {
      conn
        .execute(
          "DELETE FROM cache_records WHERE collection = ? AND record_key = ?",
          params![collection, key],
        )
        .map_err(|e| eyre!("Failed to delete record {}/{}: {}", collection, key, e))?;
      Ok(())
    })
  }

  fn clear(&self, collection: &str) -> Result<()> {
    check_collection(collection)?;

    self.with_conn(|conn| {
      let removed = conn
        .execute(
          "DELETE FROM cache_records WHERE collection = ?",
          params![collection],
        )
        .map_err(|e| eyre!("Failed to clear collection {}: {}", collection, e))?;
      debug!(collection, removed, "cleared collection");
      Ok(())
    })
  }

  fn queue_push(
    &self,
    kind: &str,
    owner_id: &str,
    payload: &Value,
    timestamp: i64,
  ) -> Result<i64> {
    let payload =
      serde_json::to_vec(payload).map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;

    self.with_conn(|conn| {
      conn
        .execute(
          "INSERT INTO pending_mutations (kind, owner_id, payload, timestamp)
           VALUES (?, ?, ?, ?)",
          params![kind, owner_id, payload, timestamp],
        )
        .map_err(|e| eyre!("Failed to enqueue mutation: {}", e))?;
      Ok(conn.last_insert_rowid())
    })
  }

  fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
    self.with_conn(|conn| {
      let mut stmt = conn
        .prepare(
          "SELECT id, kind, owner_id, payload, timestamp FROM pending_mutations
           ORDER BY id",
        )
        .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

      let rows = stmt
        .query_map([], |row| {
          Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Vec<u8>>(3)?,
            row.get::<_, i64>(4)?,
          ))
        })
        .map_err(|e| eyre!("Failed to query queue: {}", e))?;

      let mut entries = Vec::new();
      for row in rows {
        let (id, kind, owner_id, payload, timestamp) =
          row.map_err(|e| eyre!("Failed to read queued mutation: {}", e))?;
        let payload: Value = serde_json::from_slice(&payload)
          .map_err(|e| eyre!("Failed to deserialize queued mutation {}: {}", id, e))?;
        entries.push(QueueEntry {
          id,
          kind,
          owner_id,
          payload,
          timestamp,
        });
      }
      Ok(entries)
    })
  }

  fn queue_remove(&self, id: i64) -> Result<()> {
    self.with_conn(|conn| {
      conn
        .execute("DELETE FROM pending_mutations WHERE id = ?", params![id])
        .map_err(|e| eyre!("Failed to remove queued mutation {}: {}", id, e))?;
      Ok(())
    })
  }

  fn queue_len(&self) -> Result<usize> {
    self.with_conn(|conn| {
      let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM pending_mutations", [], |row| {
          row.get(0)
        })
        .map_err(|e| eyre!("Failed to count queued mutations: {}", e))?;
      Ok(count as usize)
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use serde_json::json;
  use std::sync::Arc;

  fn record(key: &str, owner: Option<&str>, data: Value, timestamp: i64) -> CacheRecord<Value> {
    CacheRecord {
      key: key.to_string(),
      data,
      timestamp,
      schema_version: SCHEMA_VERSION,
      owner_id: owner.map(String::from),
    }
  }

  #[test]
  fn put_then_get() {
    let store = SqliteStore::in_memory();
    let rec = record("entities_u1", Some("u1"), json!([{"id": 1}]), 10);
    store.put(collections::ENTITIES, &rec).unwrap();

    assert_eq!(store.get(collections::ENTITIES, "entities_u1").unwrap(), Some(rec));
    assert_eq!(store.get(collections::ENTITIES, "entities_u2").unwrap(), None);
  }

  #[test]
  fn overwrite_keeps_single_record() {
    let store = SqliteStore::in_memory();
    store
      .put(collections::PROFILES, &record("u1", Some("u1"), json!("first"), 1))
      .unwrap();
    store
      .put(collections::PROFILES, &record("u1", Some("u1"), json!("second"), 2))
      .unwrap();

    let all = store
      .get_all_by_index(collections::PROFILES, RecordIndex::Owner, "u1")
      .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].data, json!("second"));
    assert_eq!(all[0].timestamp, 2);
  }

  #[test]
  fn index_lookup_scopes_by_owner_and_collection() {
    let store = SqliteStore::in_memory();
    store
      .put(collections::CONNECTION_ENTITIES, &record("a", Some("u1"), json!(1), 1))
      .unwrap();
    store
      .put(collections::CONNECTION_ENTITIES, &record("b", Some("u1"), json!(2), 1))
      .unwrap();
    store
      .put(collections::CONNECTION_ENTITIES, &record("c", Some("u2"), json!(3), 1))
      .unwrap();
    store
      .put(collections::CONNECTIONS, &record("d", Some("u1"), json!(4), 1))
      .unwrap();

    let keys: Vec<String> = store
      .get_all_by_index(collections::CONNECTION_ENTITIES, RecordIndex::Owner, "u1")
      .unwrap()
      .into_iter()
      .map(|r| r.key)
      .collect();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn delete_and_clear() {
    let store = SqliteStore::in_memory();
    store
      .put(collections::ASSETS, &record("x", None, json!(1), 1))
      .unwrap();
    store
      .put(collections::ASSETS, &record("y", None, json!(2), 1))
      .unwrap();

    store.delete(collections::ASSETS, "x").unwrap();
    assert!(store.get(collections::ASSETS, "x").unwrap().is_none());
    assert!(store.get(collections::ASSETS, "y").unwrap().is_some());

    store.clear(collections::ASSETS).unwrap();
    assert!(store.get(collections::ASSETS, "y").unwrap().is_none());
  }

  #[test]
  fn unknown_collection_is_rejected() {
    let store = SqliteStore::in_memory();
    let err = store
      .put("stickers_v0", &record("k", None, json!(null), 0))
      .unwrap_err();
    assert!(err.to_string().contains("Unknown collection"));
  }

  #[test]
  fn queue_ids_increase_in_insert_order() {
    let store = SqliteStore::in_memory();
    let a = store.queue_push("UPSERT_ENTITY", "u1", &json!({"n": 1}), 5).unwrap();
    let b = store.queue_push("UPSERT_ENTITY", "u1", &json!({"n": 2}), 5).unwrap();
    assert!(b > a);

    store.queue_remove(a).unwrap();
    let c = store.queue_push("DELETE_ENTITY", "u2", &json!({"n": 3}), 6).unwrap();
    assert!(c > b);

    let ids: Vec<i64> = store.queue_entries().unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![b, c]);
    assert_eq!(store.queue_len().unwrap(), 2);
  }

  #[test]
  fn concurrent_init_opens_once() {
    let store = Arc::new(SqliteStore::in_memory());
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let store = Arc::clone(&store);
        std::thread::spawn(move || store.init())
      })
      .collect();
    for handle in handles {
      handle.join().unwrap().unwrap();
    }
    assert_eq!(store.open_count(), 1);
  }

  #[test]
  fn schema_upgrade_drops_records_but_keeps_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let store = SqliteStore::at(&path);
      store
        .put(collections::ENTITIES, &record("entities_u1", Some("u1"), json!([]), 1))
        .unwrap();
      store.queue_push("UPDATE_PROFILE", "u1", &json!({}), 1).unwrap();
    }

    // Pretend the file was written by an older generation
    {
      let conn = Connection::open(&path).unwrap();
      conn.pragma_update(None, "user_version", 1u32).unwrap();
    }

    let store = SqliteStore::at(&path);
    assert!(store.get(collections::ENTITIES, "entities_u1").unwrap().is_none());
    assert_eq!(store.queue_len().unwrap(), 1);
  }

  #[test]
  fn reopen_same_generation_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    SqliteStore::at(&path)
      .put(collections::PROFILES, &record("u1", None, json!({"username": "ana"}), 1))
      .unwrap();

    let reopened = SqliteStore::at(&path);
    assert!(reopened.get(collections::PROFILES, "u1").unwrap().is_some());
  }
}
