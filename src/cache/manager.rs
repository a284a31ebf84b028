//! TTL cache manager that adds staleness semantics to the record store.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::store::{RecordIndex, RecordStore, SCHEMA_VERSION};
use super::traits::CacheRecord;
use crate::clock::{Clock, SystemClock};

/// Cache manager shared by every data-access function.
///
/// Expiry is enforced on the read side only: a record is written once and
/// each reader decides how old is too old. Stale records are deleted when a
/// read finds them, never by a background sweep.
///
/// One manager is built per process and handed out by cloning, which shares
/// the underlying store.
pub struct CacheManager<S: RecordStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S: RecordStore> CacheManager<S> {
  /// Create a new cache manager with the given storage backend.
  pub fn new(store: S) -> Self {
    Self::from_shared(Arc::new(store))
  }

  pub fn from_shared(store: Arc<S>) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
    }
  }

  /// Use a different clock for timestamps and staleness checks.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  /// Check if a record written at `timestamp` is older than `max_age`.
  pub fn is_stale(&self, timestamp: i64, max_age: Duration) -> bool {
    self.clock.now_millis() - timestamp > max_age.num_milliseconds()
  }

  /// Store `data` under `key`, stamping it with the current time.
  ///
  /// `ttl_hint` documents how long the writer expects the value to stay
  /// useful. It is not persisted; readers pass their own max age to [`get`].
  ///
  /// [`get`]: CacheManager::get
  pub fn set<T: Serialize>(
    &self,
    collection: &str,
    key: &str,
    data: &T,
    ttl_hint: Option<Duration>,
  ) -> Result<()> {
    if let Some(ttl) = ttl_hint {
      trace!(collection, key, ttl_secs = ttl.num_seconds(), "cache set");
    }
    self.write(collection, key, None, data)
  }

  /// Like [`set`](CacheManager::set), tagging the record with its owner so it
  /// can be found through the owner index.
  pub fn set_owned<T: Serialize>(
    &self,
    collection: &str,
    key: &str,
    owner_id: &str,
    data: &T,
  ) -> Result<()> {
    self.write(collection, key, Some(owner_id), data)
  }

  fn write<T: Serialize>(
    &self,
    collection: &str,
    key: &str,
    owner_id: Option<&str>,
    data: &T,
  ) -> Result<()> {
    let data = serde_json::to_value(data).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    let record = CacheRecord {
      key: key.to_string(),
      data,
      timestamp: self.clock.now_millis(),
      schema_version: SCHEMA_VERSION,
      owner_id: owner_id.map(String::from),
    };
    self.store.put(collection, &record)
  }

  /// Read a value no older than `max_age`.
  ///
  /// Returns `None` on a miss, on an expired record (which is deleted), and on
  /// any store failure.
  pub fn get<T: DeserializeOwned>(&self, collection: &str, key: &str, max_age: Duration) -> Option<T> {
    self.get_record(collection, key, max_age).map(|r| r.data)
  }

  /// Like [`get`](CacheManager::get) but keeps the record metadata.
  pub fn get_record<T: DeserializeOwned>(
    &self,
    collection: &str,
    key: &str,
    max_age: Duration,
  ) -> Option<CacheRecord<T>> {
    let record = self.load(collection, key)?;

    if self.is_stale(record.timestamp, max_age) {
      debug!(collection, key, "cache entry expired");
      self.discard(collection, key);
      return None;
    }

    Some(record)
  }

  /// Read a value regardless of its age.
  ///
  /// This is the last-resort read used while offline; records from an older
  /// schema generation are still treated as missing.
  pub fn get_any_age<T: DeserializeOwned>(
    &self,
    collection: &str,
    key: &str,
  ) -> Option<CacheRecord<T>> {
    self.load(collection, key)
  }

  /// All fresh values in `collection` belonging to `owner_id`.
  pub fn get_all_by_owner<T: DeserializeOwned>(
    &self,
    collection: &str,
    owner_id: &str,
    max_age: Duration,
  ) -> Vec<T> {
    let records = match self
      .store
      .get_all_by_index(collection, RecordIndex::Owner, owner_id)
    {
      Ok(records) => records,
      Err(e) => {
        warn!(collection, owner_id, error = %e, "cache index lookup failed");
        return Vec::new();
      }
    };

    let mut values = Vec::with_capacity(records.len());
    for record in records {
      if record.schema_version != SCHEMA_VERSION || self.is_stale(record.timestamp, max_age) {
        self.discard(collection, &record.key);
        continue;
      }
      match serde_json::from_value(record.data) {
        Ok(value) => values.push(value),
        Err(e) => {
          warn!(collection, key = %record.key, error = %e, "dropping undecodable cache entry");
          self.discard(collection, &record.key);
        }
      }
    }
    values
  }

  pub fn delete(&self, collection: &str, key: &str) -> Result<()> {
    self.store.delete(collection, key)
  }

  pub fn clear(&self, collection: &str) -> Result<()> {
    self.store.clear(collection)
  }

  /// Fetch and decode a record, treating every failure as a miss.
  fn load<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Option<CacheRecord<T>> {
    let record = match self.store.get(collection, key) {
      Ok(Some(record)) => record,
      Ok(None) => {
        trace!(collection, key, "cache miss");
        return None;
      }
      Err(e) => {
        warn!(collection, key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    if record.schema_version != SCHEMA_VERSION {
      debug!(
        collection,
        key,
        version = record.schema_version,
        "cache entry from another schema generation"
      );
      self.discard(collection, key);
      return None;
    }

    let CacheRecord {
      key: record_key,
      data,
      timestamp,
      schema_version,
      owner_id,
    } = record;

    match serde_json::from_value(data) {
      Ok(data) => Some(CacheRecord {
        key: record_key,
        data,
        timestamp,
        schema_version,
        owner_id,
      }),
      Err(e) => {
        warn!(collection, key, error = %e, "dropping undecodable cache entry");
        self.discard(collection, key);
        None
      }
    }
  }

  fn discard(&self, collection: &str, key: &str) {
    if let Err(e) = self.store.delete(collection, key) {
      warn!(collection, key, error = %e, "failed to delete cache entry");
    }
  }
}

impl<S: RecordStore> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{collections, SqliteStore};
  use crate::clock::ManualClock;
  use chrono::{TimeZone, Utc};
  use serde_json::{json, Value};

  fn manager() -> (CacheManager<SqliteStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
    ));
    let manager = CacheManager::new(SqliteStore::in_memory()).with_clock(clock.clone());
    (manager, clock)
  }

  #[test]
  fn read_within_max_age_hits() {
    let (cache, clock) = manager();
    let max_age = Duration::minutes(30);
    cache
      .set(collections::PROFILES, "u1", &json!({"username": "ana"}), Some(max_age))
      .unwrap();

    clock.advance(max_age - Duration::milliseconds(1));
    let value: Option<Value> = cache.get(collections::PROFILES, "u1", max_age);
    assert_eq!(value, Some(json!({"username": "ana"})));
  }

  #[test]
  fn read_past_max_age_misses_and_deletes() {
    let (cache, clock) = manager();
    let max_age = Duration::minutes(30);
    cache
      .set(collections::PROFILES, "u1", &json!({"username": "ana"}), None)
      .unwrap();

    clock.advance(max_age + Duration::milliseconds(1));
    let value: Option<Value> = cache.get(collections::PROFILES, "u1", max_age);
    assert_eq!(value, None);

    // The expired record is gone even for readers that accept any age
    let any: Option<CacheRecord<Value>> = cache.get_any_age(collections::PROFILES, "u1");
    assert!(any.is_none());
  }

  #[test]
  fn same_record_different_max_ages() {
    let (cache, clock) = manager();
    cache.set(collections::PROFILES, "u1", &1u32, None).unwrap();
    clock.advance(Duration::minutes(20));

    // A reader accepting 30 minutes still sees it
    assert_eq!(cache.get::<u32>(collections::PROFILES, "u1", Duration::minutes(30)), Some(1));
    // A stricter reader expires it
    assert_eq!(cache.get::<u32>(collections::PROFILES, "u1", Duration::minutes(15)), None);
  }

  #[test]
  fn any_age_read_ignores_staleness() {
    let (cache, clock) = manager();
    cache.set(collections::PROFILES, "u1", &"old", None).unwrap();
    clock.advance(Duration::days(30));

    let record: Option<CacheRecord<String>> = cache.get_any_age(collections::PROFILES, "u1");
    assert_eq!(record.map(|r| r.data), Some("old".to_string()));
  }

  #[test]
  fn overwrite_resets_timestamp() {
    let (cache, clock) = manager();
    let max_age = Duration::minutes(10);
    cache.set(collections::PROFILES, "u1", &"first", None).unwrap();
    clock.advance(Duration::minutes(8));
    cache.set(collections::PROFILES, "u1", &"second", None).unwrap();
    clock.advance(Duration::minutes(8));

    assert_eq!(
      cache.get::<String>(collections::PROFILES, "u1", max_age),
      Some("second".to_string())
    );
  }

  #[test]
  fn other_schema_generation_is_a_miss() {
    let (cache, _clock) = manager();
    let stale_generation = CacheRecord {
      key: "u1".to_string(),
      data: json!("legacy"),
      timestamp: cache.clock().now_millis(),
      schema_version: SCHEMA_VERSION - 1,
      owner_id: None,
    };
    cache.store().put(collections::PROFILES, &stale_generation).unwrap();

    assert!(cache.get_any_age::<String>(collections::PROFILES, "u1").is_none());
    assert!(cache.store().get(collections::PROFILES, "u1").unwrap().is_none());
  }

  #[test]
  fn undecodable_entry_is_a_miss() {
    let (cache, _clock) = manager();
    cache.set(collections::PROFILES, "u1", &"not a number", None).unwrap();
    assert_eq!(cache.get::<u32>(collections::PROFILES, "u1", Duration::hours(1)), None);
  }

  #[test]
  fn owner_lookup_skips_expired() {
    let (cache, clock) = manager();
    cache
      .set_owned(collections::CONNECTION_ENTITIES, "old", "u1", &1u32)
      .unwrap();
    clock.advance(Duration::minutes(20));
    cache
      .set_owned(collections::CONNECTION_ENTITIES, "new", "u1", &2u32)
      .unwrap();

    let values: Vec<u32> =
      cache.get_all_by_owner(collections::CONNECTION_ENTITIES, "u1", Duration::minutes(10));
    assert_eq!(values, vec![2]);
  }
}
