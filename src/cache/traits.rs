//! Core types for the caching system.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Names of the collections known to the store.
pub mod collections {
  /// An owner's album, one record per owner.
  pub const ENTITIES: &str = "entities";
  /// Friends' albums viewed read-only, one record per (owner, friend).
  pub const CONNECTION_ENTITIES: &str = "connection_entities";
  pub const PROFILES: &str = "profiles";
  /// An owner's accepted connections.
  pub const CONNECTIONS: &str = "connections";
  /// Sticker photos that have been uploaded or are waiting to be.
  pub const ASSETS: &str = "assets";

  pub const ALL: &[&str] = &[ENTITIES, CONNECTION_ENTITIES, PROFILES, CONNECTIONS, ASSETS];

  pub fn entities_key(owner_id: &str) -> String {
    format!("entities_{}", owner_id)
  }

  pub fn connection_entities_key(owner_id: &str, friend_id: &str) -> String {
    format!("connection_entities_{}_{}", owner_id, friend_id)
  }

  pub fn connections_key(owner_id: &str) -> String {
    format!("connections_{}", owner_id)
  }

  pub fn asset_key(owner_id: &str, entity_id: u32) -> String {
    format!("asset_{}_{}", owner_id, entity_id)
  }
}

/// A stored value plus the metadata needed to judge its freshness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord<T> {
  /// Primary key, unique within a collection
  pub key: String,
  pub data: T,
  /// Creation/refresh time in milliseconds since the epoch
  pub timestamp: i64,
  /// Store schema generation the record was written under
  pub schema_version: u32,
  /// Secondary index value (owner id) if the record belongs to an owner
  pub owner_id: Option<String>,
}

impl<T> CacheRecord<T> {
  /// When the record was written.
  pub fn cached_at(&self) -> DateTime<Utc> {
    Utc
      .timestamp_millis_opt(self.timestamp)
      .single()
      .unwrap_or_default()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  ///
  /// `refreshing` marks a hit that was served while a background refresh runs.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, refreshing: bool) -> Self {
    Self {
      data,
      source: if refreshing {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Nothing cached and nothing fetched.
  pub fn fallback(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Default,
      cached_at: None,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, returned as final
  CacheFresh,
  /// Data from cache, a background refresh was started
  CacheStale,
  /// Offline mode - network unavailable, serving cached data of any age
  Offline,
  /// Nothing available; a default value was produced
  Default,
}
