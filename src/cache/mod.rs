//! Local persistence for offline support.
//!
//! This module provides the storage half of the offline-first data layer:
//! - A durable record store organised into named collections
//! - Per-record timestamps and schema generation tags
//! - A TTL cache manager that expires stale records lazily on read
//! - The raw FIFO table backing the mutation queue

mod manager;
mod store;
mod traits;

pub use manager::CacheManager;
pub use store::{QueueEntry, RecordIndex, RecordStore, SqliteStore, SCHEMA_VERSION};
pub use traits::{collections, CacheRecord, CacheResult, CacheSource};
