//! Offline-first data layer for a sticker album backed by a hosted database.
//!
//! Reads go through a local TTL cache, writes are applied locally first and
//! queued while the remote endpoint is unreachable, and the queue is replayed
//! once connectivity returns.

pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod model;
pub mod queue;
pub mod remote;
pub mod sync;

pub use cache::{CacheManager, CacheResult, CacheSource, RecordStore, SqliteStore};
pub use connectivity::ConnectivityMonitor;
pub use queue::{DrainReport, Mutation, MutationQueue, PendingMutation};
pub use remote::{RemoteEndpoint, RemoteError, RestRemote};
pub use sync::{ReadStrategy, SyncOrchestrator, SyncSettings, WriteOutcome};
