//! Durable FIFO of writes waiting to reach the remote endpoint.
//!
//! Mutations are replayed oldest first. Each mutation belongs to a stream
//! (one entity of one owner, or one owner's profile); once a replay in a
//! stream fails transiently the rest of that stream waits for the next drain,
//! while other streams keep going.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{QueueEntry, RecordStore};
use crate::clock::{Clock, SystemClock};
use crate::model::{Asset, ProfileUpdate, Sticker};
use crate::remote::RemoteError;

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mutation {
  UpsertEntity {
    entity: Sticker,
  },
  DeleteEntity {
    entity_id: u32,
  },
  UpdateProfile {
    update: ProfileUpdate,
  },
  /// A sticker photo; bytes are hex encoded so the payload stays JSON.
  UploadAsset {
    entity_id: u32,
    content_type: String,
    data_hex: String,
    sha256: String,
  },
}

/// Discriminant of [`Mutation`], stored alongside each queued row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
  UpsertEntity,
  DeleteEntity,
  UpdateProfile,
  UploadAsset,
}

impl MutationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::UpsertEntity => "UPSERT_ENTITY",
      Self::DeleteEntity => "DELETE_ENTITY",
      Self::UpdateProfile => "UPDATE_PROFILE",
      Self::UploadAsset => "UPLOAD_ASSET",
    }
  }
}

impl Mutation {
  pub fn upload(entity_id: u32, asset: &Asset) -> Self {
    Self::UploadAsset {
      entity_id,
      content_type: asset.content_type.clone(),
      data_hex: hex::encode(&asset.bytes),
      sha256: asset.digest(),
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      Self::UpsertEntity { .. } => MutationKind::UpsertEntity,
      Self::DeleteEntity { .. } => MutationKind::DeleteEntity,
      Self::UpdateProfile { .. } => MutationKind::UpdateProfile,
      Self::UploadAsset { .. } => MutationKind::UploadAsset,
    }
  }

  /// The entity this mutation touches, if any.
  pub fn entity_id(&self) -> Option<u32> {
    match self {
      Self::UpsertEntity { entity } => Some(entity.id),
      Self::DeleteEntity { entity_id } | Self::UploadAsset { entity_id, .. } => Some(*entity_id),
      Self::UpdateProfile { .. } => None,
    }
  }

  /// Ordering stream: mutations with equal keys are never reordered.
  pub fn stream_key(&self, owner_id: &str) -> String {
    match self.entity_id() {
      Some(id) => format!("entity:{}:{}", owner_id, id),
      None => format!("profile:{}", owner_id),
    }
  }

  /// Decode the asset carried by an upload, checking it against its digest.
  pub fn asset(&self) -> Option<Result<Asset>> {
    let Self::UploadAsset {
      content_type,
      data_hex,
      sha256,
      ..
    } = self
    else {
      return None;
    };

    Some(
      hex::decode(data_hex)
        .map_err(|e| eyre!("Corrupt queued asset: {}", e))
        .and_then(|bytes| {
          let asset = Asset {
            content_type: content_type.clone(),
            bytes,
          };
          if asset.digest() == *sha256 {
            Ok(asset)
          } else {
            Err(eyre!("Queued asset does not match its digest"))
          }
        }),
    )
  }
}

/// A mutation as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
  /// Assigned by the store, increasing in insert order
  pub id: i64,
  pub owner_id: String,
  pub mutation: Mutation,
  /// Enqueue time in milliseconds since the epoch
  pub timestamp: i64,
}

impl PendingMutation {
  pub fn kind(&self) -> MutationKind {
    self.mutation.kind()
  }

  pub fn stream_key(&self) -> String {
    self.mutation.stream_key(&self.owner_id)
  }

  pub fn queued_at(&self) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
  }
}

/// A replay the remote endpoint refused; it has been removed from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedMutation {
  pub mutation: PendingMutation,
  pub reason: String,
}

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Accepted by the remote and removed
  pub applied: usize,
  /// Refused by the remote and removed
  pub rejected: Vec<RejectedMutation>,
  /// Left in the queue for a later pass
  pub deferred: usize,
  /// Most recent transient failure, if any
  pub last_error: Option<RemoteError>,
}

impl DrainReport {
  /// True when nothing is left waiting.
  pub fn is_complete(&self) -> bool {
    self.deferred == 0
  }
}

/// Mutation queue persisted in the record store.
pub struct MutationQueue<S: RecordStore> {
  store: Arc<S>,
  clock: Arc<dyn Clock>,
  /// Held for the whole of a drain so two passes never replay the same row
  draining: Arc<Mutex<()>>,
}

impl<S: RecordStore> MutationQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      clock: Arc::new(SystemClock),
      draining: Arc::new(Mutex::new(())),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Append a mutation.
  ///
  /// An error here means the write exists nowhere but in memory.
  pub fn enqueue(&self, owner_id: &str, mutation: Mutation) -> Result<PendingMutation> {
    let payload = serde_json::to_value(&mutation)
      .map_err(|e| eyre!("Failed to serialize mutation: {}", e))?;
    let timestamp = self.clock.now_millis();
    let kind = mutation.kind();

    let id = self
      .store
      .queue_push(kind.as_str(), owner_id, &payload, timestamp)?;
    debug!(id, owner_id, kind = kind.as_str(), "mutation queued");

    Ok(PendingMutation {
      id,
      owner_id: owner_id.to_string(),
      mutation,
      timestamp,
    })
  }

  /// All pending mutations, oldest first.
  ///
  /// Rows that cannot be decoded are skipped but left in place; only a drain
  /// removes them.
  pub fn pending(&self) -> Result<Vec<PendingMutation>> {
    let entries = self.store.queue_entries()?;
    let mut pending = Vec::with_capacity(entries.len());
    for entry in entries {
      match decode(entry) {
        Ok(mutation) => pending.push(mutation),
        Err((id, e)) => warn!(id, error = %e, "skipping unreadable queued mutation"),
      }
    }
    Ok(pending)
  }

  /// Pending mutations for one owner, oldest first.
  pub fn pending_for_owner(&self, owner_id: &str) -> Result<Vec<PendingMutation>> {
    Ok(
      self
        .pending()?
        .into_iter()
        .filter(|m| m.owner_id == owner_id)
        .collect(),
    )
  }

  pub fn len(&self) -> Result<usize> {
    self.store.queue_len()
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Replay every pending mutation through `apply`, one at a time.
  ///
  /// Accepted mutations are removed. A transient failure leaves the mutation
  /// in place and holds back the rest of its stream; a rejection removes it.
  pub async fn drain<F, Fut>(&self, mut apply: F) -> Result<DrainReport>
  where
    F: FnMut(PendingMutation) -> Fut,
    Fut: Future<Output = Result<(), RemoteError>>,
  {
    let _guard = self.draining.lock().await;

    let mut pending = Vec::new();
    for entry in self.store.queue_entries()? {
      match decode(entry) {
        Ok(mutation) => pending.push(mutation),
        Err((id, e)) => {
          error!(id, error = %e, "dropping unreadable queued mutation");
          self.remove(id);
        }
      }
    }

    let mut report = DrainReport::default();
    if pending.is_empty() {
      return Ok(report);
    }

    let mut blocked: HashSet<String> = HashSet::new();

    for mutation in pending {
      let stream = mutation.stream_key();
      if blocked.contains(&stream) {
        report.deferred += 1;
        continue;
      }

      match apply(mutation.clone()).await {
        Ok(()) => {
          self.remove(mutation.id);
          report.applied += 1;
        }
        Err(e) if e.is_transient() => {
          debug!(id = mutation.id, stream = %stream, error = %e, "replay deferred");
          blocked.insert(stream);
          report.deferred += 1;
          report.last_error = Some(e);
        }
        Err(e) => {
          warn!(
            id = mutation.id,
            kind = mutation.kind().as_str(),
            owner_id = %mutation.owner_id,
            error = %e,
            "remote rejected queued mutation, dropping it"
          );
          self.remove(mutation.id);
          report.rejected.push(RejectedMutation {
            mutation,
            reason: e.to_string(),
          });
        }
      }
    }

    info!(
      applied = report.applied,
      rejected = report.rejected.len(),
      deferred = report.deferred,
      "mutation queue drained"
    );
    Ok(report)
  }

  fn remove(&self, id: i64) {
    // A row that survives here is replayed again next drain; replays are idempotent upserts
    if let Err(e) = self.store.queue_remove(id) {
      warn!(id, error = %e, "failed to remove replayed mutation");
    }
  }

}

fn decode(entry: QueueEntry) -> std::result::Result<PendingMutation, (i64, serde_json::Error)> {
  match serde_json::from_value::<Mutation>(entry.payload) {
    Ok(mutation) => Ok(PendingMutation {
      id: entry.id,
      owner_id: entry.owner_id,
      mutation,
      timestamp: entry.timestamp,
    }),
    Err(e) => Err((entry.id, e)),
  }
}

impl<S: RecordStore> Clone for MutationQueue<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      clock: Arc::clone(&self.clock),
      draining: Arc::clone(&self.draining),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStore;
  use pretty_assertions::assert_eq;
  use std::sync::Mutex as StdMutex;

  fn queue() -> MutationQueue<SqliteStore> {
    MutationQueue::new(Arc::new(SqliteStore::in_memory()))
  }

  fn upsert(id: u32, notes: &str) -> Mutation {
    Mutation::UpsertEntity {
      entity: Sticker::collected(id).with_notes(notes),
    }
  }

  #[test]
  fn mutation_json_is_tagged() {
    let json = serde_json::to_value(Mutation::DeleteEntity { entity_id: 5 }).unwrap();
    assert_eq!(json, serde_json::json!({"type": "DELETE_ENTITY", "entity_id": 5}));
  }

  #[test]
  fn stream_keys_separate_entities_and_profiles() {
    assert_eq!(upsert(5, "a").stream_key("u1"), "entity:u1:5");
    assert_eq!(
      Mutation::DeleteEntity { entity_id: 5 }.stream_key("u1"),
      "entity:u1:5"
    );
    assert_eq!(
      Mutation::UpdateProfile {
        update: ProfileUpdate::default()
      }
      .stream_key("u1"),
      "profile:u1"
    );
  }

  #[test]
  fn upload_roundtrips_and_verifies_digest() {
    let asset = Asset::jpeg(vec![1, 2, 3, 4]);
    let mutation = Mutation::upload(9, &asset);
    assert_eq!(mutation.asset().unwrap().unwrap(), asset);

    let Mutation::UploadAsset {
      entity_id,
      content_type,
      sha256,
      ..
    } = mutation
    else {
      unreachable!()
    };
    let tampered = Mutation::UploadAsset {
      entity_id,
      content_type,
      data_hex: hex::encode([9, 9]),
      sha256,
    };
    assert!(tampered.asset().unwrap().is_err());
  }

  #[tokio::test]
  async fn drain_applies_everything_in_order_and_empties() {
    let queue = queue();
    for n in 1..=5 {
      queue.enqueue("u1", upsert(n, "x")).unwrap();
    }

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let report = queue
      .drain(|m| {
        let seen = Arc::clone(&seen);
        async move {
          seen.lock().unwrap().push(m.mutation.entity_id().unwrap());
          Ok(())
        }
      })
      .await
      .unwrap();

    assert_eq!(report.applied, 5);
    assert!(report.is_complete());
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn same_entity_mutations_keep_order() {
    let queue = queue();
    queue.enqueue("u1", upsert(7, "first")).unwrap();
    queue.enqueue("u1", upsert(7, "second")).unwrap();

    let seen = Arc::new(StdMutex::new(Vec::new()));
    queue
      .drain(|m| {
        let seen = Arc::clone(&seen);
        async move {
          if let Mutation::UpsertEntity { entity } = m.mutation {
            seen.lock().unwrap().push(entity.notes.unwrap_or_default());
          }
          Ok(())
        }
      })
      .await
      .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);
  }

  #[tokio::test]
  async fn transient_failure_blocks_only_its_stream() {
    let queue = queue();
    let stuck = queue.enqueue("u1", upsert(7, "first")).unwrap();
    let later = queue.enqueue("u1", upsert(7, "second")).unwrap();
    queue.enqueue("u2", upsert(7, "other owner")).unwrap();

    let seen = Arc::new(StdMutex::new(Vec::new()));
    let report = queue
      .drain(|m| {
        let seen = Arc::clone(&seen);
        async move {
          if m.owner_id == "u1" {
            return Err(RemoteError::Transient("offline".into()));
          }
          seen.lock().unwrap().push(m.owner_id);
          Ok(())
        }
      })
      .await
      .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.deferred, 2);
    assert_eq!(*seen.lock().unwrap(), vec!["u2".to_string()]);

    let ids: Vec<i64> = queue.pending().unwrap().iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![stuck.id, later.id]);
  }

  #[tokio::test]
  async fn rejected_mutations_are_dropped_not_retried() {
    let queue = queue();
    queue.enqueue("u1", upsert(1, "bad")).unwrap();
    queue.enqueue("u1", upsert(1, "good")).unwrap();

    let report = queue
      .drain(|m| async move {
        match m.mutation {
          Mutation::UpsertEntity { ref entity } if entity.notes.as_deref() == Some("bad") => {
            Err(RemoteError::Rejected {
              status: 400,
              message: "invalid".into(),
            })
          }
          _ => Ok(()),
        }
      })
      .await
      .unwrap();

    assert_eq!(report.applied, 1);
    assert_eq!(report.rejected.len(), 1);
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn unreadable_rows_survive_reads_and_are_dropped_by_drain() {
    let store = Arc::new(SqliteStore::in_memory());
    store
      .queue_push("UPSERT_ENTITY", "u1", &serde_json::json!({"type": "NOPE"}), 1)
      .unwrap();
    let queue = MutationQueue::new(Arc::clone(&store));
    queue.enqueue("u1", upsert(2, "ok")).unwrap();

    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(queue.pending_for_owner("u1").unwrap().len(), 1);
    assert_eq!(store.queue_len().unwrap(), 2);

    let report = queue.drain(|_| async { Ok(()) }).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(store.queue_len().unwrap(), 0);
  }
}
