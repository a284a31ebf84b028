#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stickersync::cache::{CacheManager, CacheRecord, QueueEntry, RecordIndex, RecordStore, SqliteStore};
use stickersync::clock::ManualClock;
use stickersync::connectivity::ConnectivityMonitor;
use stickersync::model::{Asset, Profile, ProfileUpdate, Sticker};
use stickersync::queue::MutationQueue;
use stickersync::remote::{RemoteEndpoint, RemoteError, RemoteResult};
use stickersync::sync::{SyncOrchestrator, SyncSettings};

/// A call the fake endpoint received, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  Health,
  FetchEntities(String),
  Upsert(String, Sticker),
  Delete(String, u32),
  FetchProfile(String),
  UpdateProfile(String, ProfileUpdate),
  FetchConnections(String),
  Upload(String, u32),
}

/// In-memory remote endpoint with scriptable failures.
#[derive(Default)]
pub struct FakeRemote {
  entities: Mutex<HashMap<String, BTreeMap<u32, Sticker>>>,
  profiles: Mutex<HashMap<String, Profile>>,
  connections: Mutex<HashMap<String, Vec<String>>>,
  uploads: Mutex<HashMap<String, Asset>>,
  failures: Mutex<VecDeque<RemoteError>>,
  delays: Mutex<VecDeque<Duration>>,
  down: Mutex<bool>,
  calls: Mutex<Vec<Call>>,
}

impl FakeRemote {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Make the next call fail with `error`; queued failures are used in order.
  pub fn fail_next(&self, error: RemoteError) {
    self.failures.lock().unwrap().push_back(error);
  }

  /// Make the next call take `delay` before it answers.
  pub fn delay_next(&self, delay: Duration) {
    self.delays.lock().unwrap().push_back(delay);
  }

  /// Fail every call transiently until brought back.
  pub fn set_down(&self, down: bool) {
    *self.down.lock().unwrap() = down;
  }

  pub fn put_entity(&self, owner_id: &str, sticker: Sticker) {
    self
      .entities
      .lock()
      .unwrap()
      .entry(owner_id.to_string())
      .or_default()
      .insert(sticker.id, sticker);
  }

  pub fn entity(&self, owner_id: &str, id: u32) -> Option<Sticker> {
    self
      .entities
      .lock()
      .unwrap()
      .get(owner_id)
      .and_then(|e| e.get(&id).cloned())
  }

  pub fn put_profile(&self, profile: Profile) {
    self
      .profiles
      .lock()
      .unwrap()
      .insert(profile.id.clone(), profile);
  }

  pub fn profile(&self, user_id: &str) -> Option<Profile> {
    self.profiles.lock().unwrap().get(user_id).cloned()
  }

  pub fn connect(&self, owner_id: &str, friend_id: &str) {
    self
      .connections
      .lock()
      .unwrap()
      .entry(owner_id.to_string())
      .or_default()
      .push(friend_id.to_string());
  }

  pub fn uploaded(&self, owner_id: &str, id: u32) -> Option<Asset> {
    self
      .uploads
      .lock()
      .unwrap()
      .get(&Asset::object_path(owner_id, id))
      .cloned()
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  /// Upserts received, successful or not.
  pub fn upserts(&self) -> Vec<Sticker> {
    self
      .calls()
      .into_iter()
      .filter_map(|c| match c {
        Call::Upsert(_, sticker) => Some(sticker),
        _ => None,
      })
      .collect()
  }

  pub fn fetch_count(&self) -> usize {
    self
      .calls()
      .iter()
      .filter(|c| matches!(c, Call::FetchEntities(_)))
      .count()
  }

  pub fn clear_calls(&self) {
    self.calls.lock().unwrap().clear();
  }

  /// Record the call and decide its fate on arrival, then wait out any delay.
  async fn enter(&self, call: Call) -> RemoteResult<()> {
    self.calls.lock().unwrap().push(call);
    let delay = self.delays.lock().unwrap().pop_front();
    let result = if *self.down.lock().unwrap() {
      Err(RemoteError::Transient("connection refused".into()))
    } else {
      let failure = self.failures.lock().unwrap().pop_front();
      failure.map_or(Ok(()), Err)
    };

    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    result
  }
}

#[async_trait]
impl RemoteEndpoint for FakeRemote {
  async fn health(&self) -> RemoteResult<()> {
    self.enter(Call::Health).await
  }

  async fn fetch_entities(&self, owner_id: &str) -> RemoteResult<Vec<Sticker>> {
    self.enter(Call::FetchEntities(owner_id.to_string())).await?;
    Ok(
      self
        .entities
        .lock()
        .unwrap()
        .get(owner_id)
        .map(|e| e.values().cloned().collect())
        .unwrap_or_default(),
    )
  }

  async fn upsert_entity(&self, owner_id: &str, entity: &Sticker) -> RemoteResult<Sticker> {
    self.enter(Call::Upsert(owner_id.to_string(), entity.clone())).await?;
    let mut canonical = entity.clone();
    if canonical.collected && canonical.date_collected.is_none() {
      canonical.date_collected = Some("2024-06-01T12:00:00+00:00".to_string());
    }
    self.put_entity(owner_id, canonical.clone());
    Ok(canonical)
  }

  async fn delete_entity(&self, owner_id: &str, entity_id: u32) -> RemoteResult<()> {
    self.enter(Call::Delete(owner_id.to_string(), entity_id)).await?;
    if let Some(entities) = self.entities.lock().unwrap().get_mut(owner_id) {
      entities.remove(&entity_id);
    }
    Ok(())
  }

  async fn fetch_profile(&self, user_id: &str) -> RemoteResult<Option<Profile>> {
    self.enter(Call::FetchProfile(user_id.to_string())).await?;
    Ok(self.profile(user_id))
  }

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> RemoteResult<Profile> {
    self.enter(Call::UpdateProfile(user_id.to_string(), update.clone())).await?;
    let mut profiles = self.profiles.lock().unwrap();
    let profile = profiles.get_mut(user_id).ok_or(RemoteError::Rejected {
      status: 404,
      message: "no such profile".into(),
    })?;
    profile.apply(update, Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
    Ok(profile.clone())
  }

  async fn fetch_connections(&self, owner_id: &str) -> RemoteResult<Vec<Profile>> {
    self.enter(Call::FetchConnections(owner_id.to_string())).await?;
    let ids = self
      .connections
      .lock()
      .unwrap()
      .get(owner_id)
      .cloned()
      .unwrap_or_default();
    Ok(ids.iter().filter_map(|id| self.profile(id)).collect())
  }

  async fn upload_asset(
    &self,
    owner_id: &str,
    entity_id: u32,
    asset: &Asset,
  ) -> RemoteResult<String> {
    self.enter(Call::Upload(owner_id.to_string(), entity_id)).await?;
    let path = Asset::object_path(owner_id, entity_id);
    self.uploads.lock().unwrap().insert(path.clone(), asset.clone());
    Ok(format!("https://fake.test/storage/{}", path))
  }
}

/// A store where every operation fails, as with a full disk.
pub struct FailingStore;

impl RecordStore for FailingStore {
  fn init(&self) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn put(&self, _collection: &str, _record: &CacheRecord<Value>) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn get(&self, _collection: &str, _key: &str) -> Result<Option<CacheRecord<Value>>> {
    Err(eyre!("quota exceeded"))
  }

  fn get_all_by_index(
    &self,
    _collection: &str,
    _index: RecordIndex,
    _value: &str,
  ) -> Result<Vec<CacheRecord<Value>>> {
    Err(eyre!("quota exceeded"))
  }

  fn delete(&self, _collection: &str, _key: &str) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn clear(&self, _collection: &str) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn queue_push(&self, _kind: &str, _owner_id: &str, _payload: &Value, _timestamp: i64) -> Result<i64> {
    Err(eyre!("quota exceeded"))
  }

  fn queue_entries(&self) -> Result<Vec<QueueEntry>> {
    Err(eyre!("quota exceeded"))
  }

  fn queue_remove(&self, _id: i64) -> Result<()> {
    Err(eyre!("quota exceeded"))
  }

  fn queue_len(&self) -> Result<usize> {
    Err(eyre!("quota exceeded"))
  }
}

pub struct Harness<S: RecordStore + 'static = SqliteStore> {
  pub sync: SyncOrchestrator<S, FakeRemote>,
  pub remote: Arc<FakeRemote>,
  pub clock: Arc<ManualClock>,
}

impl<S: RecordStore + 'static> Harness<S> {
  pub fn go_online(&self) {
    self.sync.connectivity().set_online(true);
  }

  pub fn go_offline(&self) {
    self.sync.connectivity().set_online(false);
  }

  pub fn advance_minutes(&self, minutes: i64) {
    self.clock.advance(chrono::Duration::minutes(minutes));
  }
}

pub fn harness(online: bool) -> Harness {
  harness_with(SqliteStore::in_memory(), online)
}

pub fn harness_with<S: RecordStore + 'static>(store: S, online: bool) -> Harness<S> {
  let clock = Arc::new(ManualClock::new(
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
  ));
  let remote = FakeRemote::new();

  let cache = CacheManager::new(store).with_clock(clock.clone());
  let queue = MutationQueue::new(Arc::clone(cache.store())).with_clock(clock.clone());
  let sync = SyncOrchestrator::new(
    cache,
    queue,
    Arc::clone(&remote),
    ConnectivityMonitor::new(online),
    SyncSettings::default(),
  );

  Harness {
    sync,
    remote,
    clock,
  }
}

pub fn profile(id: &str, username: &str) -> Profile {
  Profile {
    id: id.to_string(),
    username: username.to_string(),
    full_name: None,
    avatar_url: None,
    created_at: "2024-01-01T00:00:00+00:00".to_string(),
    updated_at: "2024-01-01T00:00:00+00:00".to_string(),
  }
}
