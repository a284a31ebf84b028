//! Read-through / write-through data access over the cache, the queue and the remote.
//!
//! Reads are served from the cache when possible. A fresh hit while online
//! also starts a background refresh whose result is only seen by the next
//! read. A background refresh that started before a local write may land after
//! it and overwrite the optimistic value; pending queued writes are re-applied
//! on top of every refresh, and anything else heals on the next refresh.
//!
//! Writes update the cache first and then try the remote. Transient failures
//! and offline writes go to the mutation queue and still count as success.
//! Writes in the same ordering stream run one at a time, so a slow write is
//! queued or confirmed before the next one for that entity starts.
//! The model assumes one writer per entity: two devices queueing conflicting
//! writes offline resolve as last-to-sync-wins.

use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{collections, CacheManager, CacheResult, RecordStore};
use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::model::{
  default_album, fill_album, merge_entity, reset_entity, Asset, Profile, ProfileUpdate, Sticker,
  DEFAULT_ALBUM_SIZE,
};
use crate::queue::{DrainReport, Mutation, MutationQueue, PendingMutation};
use crate::remote::{RemoteEndpoint, RemoteError, RemoteResult};

/// Tunables for the data-access layer.
#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub album_size: u32,
  pub entity_max_age: Duration,
  pub profile_max_age: Duration,
  pub connections_max_age: Duration,
  /// Retry period for queued writes while online
  pub sync_interval: std::time::Duration,
}

impl SyncSettings {
  pub fn from_config(config: &Config) -> Self {
    Self {
      album_size: config.album.size,
      entity_max_age: config.cache.entity_max_age(),
      profile_max_age: config.cache.profile_max_age(),
      connections_max_age: config.cache.connections_max_age(),
      sync_interval: std::time::Duration::from_secs(config.sync.interval_secs),
    }
  }
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      album_size: DEFAULT_ALBUM_SIZE,
      entity_max_age: Duration::minutes(30),
      profile_max_age: Duration::minutes(15),
      connections_max_age: Duration::minutes(15),
      sync_interval: std::time::Duration::from_secs(60),
    }
  }
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
  /// The remote accepted the write
  Synced,
  /// Local state is updated and the write waits in the mutation queue
  Queued,
  /// The remote refused the write; the local change was undone
  Rejected { reason: String },
  /// The write could not be queued; it only exists in the local cache, if there
  Failed { reason: String },
}

impl WriteOutcome {
  /// Local state is updated and will reach the remote.
  pub fn is_success(&self) -> bool {
    matches!(self, WriteOutcome::Synced | WriteOutcome::Queued)
  }
}

/// How a read balances the cache against the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
  /// Serve a fresh cached value and revalidate behind it; fetch on a miss
  CacheFirst,
  /// Ask the remote every time and fall back to any cached value
  NetworkFirst,
}

/// A cached resource that can be refreshed from the remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
  /// An owner's own album
  Entities { owner_id: String },
  /// A friend's album as seen by an owner
  ConnectionEntities { owner_id: String, friend_id: String },
  /// An owner's accepted connections
  Connections { owner_id: String },
  Profile { user_id: String },
}

impl Resource {
  pub fn collection(&self) -> &'static str {
    match self {
      Self::Entities { .. } => collections::ENTITIES,
      Self::ConnectionEntities { .. } => collections::CONNECTION_ENTITIES,
      Self::Connections { .. } => collections::CONNECTIONS,
      Self::Profile { .. } => collections::PROFILES,
    }
  }

  pub fn key(&self) -> String {
    match self {
      Self::Entities { owner_id } => collections::entities_key(owner_id),
      Self::ConnectionEntities {
        owner_id,
        friend_id,
      } => collections::connection_entities_key(owner_id, friend_id),
      Self::Connections { owner_id } => collections::connections_key(owner_id),
      Self::Profile { user_id } => user_id.clone(),
    }
  }

  /// Owner used for the store's owner index.
  pub fn owner(&self) -> &str {
    match self {
      Self::Entities { owner_id }
      | Self::ConnectionEntities { owner_id, .. }
      | Self::Connections { owner_id } => owner_id,
      Self::Profile { user_id } => user_id,
    }
  }

  pub fn strategy(&self) -> ReadStrategy {
    match self {
      Self::Profile { .. } => ReadStrategy::NetworkFirst,
      _ => ReadStrategy::CacheFirst,
    }
  }

  pub fn description(&self) -> String {
    match self {
      Self::Entities { owner_id } => format!("album of {}", owner_id),
      Self::ConnectionEntities {
        owner_id,
        friend_id,
      } => format!("album of {} as seen by {}", friend_id, owner_id),
      Self::Connections { owner_id } => format!("connections of {}", owner_id),
      Self::Profile { user_id } => format!("profile {}", user_id),
    }
  }
}

/// Fetch phase of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
  Idle,
  /// A caller is waiting on the remote after a miss
  Fetching,
  /// A cached value was served and a refresh runs behind it
  BackgroundFetching,
}

/// Photo bytes kept locally so they can be shown before the upload lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedAsset {
  content_type: String,
  data_hex: String,
}

/// Coordinates the cache, the mutation queue and the remote endpoint.
///
/// Build one per process and clone it into whatever needs data access;
/// clones share all state.
pub struct SyncOrchestrator<S: RecordStore, R: RemoteEndpoint> {
  cache: CacheManager<S>,
  queue: MutationQueue<S>,
  remote: Arc<R>,
  connectivity: ConnectivityMonitor,
  settings: Arc<SyncSettings>,
  in_flight: Arc<Mutex<HashMap<Resource, ResourceState>>>,
  active_owners: Arc<Mutex<BTreeSet<String>>>,
  background: Arc<Mutex<Vec<JoinHandle<()>>>>,
  /// One lock per ordering stream ever written; bounded by album size per owner
  streams: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
  /// Held for each read-modify-write of a cached album
  album_edits: Arc<Mutex<()>>,
}

impl<S: RecordStore + 'static, R: RemoteEndpoint> SyncOrchestrator<S, R> {
  pub fn new(
    cache: CacheManager<S>,
    queue: MutationQueue<S>,
    remote: Arc<R>,
    connectivity: ConnectivityMonitor,
    settings: SyncSettings,
  ) -> Self {
    Self {
      cache,
      queue,
      remote,
      connectivity,
      settings: Arc::new(settings),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      active_owners: Arc::new(Mutex::new(BTreeSet::new())),
      background: Arc::new(Mutex::new(Vec::new())),
      streams: Arc::new(Mutex::new(HashMap::new())),
      album_edits: Arc::new(Mutex::new(())),
    }
  }

  /// Build the cache and the queue over one shared store.
  pub fn from_store(
    store: S,
    remote: R,
    connectivity: ConnectivityMonitor,
    settings: SyncSettings,
  ) -> Self {
    let cache = CacheManager::new(store);
    let queue = MutationQueue::new(Arc::clone(cache.store()));
    Self::new(cache, queue, Arc::new(remote), connectivity, settings)
  }

  /// Cache primitives for data-access code outside the core.
  pub fn cache(&self) -> &CacheManager<S> {
    &self.cache
  }

  pub fn remote(&self) -> &Arc<R> {
    &self.remote
  }

  pub fn queue(&self) -> &MutationQueue<S> {
    &self.queue
  }

  pub fn connectivity(&self) -> &ConnectivityMonitor {
    &self.connectivity
  }

  pub fn settings(&self) -> &SyncSettings {
    &self.settings
  }

  pub fn is_online(&self) -> bool {
    self.connectivity.is_online()
  }

  pub fn on_connectivity_change<F>(&self, callback: F) -> JoinHandle<()>
  where
    F: FnMut(bool) + Send + 'static,
  {
    self.connectivity.on_change(callback)
  }

  pub fn resource_state(&self, resource: &Resource) -> ResourceState {
    self
      .in_flight
      .lock()
      .ok()
      .and_then(|states| states.get(resource).copied())
      .unwrap_or(ResourceState::Idle)
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// The owner's full album.
  pub async fn get_entities(&self, owner_id: &str) -> Vec<Sticker> {
    self.load_entities(owner_id).await.data
  }

  /// The owner's full album, with where it came from.
  pub async fn load_entities(&self, owner_id: &str) -> CacheResult<Vec<Sticker>> {
    self.mark_active(owner_id);
    let resource = Resource::Entities {
      owner_id: owner_id.to_string(),
    };

    self
      .read(
        &resource,
        self.settings.entity_max_age,
        || self.refresh_entities(owner_id),
        || self.album_with_pending(owner_id, default_album(self.settings.album_size)),
      )
      .await
  }

  /// A friend's album, read-only.
  pub async fn get_connection_entities(&self, owner_id: &str, friend_id: &str) -> Vec<Sticker> {
    let resource = Resource::ConnectionEntities {
      owner_id: owner_id.to_string(),
      friend_id: friend_id.to_string(),
    };

    self
      .read(
        &resource,
        self.settings.entity_max_age,
        || self.refresh_connection_entities(owner_id, friend_id),
        || default_album(self.settings.album_size),
      )
      .await
      .data
  }

  /// Profiles of the owner's connections.
  pub async fn get_connections(&self, owner_id: &str) -> Vec<Profile> {
    let resource = Resource::Connections {
      owner_id: owner_id.to_string(),
    };

    self
      .read(
        &resource,
        self.settings.connections_max_age,
        || self.refresh_connections(owner_id),
        Vec::new,
      )
      .await
      .data
  }

  /// A profile, preferring the remote copy.
  pub async fn get_profile(&self, user_id: &str) -> Option<Profile> {
    self.load_profile(user_id).await.data
  }

  pub async fn load_profile(&self, user_id: &str) -> CacheResult<Option<Profile>> {
    let resource = Resource::Profile {
      user_id: user_id.to_string(),
    };

    self
      .read(
        &resource,
        self.settings.profile_max_age,
        || self.refresh_profile(user_id),
        || None,
      )
      .await
  }

  /// A photo recorded for a sticker, uploaded or not.
  pub fn get_asset(&self, owner_id: &str, entity_id: u32) -> Option<Asset> {
    let cached = self
      .cache
      .get_any_age::<CachedAsset>(collections::ASSETS, &collections::asset_key(owner_id, entity_id))?;
    let bytes = hex::decode(cached.data.data_hex).ok()?;
    Some(Asset {
      content_type: cached.data.content_type,
      bytes,
    })
  }

  async fn read<T, F, Fut>(
    &self,
    resource: &Resource,
    max_age: Duration,
    fetch: F,
    default: impl FnOnce() -> T,
  ) -> CacheResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    match resource.strategy() {
      ReadStrategy::CacheFirst => self.cache_first(resource, max_age, fetch, default).await,
      ReadStrategy::NetworkFirst => self.network_first(resource, fetch, default).await,
    }
  }

  /// Serve a fresh cache hit (refreshing behind it when online), else fetch.
  ///
  /// Expired records are not deleted on this path: offline they are still the
  /// best answer, and online they stay around as the fallback if the fetch fails.
  async fn cache_first<T, F, Fut>(
    &self,
    resource: &Resource,
    max_age: Duration,
    fetch: F,
    default: impl FnOnce() -> T,
  ) -> CacheResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    let online = self.connectivity.is_online();

    if let Some(record) = self
      .cache
      .get_any_age::<T>(resource.collection(), &resource.key())
    {
      let cached_at = record.cached_at();
      if !self.cache.is_stale(record.timestamp, max_age) {
        if online {
          self.spawn_refresh(resource.clone());
        }
        return CacheResult::from_cache(record.data, cached_at, online);
      }
      if !online {
        return CacheResult::offline(record.data, cached_at);
      }
      debug!(resource = %resource.description(), "cached value expired, refetching");
    } else if !online {
      debug!(resource = %resource.description(), "nothing cached while offline, using default");
      return CacheResult::fallback(default());
    }

    self.fetch_now(resource, fetch, default).await
  }

  /// Ask the remote first, falling back to whatever is cached.
  async fn network_first<T, F, Fut>(
    &self,
    resource: &Resource,
    fetch: F,
    default: impl FnOnce() -> T,
  ) -> CacheResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    if !self.connectivity.is_online() {
      return self.last_resort(resource, default);
    }
    self.fetch_now(resource, fetch, default).await
  }

  async fn fetch_now<T, F, Fut>(
    &self,
    resource: &Resource,
    fetch: F,
    default: impl FnOnce() -> T,
  ) -> CacheResult<T>
  where
    T: DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
  {
    let tracked = self.begin(resource, ResourceState::Fetching);
    let result = fetch().await;
    if tracked {
      self.finish(resource);
    }

    match result {
      Ok(data) => CacheResult::from_network(data),
      Err(e) => {
        warn!(resource = %resource.description(), error = %e, "fetch failed, serving cache");
        self.last_resort(resource, default)
      }
    }
  }

  /// Any cached value regardless of age, else `default`.
  fn last_resort<T: DeserializeOwned>(
    &self,
    resource: &Resource,
    default: impl FnOnce() -> T,
  ) -> CacheResult<T> {
    match self
      .cache
      .get_any_age::<T>(resource.collection(), &resource.key())
    {
      Some(record) => {
        let cached_at = record.cached_at();
        CacheResult::offline(record.data, cached_at)
      }
      None => {
        debug!(resource = %resource.description(), "nothing cached, using default");
        CacheResult::fallback(default())
      }
    }
  }

  // ==========================================================================
  // Refreshes: fetch from the remote and overwrite the cache
  // ==========================================================================

  /// Fetch the owner's album, re-apply queued writes and cache it.
  pub async fn refresh_entities(&self, owner_id: &str) -> RemoteResult<Vec<Sticker>> {
    let remote = self.remote.fetch_entities(owner_id).await?;
    let album = self.album_with_pending(owner_id, fill_album(self.settings.album_size, remote));
    self.store_album(owner_id, &album);
    Ok(album)
  }

  async fn refresh_connection_entities(
    &self,
    owner_id: &str,
    friend_id: &str,
  ) -> RemoteResult<Vec<Sticker>> {
    let remote = self.remote.fetch_entities(friend_id).await?;
    let album = fill_album(self.settings.album_size, remote);
    self.store(
      collections::CONNECTION_ENTITIES,
      &collections::connection_entities_key(owner_id, friend_id),
      owner_id,
      &album,
    );
    Ok(album)
  }

  async fn refresh_connections(&self, owner_id: &str) -> RemoteResult<Vec<Profile>> {
    let connections = self.remote.fetch_connections(owner_id).await?;
    self.store(
      collections::CONNECTIONS,
      &collections::connections_key(owner_id),
      owner_id,
      &connections,
    );
    Ok(connections)
  }

  async fn refresh_profile(&self, user_id: &str) -> RemoteResult<Option<Profile>> {
    let mut profile = self.remote.fetch_profile(user_id).await?;
    if let Some(profile) = profile.as_mut() {
      let now = self.now();
      for pending in self.pending_for(user_id) {
        if let Mutation::UpdateProfile { update } = &pending.mutation {
          profile.apply(update, now);
        }
      }
    }
    self.store(collections::PROFILES, user_id, user_id, &profile);
    Ok(profile)
  }

  async fn refresh(&self, resource: &Resource) -> RemoteResult<()> {
    match resource {
      Resource::Entities { owner_id } => self.refresh_entities(owner_id).await.map(|_| ()),
      Resource::ConnectionEntities {
        owner_id,
        friend_id,
      } => self
        .refresh_connection_entities(owner_id, friend_id)
        .await
        .map(|_| ()),
      Resource::Connections { owner_id } => self.refresh_connections(owner_id).await.map(|_| ()),
      Resource::Profile { user_id } => self.refresh_profile(user_id).await.map(|_| ()),
    }
  }

  /// Start a fire-and-forget refresh unless one is already running.
  fn spawn_refresh(&self, resource: Resource) {
    if !self.begin(&resource, ResourceState::BackgroundFetching) {
      debug!(resource = %resource.description(), "refresh already in flight");
      return;
    }

    let this = self.clone();
    let handle = tokio::spawn(async move {
      if let Err(e) = this.refresh(&resource).await {
        warn!(resource = %resource.description(), error = %e, "background refresh failed");
      }
      this.finish(&resource);
    });

    if let Ok(mut handles) = self.background.lock() {
      handles.retain(|h| !h.is_finished());
      handles.push(handle);
    }
  }

  /// Wait for every background refresh started so far.
  pub async fn wait_background(&self) {
    loop {
      let handles: Vec<JoinHandle<()>> = match self.background.lock() {
        Ok(mut handles) => handles.drain(..).collect(),
        Err(_) => return,
      };
      if handles.is_empty() {
        return;
      }
      for handle in handles {
        let _ = handle.await;
      }
    }
  }

  fn begin(&self, resource: &Resource, state: ResourceState) -> bool {
    match self.in_flight.lock() {
      Ok(mut states) => {
        if states.contains_key(resource) {
          false
        } else {
          states.insert(resource.clone(), state);
          true
        }
      }
      Err(_) => true,
    }
  }

  fn finish(&self, resource: &Resource) {
    if let Ok(mut states) = self.in_flight.lock() {
      states.remove(resource);
    }
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Record a sticker change.
  pub async fn update_entity(&self, owner_id: &str, mut entity: Sticker) -> WriteOutcome {
    entity.stamp(self.now());
    let entity_id = entity.id;
    let mutation = Mutation::UpsertEntity {
      entity: entity.clone(),
    };
    let _stream = self.lock_stream(mutation.stream_key(owner_id)).await;

    let previous = self.edit_album(owner_id, |album| {
      let previous = slot(album, entity_id);
      merge_entity(album, entity);
      previous
    });

    let outcome = self.write_through(owner_id, mutation).await;
    if matches!(outcome, WriteOutcome::Rejected { .. }) {
      self.restore_slot(owner_id, entity_id, previous);
    }
    outcome
  }

  /// Return a sticker to uncollected.
  pub async fn delete_entity(&self, owner_id: &str, entity_id: u32) -> WriteOutcome {
    let mutation = Mutation::DeleteEntity { entity_id };
    let _stream = self.lock_stream(mutation.stream_key(owner_id)).await;

    let size = self.settings.album_size;
    let previous = self.edit_album(owner_id, |album| {
      let previous = slot(album, entity_id);
      reset_entity(album, size, entity_id);
      previous
    });

    let outcome = self.write_through(owner_id, mutation).await;
    if matches!(outcome, WriteOutcome::Rejected { .. }) {
      self.restore_slot(owner_id, entity_id, previous);
    }
    outcome
  }

  /// Edit a profile.
  ///
  /// The cached profile is only updated optimistically if one is cached.
  pub async fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> WriteOutcome {
    let mutation = Mutation::UpdateProfile {
      update: update.clone(),
    };
    let _stream = self.lock_stream(mutation.stream_key(user_id)).await;

    let previous = self.cached_profile(user_id);
    if let Some(mut profile) = previous.clone() {
      profile.apply(&update, self.now());
      self.store(collections::PROFILES, user_id, user_id, &Some(profile));
    }

    let outcome = self.write_through(user_id, mutation).await;
    if let (WriteOutcome::Rejected { .. }, Some(previous)) = (&outcome, previous) {
      self.revert_profile(user_id, &update, previous);
    }
    outcome
  }

  /// Attach a photo to a sticker, collecting it.
  pub async fn upload_asset(&self, owner_id: &str, entity_id: u32, asset: Asset) -> WriteOutcome {
    let mutation = Mutation::upload(entity_id, &asset);
    let _stream = self.lock_stream(mutation.stream_key(owner_id)).await;

    let asset_key = collections::asset_key(owner_id, entity_id);
    self.store(
      collections::ASSETS,
      &asset_key,
      owner_id,
      &CachedAsset {
        content_type: asset.content_type.clone(),
        data_hex: hex::encode(&asset.bytes),
      },
    );

    let now = self.now();
    let previous = self.edit_album(owner_id, |album| {
      let previous = slot(album, entity_id);
      mark_collected(album, entity_id, now);
      previous
    });

    let outcome = self.write_through(owner_id, mutation).await;
    if matches!(outcome, WriteOutcome::Rejected { .. }) {
      self.restore_slot(owner_id, entity_id, previous);
      if let Err(e) = self.cache.delete(collections::ASSETS, &asset_key) {
        warn!(key = %asset_key, error = %e, "failed to drop rejected asset");
      }
    }
    outcome
  }

  /// Wait for earlier writes in `stream` to finish, then hold it.
  async fn lock_stream(&self, stream: String) -> OwnedMutexGuard<()> {
    let lock = match self.streams.lock() {
      Ok(mut streams) => Arc::clone(streams.entry(stream).or_default()),
      Err(_) => Arc::new(AsyncMutex::new(())),
    };
    lock.lock_owned().await
  }

  /// Undo a rejected write to one slot, keeping the rest of the album as it is now.
  fn restore_slot(&self, owner_id: &str, entity_id: u32, previous: Option<Sticker>) {
    let size = self.settings.album_size;
    self.edit_album(owner_id, |album| match previous {
      Some(sticker) => merge_entity(album, sticker),
      None => reset_entity(album, size, entity_id),
    });
  }

  /// Put back only the fields a rejected update touched.
  fn revert_profile(&self, user_id: &str, update: &ProfileUpdate, previous: Profile) {
    let Some(mut profile) = self.cached_profile(user_id) else {
      return;
    };
    if update.username.is_some() {
      profile.username = previous.username;
    }
    if update.full_name.is_some() {
      profile.full_name = previous.full_name;
    }
    if update.avatar_url.is_some() {
      profile.avatar_url = previous.avatar_url;
    }
    profile.updated_at = previous.updated_at;
    self.store(collections::PROFILES, user_id, user_id, &Some(profile));
  }

  /// Try the remote now unless that would overtake an earlier queued write.
  ///
  /// Callers hold the mutation's stream lock.
  async fn write_through(&self, owner_id: &str, mutation: Mutation) -> WriteOutcome {
    if !self.connectivity.is_online() {
      return self.defer(owner_id, mutation);
    }

    let stream = mutation.stream_key(owner_id);
    if self.pending_for(owner_id).iter().any(|m| m.stream_key() == stream) {
      debug!(stream = %stream, "earlier write still queued, queueing behind it");
      return self.defer(owner_id, mutation);
    }

    match self.apply(owner_id, &mutation).await {
      Ok(()) => WriteOutcome::Synced,
      Err(e) if e.is_transient() => {
        debug!(owner_id, error = %e, "remote write failed, queueing");
        self.defer(owner_id, mutation)
      }
      Err(e) => {
        warn!(owner_id, kind = mutation.kind().as_str(), error = %e, "remote rejected write");
        WriteOutcome::Rejected {
          reason: e.to_string(),
        }
      }
    }
  }

  fn defer(&self, owner_id: &str, mutation: Mutation) -> WriteOutcome {
    let kind = mutation.kind();
    match self.queue.enqueue(owner_id, mutation) {
      Ok(_) => WriteOutcome::Queued,
      Err(e) => {
        error!(owner_id, kind = kind.as_str(), error = %e, "could not queue write, it will not reach the remote");
        WriteOutcome::Failed {
          reason: e.to_string(),
        }
      }
    }
  }

  /// Send one mutation to the remote and fold the confirmed result into the cache.
  async fn apply(&self, owner_id: &str, mutation: &Mutation) -> RemoteResult<()> {
    match mutation {
      Mutation::UpsertEntity { entity } => {
        let confirmed = self.remote.upsert_entity(owner_id, entity).await?;
        self.confirm_entity(owner_id, confirmed);
      }
      Mutation::DeleteEntity { entity_id } => {
        self.remote.delete_entity(owner_id, *entity_id).await?;
      }
      Mutation::UpdateProfile { update } => {
        let mut profile = self.remote.update_profile(owner_id, update).await?;
        let now = self.now();
        for pending in self.pending_for(owner_id) {
          if let Mutation::UpdateProfile { update: later } = &pending.mutation {
            if later != update {
              profile.apply(later, now);
            }
          }
        }
        self.store(collections::PROFILES, owner_id, owner_id, &Some(profile));
      }
      Mutation::UploadAsset { entity_id, .. } => {
        let asset = match mutation.asset() {
          Some(Ok(asset)) => asset,
          Some(Err(e)) => return Err(RemoteError::Invalid(e.to_string())),
          None => return Err(RemoteError::Invalid("upload without asset".to_string())),
        };
        let url = self
          .remote
          .upload_asset(owner_id, *entity_id, &asset)
          .await?;

        let mut entity = self
          .current_album(owner_id)
          .into_iter()
          .find(|s| s.id == *entity_id)
          .unwrap_or_else(|| Sticker::collected(*entity_id));
        entity.collected = true;
        entity.photo_url = Some(url);
        entity.stamp(self.now());

        let confirmed = self.remote.upsert_entity(owner_id, &entity).await?;
        self.confirm_entity(owner_id, confirmed);
      }
    }
    Ok(())
  }

  fn confirm_entity(&self, owner_id: &str, confirmed: Sticker) {
    self.edit_album(owner_id, |album| {
      merge_entity(album, confirmed);
      *album = self.album_with_pending(owner_id, std::mem::take(album));
    });
  }

  // ==========================================================================
  // Sync
  // ==========================================================================

  /// Replay the mutation queue against the remote.
  ///
  /// Does nothing while offline; every queued write is reported as deferred.
  pub async fn drain(&self) -> Result<DrainReport> {
    if !self.connectivity.is_online() {
      return Ok(DrainReport {
        deferred: self.queue.len()?,
        ..Default::default()
      });
    }

    let this = self.clone();
    self
      .queue
      .drain(move |pending| {
        let this = this.clone();
        async move { this.apply(&pending.owner_id, &pending.mutation).await }
      })
      .await
  }

  /// Drain the queue, then refresh every album read since startup.
  pub async fn sync_now(&self) -> Result<DrainReport> {
    let report = self.drain().await?;
    if self.connectivity.is_online() {
      self.refresh_active().await;
    }
    Ok(report)
  }

  async fn refresh_active(&self) {
    let owners: Vec<String> = match self.active_owners.lock() {
      Ok(owners) => owners.iter().cloned().collect(),
      Err(_) => return,
    };

    let results = join_all(owners.iter().map(|owner| self.refresh_entities(owner))).await;
    for (owner, result) in owners.iter().zip(results) {
      if let Err(e) = result {
        warn!(owner_id = %owner, error = %e, "refresh after sync failed");
      }
    }
  }

  /// Run sync in the background: on every offline to online transition and
  /// periodically while online with writes queued.
  pub fn spawn_auto_sync(&self) -> JoinHandle<()> {
    let this = self.clone();
    let mut rx = self.connectivity.subscribe();
    let period = if self.settings.sync_interval.is_zero() {
      warn!("sync interval is zero, using the default");
      SyncSettings::default().sync_interval
    } else {
      self.settings.sync_interval
    };

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      // Skip first immediate tick
      ticker.tick().await;

      let mut was_online = *rx.borrow_and_update();
      if was_online && !this.queue.is_empty().unwrap_or(true) {
        this.sync_logged().await;
      }

      loop {
        tokio::select! {
          changed = rx.changed() => {
            if changed.is_err() {
              break;
            }
            let online = *rx.borrow_and_update();
            if online && !was_online {
              info!("back online, syncing queued writes");
              this.sync_logged().await;
            } else if !online && was_online {
              info!("offline, writes will be queued");
            }
            was_online = online;
          }
          _ = ticker.tick() => {
            if this.connectivity.is_online() && !this.queue.is_empty().unwrap_or(true) {
              this.sync_logged().await;
            }
          }
        }
      }
    })
  }

  async fn sync_logged(&self) {
    match self.sync_now().await {
      Ok(report) if !report.is_complete() => {
        debug!(deferred = report.deferred, "some writes still queued");
      }
      Ok(_) => {}
      Err(e) => error!(error = %e, "sync failed"),
    }
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  fn now(&self) -> DateTime<Utc> {
    self.cache.clock().now()
  }

  fn mark_active(&self, owner_id: &str) {
    if let Ok(mut owners) = self.active_owners.lock() {
      owners.insert(owner_id.to_string());
    }
  }

  fn pending_for(&self, owner_id: &str) -> Vec<PendingMutation> {
    self.queue.pending_for_owner(owner_id).unwrap_or_else(|e| {
      warn!(owner_id, error = %e, "could not read mutation queue");
      Vec::new()
    })
  }

  /// The album as the owner last saw it, for optimistic edits.
  fn current_album(&self, owner_id: &str) -> Vec<Sticker> {
    match self
      .cache
      .get_any_age::<Vec<Sticker>>(collections::ENTITIES, &collections::entities_key(owner_id))
    {
      Some(record) => record.data,
      None => self.album_with_pending(owner_id, default_album(self.settings.album_size)),
    }
  }

  /// Read, change and store the cached album without racing other edits.
  fn edit_album<T>(&self, owner_id: &str, edit: impl FnOnce(&mut Vec<Sticker>) -> T) -> T {
    let _guard = self.album_edits.lock();
    let mut album = self.current_album(owner_id);
    let result = edit(&mut album);
    self.store_album(owner_id, &album);
    result
  }

  fn cached_profile(&self, user_id: &str) -> Option<Profile> {
    self
      .cache
      .get_any_age::<Option<Profile>>(collections::PROFILES, user_id)
      .and_then(|r| r.data)
  }

  /// Re-apply queued writes on top of `album`.
  fn album_with_pending(&self, owner_id: &str, mut album: Vec<Sticker>) -> Vec<Sticker> {
    for pending in self.pending_for(owner_id) {
      let queued_at = pending.queued_at();
      match pending.mutation {
        Mutation::UpsertEntity { entity } => merge_entity(&mut album, entity),
        Mutation::DeleteEntity { entity_id } => {
          reset_entity(&mut album, self.settings.album_size, entity_id)
        }
        Mutation::UploadAsset { entity_id, .. } => {
          mark_collected(&mut album, entity_id, queued_at)
        }
        Mutation::UpdateProfile { .. } => {}
      }
    }
    album
  }

  fn store_album(&self, owner_id: &str, album: &[Sticker]) {
    self.store(
      collections::ENTITIES,
      &collections::entities_key(owner_id),
      owner_id,
      &album,
    );
  }

  /// Best-effort cache write.
  fn store<T: Serialize>(&self, collection: &str, key: &str, owner_id: &str, data: &T) {
    if let Err(e) = self.cache.set_owned(collection, key, owner_id, data) {
      warn!(collection, key, error = %e, "cache write failed");
    }
  }
}

fn slot(album: &[Sticker], entity_id: u32) -> Option<Sticker> {
  album.iter().find(|s| s.id == entity_id).cloned()
}

fn mark_collected(album: &mut Vec<Sticker>, entity_id: u32, now: DateTime<Utc>) {
  if album.iter().any(|s| s.id == entity_id && s.collected) {
    return;
  }
  let mut sticker = Sticker::collected(entity_id);
  sticker.stamp(now);
  merge_entity(album, sticker);
}

impl<S: RecordStore, R: RemoteEndpoint> Clone for SyncOrchestrator<S, R> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      remote: Arc::clone(&self.remote),
      connectivity: self.connectivity.clone(),
      settings: Arc::clone(&self.settings),
      in_flight: Arc::clone(&self.in_flight),
      active_owners: Arc::clone(&self.active_owners),
      background: Arc::clone(&self.background),
      streams: Arc::clone(&self.streams),
      album_edits: Arc::clone(&self.album_edits),
    }
  }
}
