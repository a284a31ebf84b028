//! Domain types shared by the cache, the queue and the remote endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of stickers in a complete album.
pub const DEFAULT_ALBUM_SIZE: u32 = 200;

/// A single numbered sticker in an owner's album.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sticker {
  pub id: u32,
  pub collected: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub photo_url: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date_collected: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
}

impl Sticker {
  /// The placeholder used for album slots the owner has not collected.
  pub fn uncollected(id: u32) -> Self {
    Self {
      id,
      collected: false,
      photo_url: None,
      date_collected: None,
      notes: None,
    }
  }

  /// A collected sticker. The collection date is stamped when the write is recorded.
  pub fn collected(id: u32) -> Self {
    Self {
      id,
      collected: true,
      photo_url: None,
      date_collected: None,
      notes: None,
    }
  }

  /// Fill in the collection date of a collected sticker that has none.
  pub fn stamp(&mut self, now: DateTime<Utc>) {
    if self.collected && self.date_collected.is_none() {
      self.date_collected = Some(now.to_rfc3339());
    }
  }

  pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
    self.notes = Some(notes.into());
    self
  }
}

/// Build an album with every slot uncollected.
pub fn default_album(size: u32) -> Vec<Sticker> {
  (1..=size).map(Sticker::uncollected).collect()
}

/// Overlay `entities` on a default album of `size` slots.
///
/// Slots the caller does not provide stay uncollected. Entities with ids
/// outside the album range are kept so remote data is never dropped.
pub fn fill_album(size: u32, entities: impl IntoIterator<Item = Sticker>) -> Vec<Sticker> {
  let mut album = default_album(size);
  for entity in entities {
    merge_entity(&mut album, entity);
  }
  album
}

/// Replace the sticker with the same id, or insert it keeping id order.
pub fn merge_entity(album: &mut Vec<Sticker>, entity: Sticker) {
  match album.binary_search_by_key(&entity.id, |s| s.id) {
    Ok(pos) => album[pos] = entity,
    Err(pos) => album.insert(pos, entity),
  }
}

/// Return a slot to its uncollected default.
///
/// Ids beyond the album size have no default and are removed outright.
pub fn reset_entity(album: &mut Vec<Sticker>, size: u32, entity_id: u32) {
  if let Ok(pos) = album.binary_search_by_key(&entity_id, |s| s.id) {
    if entity_id >= 1 && entity_id <= size {
      album[pos] = Sticker::uncollected(entity_id);
    } else {
      album.remove(pos);
    }
  }
}

/// Collected / missing counts for an album.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlbumSummary {
  pub total: usize,
  pub collected: usize,
  pub missing: usize,
}

impl AlbumSummary {
  pub fn of(album: &[Sticker]) -> Self {
    let collected = album.iter().filter(|s| s.collected).count();
    Self {
      total: album.len(),
      collected,
      missing: album.len() - collected,
    }
  }
}

/// A user profile as stored by the hosted database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
  pub id: String,
  pub username: String,
  #[serde(default)]
  pub full_name: Option<String>,
  #[serde(default)]
  pub avatar_url: Option<String>,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub updated_at: String,
}

impl Profile {
  /// Apply a partial update in place, as made at `now`.
  pub fn apply(&mut self, update: &ProfileUpdate, now: DateTime<Utc>) {
    if let Some(username) = &update.username {
      self.username = username.clone();
    }
    if let Some(full_name) = &update.full_name {
      self.full_name = Some(full_name.clone());
    }
    if let Some(avatar_url) = &update.avatar_url {
      self.avatar_url = Some(avatar_url.clone());
    }
    self.updated_at = now.to_rfc3339();
  }
}

/// Partial profile edit; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub username: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub full_name: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub avatar_url: Option<String>,
}

/// A photo attached to a sticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
  pub content_type: String,
  pub bytes: Vec<u8>,
}

impl Asset {
  pub fn jpeg(bytes: Vec<u8>) -> Self {
    Self {
      content_type: "image/jpeg".to_string(),
      bytes,
    }
  }

  /// Hex SHA-256 of the asset bytes.
  pub fn digest(&self) -> String {
    hex::encode(Sha256::digest(&self.bytes))
  }

  /// Storage path for an owner's sticker photo.
  pub fn object_path(owner_id: &str, entity_id: u32) -> String {
    format!("{}/stickers/{}", owner_id, entity_id)
  }
}
