//! Serde types matching the hosted database's REST responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::{Deserialize, Serialize};

use crate::model::Sticker;

// ============================================================================
// Sticker rows
// ============================================================================

/// A row of the `stickers` table.
#[derive(Debug, Deserialize)]
pub struct ApiSticker {
  pub sticker_number: u32,
  #[serde(default)]
  pub collected: bool,
  pub photo_url: Option<String>,
  pub notes: Option<String>,
  pub date_collected: Option<String>,
}

impl ApiSticker {
  pub fn into_sticker(self) -> Sticker {
    Sticker {
      id: self.sticker_number,
      collected: self.collected,
      photo_url: self.photo_url,
      date_collected: self.date_collected,
      notes: self.notes,
    }
  }
}

/// Body for inserting or merging a `stickers` row.
#[derive(Debug, Serialize)]
pub struct ApiStickerUpsert<'a> {
  pub user_id: &'a str,
  pub sticker_number: u32,
  pub collected: bool,
  pub photo_url: Option<&'a str>,
  pub notes: Option<&'a str>,
  pub date_collected: Option<&'a str>,
}

impl<'a> ApiStickerUpsert<'a> {
  pub fn new(owner_id: &'a str, sticker: &'a Sticker) -> Self {
    Self {
      user_id: owner_id,
      sticker_number: sticker.id,
      collected: sticker.collected,
      photo_url: sticker.photo_url.as_deref(),
      notes: sticker.notes.as_deref(),
      date_collected: sticker.date_collected.as_deref(),
    }
  }
}

// ============================================================================
// Connections
// ============================================================================

/// A row of the `user_connections` table, projected to the other side.
#[derive(Debug, Deserialize)]
pub struct ApiConnection {
  pub connected_user_id: String,
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by the table API or the object storage API.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
  pub message: Option<String>,
  pub error: Option<String>,
  pub details: Option<String>,
}

impl ApiErrorBody {
  /// Best human-readable message from an error response body.
  pub fn describe(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
      Ok(parsed) => {
        let mut parts: Vec<String> = [parsed.message, parsed.error, parsed.details]
          .into_iter()
          .flatten()
          .collect();
        parts.dedup();
        if parts.is_empty() {
          body.trim().to_string()
        } else {
          parts.join(": ")
        }
      }
      Err(_) => body.trim().to_string(),
    }
  }
}
