//! The remote data endpoint: the hosted database that is the source of truth.

mod api_types;
mod client;

pub use client::RestRemote;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Asset, Profile, ProfileUpdate, Sticker};

/// Result type for remote operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by the remote endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// Network failure, timeout or a server-side error; worth retrying later.
  #[error("remote unavailable: {0}")]
  Transient(String),

  /// The endpoint refused the request; retrying it unchanged will not help.
  #[error("remote rejected request ({status}): {message}")]
  Rejected { status: u16, message: String },

  /// The response could not be understood.
  #[error("unexpected remote response: {0}")]
  Decode(String),

  /// The request could not be built from local data.
  #[error("invalid request: {0}")]
  Invalid(String),
}

impl RemoteError {
  /// Whether the failure should send the write to the mutation queue.
  pub fn is_transient(&self) -> bool {
    !matches!(self, RemoteError::Rejected { .. } | RemoteError::Invalid(_))
  }

  /// Classify an HTTP status code that is not a success.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      408 | 429 => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
      400..=499 => RemoteError::Rejected { status, message },
      _ => RemoteError::Transient(format!("HTTP {}: {}", status, message)),
    }
  }
}

/// CRUD operations against the hosted database, addressed by owner id.
///
/// Authorization and uniqueness are the endpoint's business.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync + 'static {
  /// Cheap reachability check used by the connectivity probe.
  async fn health(&self) -> RemoteResult<()>;

  /// All stickers the owner has recorded (not the full album).
  async fn fetch_entities(&self, owner_id: &str) -> RemoteResult<Vec<Sticker>>;

  /// Insert or update a sticker, returning the canonical record.
  async fn upsert_entity(&self, owner_id: &str, entity: &Sticker) -> RemoteResult<Sticker>;

  async fn delete_entity(&self, owner_id: &str, entity_id: u32) -> RemoteResult<()>;

  async fn fetch_profile(&self, user_id: &str) -> RemoteResult<Option<Profile>>;

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> RemoteResult<Profile>;

  /// Profiles of the owner's accepted connections.
  async fn fetch_connections(&self, owner_id: &str) -> RemoteResult<Vec<Profile>>;

  /// Store a photo and return its public URL.
  async fn upload_asset(&self, owner_id: &str, entity_id: u32, asset: &Asset)
    -> RemoteResult<String>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_classification() {
    assert!(RemoteError::from_status(503, "down").is_transient());
    assert!(RemoteError::from_status(500, "boom").is_transient());
    assert!(RemoteError::from_status(429, "slow down").is_transient());
    assert!(RemoteError::from_status(408, "timeout").is_transient());
    assert!(!RemoteError::from_status(400, "bad").is_transient());
    assert!(!RemoteError::from_status(403, "rls").is_transient());
    assert_eq!(
      RemoteError::from_status(409, "dup"),
      RemoteError::Rejected {
        status: 409,
        message: "dup".into()
      }
    );
  }

  #[test]
  fn decode_errors_are_retried() {
    assert!(RemoteError::Decode("truncated".into()).is_transient());
    assert!(!RemoteError::Invalid("corrupt asset".into()).is_transient());
  }
}
