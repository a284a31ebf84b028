//! REST client for the hosted database's table and object storage APIs.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{ApiConnection, ApiErrorBody, ApiSticker, ApiStickerUpsert};
use super::{RemoteEndpoint, RemoteError, RemoteResult};
use crate::config::{Config, RemoteConfig};
use crate::model::{Asset, Profile, ProfileUpdate, Sticker};

/// Object storage bucket holding sticker photos.
const PHOTO_BUCKET: &str = "stickers";

/// Remote endpoint backed by the hosted database's REST API.
#[derive(Clone)]
pub struct RestRemote {
  http: reqwest::Client,
  base: Url,
  anon_key: String,
  access_token: Option<String>,
}

impl RestRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url {}: {}", config.url, e))?;
    // Relative joins need a trailing slash
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let anon_key = match &config.anon_key {
      Some(key) => key.clone(),
      None => Config::get_anon_key()?,
    };

    Ok(Self {
      http,
      base,
      anon_key,
      access_token: None,
    })
  }

  /// Authenticate requests as a signed-in user instead of the anonymous role.
  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  fn url(&self, path: &str) -> RemoteResult<Url> {
    self
      .base
      .join(path)
      .map_err(|e| RemoteError::Invalid(format!("bad endpoint path {}: {}", path, e)))
  }

  fn table(&self, table: &str, filters: &[(&str, String)]) -> RemoteResult<Url> {
    let mut url = self.url(&format!("rest/v1/{}", table))?;
    {
      let mut query = url.query_pairs_mut();
      for (column, filter) in filters {
        query.append_pair(column, filter);
      }
    }
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
    self
      .http
      .request(method, url)
      .header("apikey", &self.anon_key)
      .header(header::AUTHORIZATION, format!("Bearer {}", bearer))
  }

  /// Send a request, turning transport failures and error statuses into [`RemoteError`]s.
  async fn send(&self, request: RequestBuilder) -> RemoteResult<Response> {
    let response = request
      .send()
      .await
      .map_err(|e| RemoteError::Transient(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(status = status.as_u16(), body = %body, "remote error response");
    Err(RemoteError::from_status(
      status.as_u16(),
      ApiErrorBody::describe(&body),
    ))
  }

  async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
    self
      .send(request)
      .await?
      .json::<T>()
      .await
      .map_err(|e| RemoteError::Decode(e.to_string()))
  }

  fn public_url(&self, path: &str) -> RemoteResult<String> {
    self
      .url(&format!("storage/v1/object/public/{}/{}", PHOTO_BUCKET, path))
      .map(String::from)
  }
}

fn eq(value: impl std::fmt::Display) -> String {
  format!("eq.{}", value)
}

#[async_trait]
impl RemoteEndpoint for RestRemote {
  async fn health(&self) -> RemoteResult<()> {
    let url = self.url("rest/v1/")?;
    self.send(self.request(Method::HEAD, url)).await.map(|_| ())
  }

  async fn fetch_entities(&self, owner_id: &str) -> RemoteResult<Vec<Sticker>> {
    let url = self.table(
      "stickers",
      &[
        ("select", "*".to_string()),
        ("user_id", eq(owner_id)),
        ("order", "sticker_number.asc".to_string()),
      ],
    )?;

    let rows: Vec<ApiSticker> = self.json(self.request(Method::GET, url)).await?;
    Ok(rows.into_iter().map(ApiSticker::into_sticker).collect())
  }

  async fn upsert_entity(&self, owner_id: &str, entity: &Sticker) -> RemoteResult<Sticker> {
    let url = self.table(
      "stickers",
      &[("on_conflict", "user_id,sticker_number".to_string())],
    )?;
    let body = [ApiStickerUpsert::new(owner_id, entity)];

    let rows: Vec<ApiSticker> = self
      .json(
        self
          .request(Method::POST, url)
          .header("Prefer", "resolution=merge-duplicates,return=representation")
          .json(&body),
      )
      .await?;

    rows
      .into_iter()
      .next()
      .map(ApiSticker::into_sticker)
      .ok_or_else(|| RemoteError::Decode("upsert returned no rows".to_string()))
  }

  async fn delete_entity(&self, owner_id: &str, entity_id: u32) -> RemoteResult<()> {
    let url = self.table(
      "stickers",
      &[("user_id", eq(owner_id)), ("sticker_number", eq(entity_id))],
    )?;
    self.send(self.request(Method::DELETE, url)).await.map(|_| ())
  }

  async fn fetch_profile(&self, user_id: &str) -> RemoteResult<Option<Profile>> {
    let url = self.table("profiles", &[("select", "*".to_string()), ("id", eq(user_id))])?;
    let rows: Vec<Profile> = self.json(self.request(Method::GET, url)).await?;
    Ok(rows.into_iter().next())
  }

  async fn update_profile(&self, user_id: &str, update: &ProfileUpdate) -> RemoteResult<Profile> {
    let url = self.table("profiles", &[("id", eq(user_id))])?;

    let rows: Vec<Profile> = self
      .json(
        self
          .request(Method::PATCH, url)
          .header("Prefer", "return=representation")
          .json(update),
      )
      .await?;

    rows.into_iter().next().ok_or_else(|| RemoteError::Rejected {
      status: 404,
      message: format!("profile {} not found", user_id),
    })
  }

  async fn fetch_connections(&self, owner_id: &str) -> RemoteResult<Vec<Profile>> {
    let url = self.table(
      "user_connections",
      &[
        ("select", "connected_user_id".to_string()),
        ("user_id", eq(owner_id)),
      ],
    )?;
    let connections: Vec<ApiConnection> = self.json(self.request(Method::GET, url)).await?;
    if connections.is_empty() {
      return Ok(Vec::new());
    }

    let ids: Vec<String> = connections.into_iter().map(|c| c.connected_user_id).collect();
    let url = self.table(
      "profiles",
      &[
        ("select", "*".to_string()),
        ("id", format!("in.({})", ids.join(","))),
      ],
    )?;
    self.json(self.request(Method::GET, url)).await
  }

  async fn upload_asset(
    &self,
    owner_id: &str,
    entity_id: u32,
    asset: &Asset,
  ) -> RemoteResult<String> {
    let path = Asset::object_path(owner_id, entity_id);
    let url = self.url(&format!("storage/v1/object/{}/{}", PHOTO_BUCKET, path))?;

    self
      .send(
        self
          .request(Method::POST, url)
          .header("x-upsert", "true")
          .header(header::CONTENT_TYPE, &asset.content_type)
          .body(asset.bytes.clone()),
      )
      .await?;

    self.public_url(&path)
  }
}
