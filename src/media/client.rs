use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use url::Url;

use crate::cache::{FeedSource, ItemSource};
use crate::config::{Config, ServerConfig};
use crate::media::types::{ItemsResponse, LibraryItem};

const TOKEN_HEADER: &str = "X-Emby-Token";

/// Fields requested on every item listing so creation times are present.
const ITEM_FIELDS: &str = "DateCreated";

/// Media server API client
#[derive(Clone)]
pub struct MediaServerClient {
  http: reqwest::Client,
  base: Url,
  user_id: String,
  token: String,
}

impl MediaServerClient {
  pub fn new(config: &Config) -> Result<Self> {
    let token = Config::get_api_token()?;
    Self::with_token(&config.server, token)
  }

  pub fn with_token(server: &ServerConfig, token: String) -> Result<Self> {
    // Url::join drops the last path segment unless the base ends with '/'
    let mut raw = server.url.clone();
    if !raw.ends_with('/') {
      raw.push('/');
    }
    let base = Url::parse(&raw).map_err(|e| eyre!("Invalid server url {}: {}", server.url, e))?;

    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      user_id: server.user_id.clone(),
      token,
    })
  }

  pub fn user_id(&self) -> &str {
    &self.user_id
  }

  /// Headers authorizing a request as the configured user.
  pub fn auth_headers(&self) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    let value =
      HeaderValue::from_str(&self.token).map_err(|e| eyre!("Invalid API token: {}", e))?;
    headers.insert(TOKEN_HEADER, value);
    Ok(headers)
  }

  fn endpoint(&self, path: &str) -> Result<Url> {
    self
      .base
      .join(path.trim_start_matches('/'))
      .map_err(|e| eyre!("Invalid endpoint {}: {}", path, e))
  }

  async fn get(&self, path: &str, query: &[(String, String)]) -> Result<reqwest::Response> {
    let url = self.endpoint(path)?;
    self
      .http
      .get(url)
      .headers(self.auth_headers()?)
      .query(query)
      .send()
      .await
      .map_err(|e| eyre!("Failed to request {}: {}", path, e))
  }

  /// GET a JSON document. `params` (a JSON object) becomes the query string.
  pub async fn fetch_json(&self, path: &str, params: &Value) -> Result<Value> {
    self
      .get(path, &query_pairs(params))
      .await?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse response from {}: {}", path, e))
  }

  /// GET a text document.
  pub async fn fetch_text(&self, path: &str) -> Result<String> {
    self
      .get(path, &[])
      .await?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} failed: {}", path, e))?
      .text()
      .await
      .map_err(|e| eyre!("Failed to read response from {}: {}", path, e))
  }

  /// Get a single item by id. A 404 is "not found", not an error.
  pub async fn get_item(&self, id: &str) -> Result<Option<LibraryItem>> {
    let path = format!("Users/{}/Items/{}", self.user_id, id);
    let response = self.get(&path, &[]).await?;

    if response.status() == StatusCode::NOT_FOUND {
      return Ok(None);
    }

    let item = response
      .error_for_status()
      .map_err(|e| eyre!("Failed to get item {}: {}", id, e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse item {}: {}", id, e))?;

    Ok(Some(item))
  }

  /// Get several items in one request.
  pub async fn get_items(&self, ids: &[String]) -> Result<Vec<LibraryItem>> {
    let path = format!("Users/{}/Items", self.user_id);
    let query = vec![
      ("Ids".to_string(), ids.join(",")),
      ("Fields".to_string(), ITEM_FIELDS.to_string()),
    ];

    let response: ItemsResponse = self
      .get(&path, &query)
      .await?
      .error_for_status()
      .map_err(|e| eyre!("Failed to get items: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse items: {}", e))?;

    Ok(response.items)
  }

  /// Newest items in the user's libraries.
  pub async fn latest_items(&self, limit: usize) -> Result<Vec<LibraryItem>> {
    let path = format!("Users/{}/Items/Latest", self.user_id);
    let query = vec![
      ("Limit".to_string(), limit.to_string()),
      ("Fields".to_string(), ITEM_FIELDS.to_string()),
    ];

    self
      .get(&path, &query)
      .await?
      .error_for_status()
      .map_err(|e| eyre!("Failed to get latest items: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse latest items: {}", e))
  }

  /// All items sorted by creation time, newest first.
  pub async fn recently_created_items(&self, limit: usize) -> Result<Vec<LibraryItem>> {
    let path = format!("Users/{}/Items", self.user_id);
    let query = vec![
      ("SortBy".to_string(), "DateCreated".to_string()),
      ("SortOrder".to_string(), "Descending".to_string()),
      ("Recursive".to_string(), "true".to_string()),
      ("Limit".to_string(), limit.to_string()),
      ("Fields".to_string(), ITEM_FIELDS.to_string()),
    ];

    let response: ItemsResponse = self
      .get(&path, &query)
      .await?
      .error_for_status()
      .map_err(|e| eyre!("Failed to list recent items: {}", e))?
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse recent items: {}", e))?;

    Ok(response.items)
  }
}

impl ItemSource for MediaServerClient {
  type Item = LibraryItem;

  fn fetch_one<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<LibraryItem>>> {
    self.get_item(id).boxed()
  }

  fn supports_bulk(&self) -> bool {
    true
  }

  fn fetch_many<'a>(&'a self, ids: &'a [String]) -> BoxFuture<'a, Result<Vec<LibraryItem>>> {
    self.get_items(ids).boxed()
  }
}

impl FeedSource for MediaServerClient {
  type Item = LibraryItem;

  fn latest(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LibraryItem>>> {
    self.latest_items(limit).boxed()
  }

  fn recently_created(&self, limit: usize) -> BoxFuture<'_, Result<Vec<LibraryItem>>> {
    self.recently_created_items(limit).boxed()
  }
}

/// Flatten a JSON object into query-string pairs. Strings are used as-is,
/// other scalars are rendered as JSON, `null` entries are skipped.
fn query_pairs(params: &Value) -> Vec<(String, String)> {
  let Value::Object(map) = params else {
    return Vec::new();
  };

  map
    .iter()
    .filter(|(_, v)| !v.is_null())
    .map(|(k, v)| {
      let rendered = match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
      };
      (k.clone(), rendered)
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn client(url: &str) -> MediaServerClient {
    let server = ServerConfig {
      url: url.to_string(),
      user_id: "u1".to_string(),
    };
    MediaServerClient::with_token(&server, "secret".to_string()).unwrap()
  }

  #[test]
  fn test_endpoint_keeps_base_path() {
    let client = client("https://media.example.com/jellyfin");
    assert_eq!(
      client.endpoint("/Users/u1/Items").unwrap().as_str(),
      "https://media.example.com/jellyfin/Users/u1/Items"
    );
  }

  #[test]
  fn test_auth_headers() {
    let headers = client("https://media.example.com").auth_headers().unwrap();
    assert_eq!(headers.get(TOKEN_HEADER).unwrap(), "secret");
  }

  #[test]
  fn test_query_pairs() {
    let pairs = query_pairs(&json!({ "UserId": "u1", "Limit": 10, "Skip": null }));
    assert_eq!(
      pairs,
      vec![
        ("Limit".to_string(), "10".to_string()),
        ("UserId".to_string(), "u1".to_string()),
      ]
    );
    assert!(query_pairs(&Value::Null).is_empty());
  }
}
