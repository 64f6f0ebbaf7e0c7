use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An item in the media library.
///
/// Only the fields the cache relies on are typed; everything else the server
/// sends is kept in `extra` and round-trips untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LibraryItem {
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(rename = "Type", default, skip_serializing_if = "Option::is_none")]
  pub item_type: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub date_created: Option<DateTime<Utc>>,
  #[serde(flatten)]
  pub extra: Map<String, Value>,
}

/// Paged listing as returned by the `Items` endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemsResponse {
  #[serde(default)]
  pub items: Vec<LibraryItem>,
}
