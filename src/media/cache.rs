//! Caching implementations for media library types.

use chrono::{DateTime, Utc};

use crate::cache::Cacheable;

use super::types::LibraryItem;

impl Cacheable for LibraryItem {
  fn cache_key(&self) -> String {
    self.id.clone()
  }

  fn created_at(&self) -> Option<DateTime<Utc>> {
    self.date_created
  }
}

/// Watch key for a user's libraries; each user has its own delta cursor.
pub fn library_watch_key(user_id: &str) -> String {
  format!("library:{}", user_id)
}
