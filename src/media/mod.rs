//! Media library server integration: HTTP client, item types and the cached
//! client built on the generic cache.

pub mod cache;
pub mod cached_client;
pub mod client;
pub mod types;

pub use cached_client::CachedMediaClient;
pub use client::MediaServerClient;
pub use types::LibraryItem;
