//! Tiered client-side cache for media library records.
//!
//! [`cache`] holds the generic machinery (stores, single-flight and batch
//! fetchers, delta watcher); [`media`] wires it to a media server.

pub mod cache;
pub mod config;
pub mod media;
