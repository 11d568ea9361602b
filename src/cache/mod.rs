//! Stale-while-revalidate caching layer.
//!
//! This module provides a transport-agnostic cache that:
//! - Persists `(value, expiry)` entries per key so data survives restarts
//! - Serves fresh entries without touching the network
//! - Serves expired entries immediately and refreshes them in the background
//! - Runs at most one refresh per key at a time (single-flight)
//! - Never evicts a cached value because a refresh failed

mod clock;
mod entry;
mod layer;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{CacheEntry, CacheResult, CacheSource, RefreshPolicy};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
