//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

/// A cached value for one logical resource.
///
/// Entries are written whole; a reader sees either nothing or a complete entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
  pub key: String,
  /// The last successfully fetched payload
  pub value: Value,
  pub stored_at: DateTime<Utc>,
  /// `stored_at + ttl`
  pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
  /// `stored_at + ttl`, saturating at the latest representable time so a very
  /// long TTL means "never expires" rather than an overflow.
  pub fn expiry(stored_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    stored_at
      .checked_add_signed(ttl)
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    now > self.expires_at
  }

  /// How long the entry has been expired; zero while still fresh.
  pub fn staleness_at(&self, now: DateTime<Utc>) -> Duration {
    (now - self.expires_at).max(Duration::zero())
  }
}

/// Per-key refresh behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshPolicy {
  /// How long a stored value is considered fresh
  pub ttl: Duration,
  /// Minimum staleness before a stale read schedules a background refresh
  pub background_window: Duration,
  /// Refresh on every read, blocking, for callers who must never see lag
  pub privileged_bypass: bool,
}

impl RefreshPolicy {
  pub fn new(ttl: Duration) -> Self {
    Self {
      ttl,
      ..Self::default()
    }
  }

  pub fn with_background_window(mut self, window: Duration) -> Self {
    self.background_window = window;
    self
  }

  pub fn privileged(mut self) -> Self {
    self.privileged_bypass = true;
    self
  }
}

impl Default for RefreshPolicy {
  fn default() -> Self {
    Self {
      ttl: Duration::minutes(10),
      background_window: Duration::zero(),
      privileged_bypass: false,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, expired; a background refresh may be running
  CacheStale,
  /// A forced refresh failed, serving cached data
  Offline,
}

impl CacheSource {
  /// Short label for the `x-cache` response header and logs.
  pub fn label(&self) -> &'static str {
    match self {
      CacheSource::Network => "MISS",
      CacheSource::CacheFresh => "HIT",
      CacheSource::CacheStale => "STALE",
      CacheSource::Offline => "OFFLINE",
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn entry(stored_at: DateTime<Utc>, ttl: Duration) -> CacheEntry {
    CacheEntry {
      key: "jobs".to_string(),
      value: json!([]),
      stored_at,
      expires_at: CacheEntry::expiry(stored_at, ttl),
    }
  }

  #[test]
  fn test_huge_ttl_saturates() {
    let now = Utc::now();
    let entry = entry(now, Duration::milliseconds(i64::MAX));

    assert_eq!(entry.expires_at, DateTime::<Utc>::MAX_UTC);
    assert!(!entry.is_expired_at(now + Duration::days(365 * 1000)));
  }

  #[test]
  fn test_expiry_boundary() {
    let now = Utc::now();
    let entry = entry(now, Duration::milliseconds(600_000));

    assert!(!entry.is_expired_at(now + Duration::milliseconds(599_999)));
    assert!(!entry.is_expired_at(now + Duration::milliseconds(600_000)));
    assert!(entry.is_expired_at(now + Duration::milliseconds(600_001)));
  }

  #[test]
  fn test_staleness() {
    let now = Utc::now();
    let entry = entry(now, Duration::seconds(10));

    assert_eq!(entry.staleness_at(now), Duration::zero());
    assert_eq!(
      entry.staleness_at(now + Duration::seconds(15)),
      Duration::seconds(5)
    );
  }

  #[test]
  fn test_policy_builders() {
    let policy = RefreshPolicy::new(Duration::seconds(30))
      .with_background_window(Duration::seconds(5))
      .privileged();
    assert_eq!(policy.ttl, Duration::seconds(30));
    assert_eq!(policy.background_window, Duration::seconds(5));
    assert!(policy.privileged_bypass);
  }
}
