//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;

/// Trait for cache storage backends.
///
/// Storage is synchronous; every write replaces a whole entry.
pub trait CacheStorage: Send + Sync {
  /// Time source used for `stored_at` and expiry checks.
  fn clock(&self) -> &dyn Clock;

  /// Get the entry for a key. Unreadable entries are reported as absent.
  fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

  /// Store a value that expires `ttl` from now.
  fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<CacheEntry>;

  /// Remove one entry.
  fn clear(&self, key: &str) -> Result<()>;

  /// Remove every entry.
  fn clear_all(&self) -> Result<()>;

  fn now(&self) -> DateTime<Utc> {
    self.clock().now()
  }

  fn is_expired(&self, entry: &CacheEntry) -> bool {
    entry.is_expired_at(self.now())
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
#[derive(Debug, Default)]
pub struct NoopStorage {
  clock: SystemClock,
}

impl CacheStorage for NoopStorage {
  fn clock(&self) -> &dyn Clock {
    &self.clock
  }

  fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<CacheEntry> {
    // Discard, but report what would have been stored
    let now = self.now();
    Ok(CacheEntry {
      key: key.to_string(),
      value: value.clone(),
      stored_at: now,
      expires_at: CacheEntry::expiry(now, ttl),
    })
  }

  fn clear(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    Ok(())
  }
}

/// Persisted form of an entry.
///
/// Older writers stored `{value, timestamp}` and checked the TTL themselves;
/// such entries are read as already expired at `timestamp`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum StoredDocument {
  #[serde(rename_all = "camelCase")]
  Current {
    value: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    stored_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    expires_at: DateTime<Utc>,
  },
  Legacy {
    value: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
  },
}

impl StoredDocument {
  fn into_entry(self, key: &str) -> CacheEntry {
    match self {
      StoredDocument::Current {
        value,
        stored_at,
        expires_at,
      } => CacheEntry {
        key: key.to_string(),
        value,
        stored_at,
        expires_at,
      },
      StoredDocument::Legacy { value, timestamp } => CacheEntry {
        key: key.to_string(),
        value,
        stored_at: timestamp,
        expires_at: timestamp,
      },
    }
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  clock: Arc<dyn Clock>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Create or open a SQLite storage at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;

    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
      clock: Arc::new(SystemClock),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Replace the time source.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("hubcache").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Number of stored entries, readable or not.
  pub fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;

    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  #[cfg(test)]
  fn write_raw(&self, key: &str, document: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries (cache_key, document, written_at)
       VALUES (?, ?, datetime('now'))",
      params![key, document],
    )?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One JSON document per key: {"value", "storedAt", "expiresAt"}
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_key TEXT PRIMARY KEY,
    document TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn clock(&self) -> &dyn Clock {
    self.clock.as_ref()
  }

  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    let conn = self.lock()?;

    let document: Option<String> = conn
      .query_row(
        "SELECT document FROM cache_entries WHERE cache_key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))?;

    let Some(document) = document else {
      return Ok(None);
    };

    match serde_json::from_str::<StoredDocument>(&document) {
      Ok(stored) => Ok(Some(stored.into_entry(key))),
      Err(error) => {
        warn!(key, %error, "Ignoring unreadable cache entry");
        Ok(None)
      }
    }
  }

  fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<CacheEntry> {
    let stored_at = self.now();
    let expires_at = CacheEntry::expiry(stored_at, ttl);

    let document = serde_json::to_string(&StoredDocument::Current {
      value: value.clone(),
      stored_at,
      expires_at,
    })
    .map_err(|e| eyre!("Failed to serialize cache entry {}: {}", key, e))?;

    let conn = self.lock()?;

    // Single statement, so the replace is atomic
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (cache_key, document, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, document],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(CacheEntry {
      key: key.to_string(),
      value: value.clone(),
      stored_at,
      expires_at,
    })
  }

  fn clear(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute(
        "DELETE FROM cache_entries WHERE cache_key = ?",
        params![key],
      )
      .map_err(|e| eyre!("Failed to clear cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn clear_all(&self) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("DELETE FROM cache_entries", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;

    Ok(())
  }
}

impl<S: CacheStorage + ?Sized> CacheStorage for Arc<S> {
  fn clock(&self) -> &dyn Clock {
    (**self).clock()
  }

  fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<CacheEntry> {
    (**self).set(key, value, ttl)
  }

  fn clear(&self, key: &str) -> Result<()> {
    (**self).clear(key)
  }

  fn clear_all(&self) -> Result<()> {
    (**self).clear_all()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use serde_json::json;

  fn storage() -> (SqliteStorage, ManualClock) {
    let clock = ManualClock::default();
    let storage = SqliteStorage::open_in_memory()
      .unwrap()
      .with_clock(Arc::new(clock.clone()));
    (storage, clock)
  }

  #[test]
  fn test_get_missing() {
    let (storage, _) = storage();
    assert!(storage.get("jobs").unwrap().is_none());
  }

  #[test]
  fn test_set_then_get() {
    let (storage, clock) = storage();
    let data = json!([{"id": 1, "region": ["UK"]}]);

    let written = storage
      .set("jobs", &data, Duration::milliseconds(600_000))
      .unwrap();
    assert_eq!(written.stored_at, clock.now());
    assert_eq!(
      written.expires_at,
      clock.now() + Duration::milliseconds(600_000)
    );

    let read = storage.get("jobs").unwrap().unwrap();
    assert_eq!(read.value, data);
    assert_eq!(read.key, "jobs");
    // Millisecond precision survives the round trip
    assert_eq!(
      read.expires_at.timestamp_millis(),
      written.expires_at.timestamp_millis()
    );
  }

  #[test]
  fn test_set_replaces_whole_entry() {
    let (storage, clock) = storage();
    storage
      .set("jobs", &json!({"v": 1}), Duration::seconds(10))
      .unwrap();
    clock.advance(Duration::seconds(5));
    storage
      .set("jobs", &json!({"v": 2}), Duration::seconds(10))
      .unwrap();

    let read = storage.get("jobs").unwrap().unwrap();
    assert_eq!(read.value, json!({"v": 2}));
    assert_eq!(
      read.stored_at.timestamp_millis(),
      clock.now().timestamp_millis()
    );
    assert_eq!(storage.len().unwrap(), 1);
  }

  #[test]
  fn test_is_expired_follows_clock() {
    let (storage, clock) = storage();
    let entry = storage
      .set("jobs", &json!(1), Duration::milliseconds(600_000))
      .unwrap();

    clock.advance(Duration::milliseconds(599_999));
    assert!(!storage.is_expired(&entry));
    clock.advance(Duration::milliseconds(2));
    assert!(storage.is_expired(&entry));
  }

  #[test]
  fn test_huge_ttl_never_expires() {
    let (storage, clock) = storage();
    storage
      .set("jobs", &json!(1), Duration::milliseconds(i64::MAX))
      .unwrap();

    clock.advance(Duration::days(365 * 1000));
    let entry = storage.get("jobs").unwrap().unwrap();
    assert_eq!(entry.value, json!(1));
    assert!(!storage.is_expired(&entry));
  }

  #[test]
  fn test_corrupted_entry_is_a_miss() {
    let (storage, _) = storage();
    storage.write_raw("jobs", "{not json").unwrap();
    assert!(storage.get("jobs").unwrap().is_none());

    storage.write_raw("books", r#"{"storedAt": 1}"#).unwrap();
    assert!(storage.get("books").unwrap().is_none());
  }

  #[test]
  fn test_legacy_layout_reads_as_expired() {
    let (storage, clock) = storage();
    let timestamp = clock.now().timestamp_millis();
    storage
      .write_raw(
        "articles",
        &format!(r#"{{"value": [1, 2], "timestamp": {}}}"#, timestamp),
      )
      .unwrap();

    let entry = storage.get("articles").unwrap().unwrap();
    assert_eq!(entry.value, json!([1, 2]));
    assert_eq!(entry.expires_at.timestamp_millis(), timestamp);

    clock.advance(Duration::milliseconds(1));
    assert!(storage.is_expired(&entry));
  }

  #[test]
  fn test_clear_and_clear_all() {
    let (storage, _) = storage();
    storage.set("a", &json!(1), Duration::seconds(1)).unwrap();
    storage.set("b", &json!(2), Duration::seconds(1)).unwrap();

    storage.clear("a").unwrap();
    assert!(storage.get("a").unwrap().is_none());
    assert!(storage.get("b").unwrap().is_some());

    storage.clear_all().unwrap();
    assert!(storage.is_empty().unwrap());
  }

  #[test]
  fn test_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .set("jobs", &json!(["persisted"]), Duration::minutes(10))
        .unwrap();
    }

    let storage = SqliteStorage::open_at(&path).unwrap();
    let entry = storage.get("jobs").unwrap().unwrap();
    assert_eq!(entry.value, json!(["persisted"]));
    assert!(!storage.is_expired(&entry));
  }

  #[test]
  fn test_noop_storage_never_hits() {
    let storage = NoopStorage::default();
    storage.set("jobs", &json!(1), Duration::seconds(1)).unwrap();
    assert!(storage.get("jobs").unwrap().is_none());
  }
}
