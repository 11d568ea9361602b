//! Cache layer that orchestrates caching logic with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::entry::{CacheEntry, CacheResult, RefreshPolicy};
use super::storage::CacheStorage;

/// Outcome of one network refresh, shared by everyone waiting on it.
/// Errors are flattened to strings because shared outputs must be `Clone`.
type RefreshOutcome = std::result::Result<Value, String>;

type SharedRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct InFlight {
  id: u64,
  refresh: SharedRefresh,
}

/// Cache layer that manages caching logic and network fetching.
///
/// Reads follow stale-while-revalidate: a fresh entry is returned as is, an
/// expired entry is returned immediately while a refresh runs in the
/// background, and only a cold key waits for the network. At most one refresh
/// per key is in flight; later callers join it.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  policy: RefreshPolicy,
  in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
  next_flight: Arc<AtomicU64>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self::from_shared(Arc::new(storage))
  }

  pub fn from_shared(storage: Arc<S>) -> Self {
    Self {
      storage,
      policy: RefreshPolicy::default(),
      in_flight: Arc::new(Mutex::new(HashMap::new())),
      next_flight: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Set the default policy used by `read` and `force_refresh`.
  pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn policy(&self) -> &RefreshPolicy {
    &self.policy
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Read a key with the default policy.
  pub async fn read<F, Fut>(&self, key: &str, fetcher: F) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let policy = self.policy.clone();
    self.read_with(key, &policy, fetcher).await
  }

  /// Read a key.
  ///
  /// 1. Privileged policy - refresh now, fall back to cache if that fails
  /// 2. No entry - fetch from network and wait (cold start)
  /// 3. Fresh entry - return immediately
  /// 4. Stale entry - return immediately, refresh in the background
  ///
  /// Only the cold start and privileged paths can fail.
  pub async fn read_with<F, Fut>(
    &self,
    key: &str,
    policy: &RefreshPolicy,
    fetcher: F,
  ) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let cached = self.cached(key);

    if policy.privileged_bypass {
      return match self.refresh(key, policy, fetcher).await {
        Ok(value) => Ok(CacheResult::from_network(value)),
        Err(error) => match cached {
          Some(entry) => {
            warn!(key, %error, "Privileged refresh failed, serving cached value");
            Ok(CacheResult::offline(entry.value, entry.stored_at))
          }
          None => Err(eyre!("Failed to fetch {}: {}", key, error)),
        },
      };
    }

    let Some(entry) = cached else {
      debug!(key, "Cache miss, fetching");
      let value = self
        .refresh(key, policy, fetcher)
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", key, e))?;
      return Ok(CacheResult::from_network(value));
    };

    let now = self.storage.now();
    if !entry.is_expired_at(now) {
      debug!(key, "Cache hit");
      return Ok(CacheResult::from_cache(entry.value, entry.stored_at, false));
    }

    if entry.staleness_at(now) >= policy.background_window {
      debug!(key, "Serving stale value, refreshing in background");
      // Dropping the handle does not cancel the refresh; it is already spawned
      drop(self.refresh(key, policy, fetcher));
    } else {
      debug!(key, "Serving stale value inside background window");
    }

    Ok(CacheResult::from_cache(entry.value, entry.stored_at, true))
  }

  /// Fetch from the network now with the default policy.
  pub async fn force_refresh<F, Fut>(&self, key: &str, fetcher: F) -> Result<Value>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let policy = self.policy.clone();
    self.force_refresh_with(key, &policy, fetcher).await
  }

  /// Fetch from the network now, waiting for the result.
  ///
  /// On success the stored entry is replaced. On failure the error is returned
  /// and the stored entry is left untouched.
  pub async fn force_refresh_with<F, Fut>(
    &self,
    key: &str,
    policy: &RefreshPolicy,
    fetcher: F,
  ) -> Result<Value>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    self
      .refresh(key, policy, fetcher)
      .await
      .map_err(|e| eyre!("Failed to refresh {}: {}", key, e))
  }

  /// Whether a refresh for `key` is currently running.
  pub fn is_refreshing(&self, key: &str) -> bool {
    self
      .in_flight
      .lock()
      .map(|map| map.contains_key(key))
      .unwrap_or(false)
  }

  /// Wait for the in-flight refresh of `key`, if any, to finish.
  pub async fn settle(&self, key: &str) {
    let refresh = self
      .in_flight
      .lock()
      .ok()
      .and_then(|map| map.get(key).map(|f| f.refresh.clone()));

    if let Some(refresh) = refresh {
      let _ = refresh.await;
    }
  }

  pub fn clear(&self, key: &str) -> Result<()> {
    self.storage.clear(key)
  }

  pub fn clear_all(&self) -> Result<()> {
    self.storage.clear_all()
  }

  /// Look up a key, treating storage failures as a miss.
  fn cached(&self, key: &str) -> Option<CacheEntry> {
    match self.storage.get(key) {
      Ok(entry) => entry,
      Err(error) => {
        warn!(key, %error, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Join the running refresh for `key`, or start one.
  ///
  /// A started refresh is spawned, so it runs to completion and writes its
  /// result even if every caller stops waiting.
  fn refresh<F, Fut>(&self, key: &str, policy: &RefreshPolicy, fetcher: F) -> SharedRefresh
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let mut in_flight = match self.in_flight.lock() {
      Ok(map) => map,
      Err(poisoned) => poisoned.into_inner(),
    };

    if let Some(running) = in_flight.get(key) {
      debug!(key, "Joining in-flight refresh");
      return running.refresh.clone();
    }

    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
    let storage = Arc::clone(&self.storage);
    let registry = Arc::clone(&self.in_flight);
    let owned_key = key.to_string();
    let ttl = policy.ttl;

    let work_key = owned_key.clone();
    let work = async move {
      match fetcher().await {
        Ok(value) => {
          if let Err(error) = storage.set(&work_key, &value, ttl) {
            warn!(key = %work_key, %error, "Failed to store refreshed value");
          }
          Ok(value)
        }
        Err(error) => {
          warn!(key = %work_key, error = %format!("{:#}", error), "Refresh failed");
          Err(format!("{:#}", error))
        }
      }
    };

    let refresh = async move {
      // A panicking fetch is reported as a failed refresh so the key is released
      let outcome = AssertUnwindSafe(work)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
          let message = panic_message(panic.as_ref());
          warn!(key = %owned_key, panic = %message, "Refresh panicked");
          Err(format!("Refresh panicked: {}", message))
        });

      let mut map = match registry.lock() {
        Ok(map) => map,
        Err(poisoned) => poisoned.into_inner(),
      };
      if map.get(&owned_key).is_some_and(|f| f.id == id) {
        map.remove(&owned_key);
      }
      drop(map);

      outcome
    }
    .boxed()
    .shared();

    in_flight.insert(
      key.to_string(),
      InFlight {
        id,
        refresh: refresh.clone(),
      },
    );
    drop(in_flight);

    tokio::spawn(refresh.clone());
    refresh
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      policy: self.policy.clone(),
      in_flight: Arc::clone(&self.in_flight),
      next_flight: Arc::clone(&self.next_flight),
    }
  }
}
