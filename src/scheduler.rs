//! Periodic background refresh for a known set of keys.
//!
//! The scheduler owns two timers: one for ordinary keys and a shorter one for
//! privileged keys. Nothing runs until `start` is called, and `stop` cancels
//! the timers without aborting refreshes that are already running.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::CacheConfig;

/// A zero period would make the timer spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Produces a fresh fetch of one key's value each time it is called.
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
  key: String,
  fetcher: Fetcher,
  privileged: bool,
}

pub struct RefreshScheduler<S: CacheStorage> {
  layer: CacheLayer<S>,
  interval: Duration,
  privileged_interval: Duration,
  registrations: Arc<Mutex<Vec<Registration>>>,
  timers: Vec<JoinHandle<()>>,
}

impl<S: CacheStorage + 'static> RefreshScheduler<S> {
  /// Intervals are raised to at least one millisecond.
  pub fn new(layer: CacheLayer<S>, interval: Duration, privileged_interval: Duration) -> Self {
    Self {
      layer,
      interval: interval.max(MIN_INTERVAL),
      privileged_interval: privileged_interval.max(MIN_INTERVAL),
      registrations: Arc::new(Mutex::new(Vec::new())),
      timers: Vec::new(),
    }
  }

  pub fn from_config(layer: CacheLayer<S>, config: &CacheConfig) -> Self {
    Self::new(
      layer,
      config.refresh_interval(),
      config.privileged_refresh_interval(),
    )
  }

  pub fn layer(&self) -> &CacheLayer<S> {
    &self.layer
  }

  /// Refresh `key` on the regular cadence.
  pub fn register(&self, key: &str, fetcher: Fetcher) -> Result<()> {
    self.add(key, fetcher, false)
  }

  /// Refresh `key` on the short cadence; reads through the scheduler always
  /// go to the network.
  pub fn register_privileged(&self, key: &str, fetcher: Fetcher) -> Result<()> {
    self.add(key, fetcher, true)
  }

  fn add(&self, key: &str, fetcher: Fetcher, privileged: bool) -> Result<()> {
    let mut registrations = self
      .registrations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let registration = Registration {
      key: key.to_string(),
      fetcher,
      privileged,
    };
    match registrations.iter_mut().find(|r| r.key == key) {
      Some(existing) => *existing = registration,
      None => registrations.push(registration),
    }
    Ok(())
  }

  pub fn keys(&self) -> Vec<String> {
    self.snapshot(None).into_iter().map(|r| r.key).collect()
  }

  /// Start both timers. The first tick fires one interval from now.
  pub fn start(&mut self) {
    if self.is_running() {
      return;
    }

    info!(
      interval_ms = self.interval.as_millis() as u64,
      privileged_interval_ms = self.privileged_interval.as_millis() as u64,
      "Starting refresh scheduler"
    );
    self.timers.push(self.spawn_timer(self.interval, false));
    self.timers.push(self.spawn_timer(self.privileged_interval, true));
  }

  /// Cancel the timers. Refreshes already running finish and store their result.
  pub fn stop(&mut self) {
    if self.timers.is_empty() {
      return;
    }

    info!("Stopping refresh scheduler");
    for timer in self.timers.drain(..) {
      timer.abort();
    }
  }

  pub fn is_running(&self) -> bool {
    !self.timers.is_empty()
  }

  /// Refresh one registered key now and wait for it.
  pub async fn trigger(&self, key: &str) -> Result<Value> {
    let registration = self.registration(key)?;
    let fetcher = registration.fetcher;
    self.layer.force_refresh(key, move || fetcher()).await
  }

  /// Read a registered key, honouring its privileged flag.
  pub async fn read(&self, key: &str) -> Result<CacheResult<Value>> {
    let registration = self.registration(key)?;
    let mut policy = self.layer.policy().clone();
    if registration.privileged {
      policy = policy.privileged();
    }

    let fetcher = registration.fetcher;
    self.layer.read_with(key, &policy, move || fetcher()).await
  }

  /// Refresh every registered key concurrently.
  pub async fn refresh_all(&self) -> Vec<(String, Result<Value>)> {
    let registrations = self.snapshot(None);
    let refreshes = registrations.into_iter().map(|registration| {
      let layer = self.layer.clone();
      async move {
        let fetcher = registration.fetcher;
        let result = layer
          .force_refresh(&registration.key, move || fetcher())
          .await;
        (registration.key, result)
      }
    });
    join_all(refreshes).await
  }

  fn registration(&self, key: &str) -> Result<Registration> {
    self
      .snapshot(None)
      .into_iter()
      .find(|r| r.key == key)
      .ok_or_else(|| eyre!("Key '{}' is not registered", key))
  }

  fn snapshot(&self, privileged: Option<bool>) -> Vec<Registration> {
    registered(&self.registrations, privileged)
  }

  fn spawn_timer(&self, period: Duration, privileged: bool) -> JoinHandle<()> {
    let layer = self.layer.clone();
    let registrations = Arc::clone(&self.registrations);

    tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + period, period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        ticker.tick().await;
        let due = registered(&registrations, Some(privileged));
        debug!(privileged, keys = due.len(), "Scheduler tick");

        for registration in due {
          spawn_refresh(layer.clone(), registration);
        }
      }
    })
  }
}

impl<S: CacheStorage> Drop for RefreshScheduler<S> {
  fn drop(&mut self) {
    for timer in self.timers.drain(..) {
      timer.abort();
    }
  }
}

fn registered(
  registrations: &Mutex<Vec<Registration>>,
  privileged: Option<bool>,
) -> Vec<Registration> {
  let registrations = match registrations.lock() {
    Ok(list) => list,
    Err(poisoned) => poisoned.into_inner(),
  };
  registrations
    .iter()
    .filter(|r| privileged.map_or(true, |p| r.privileged == p))
    .cloned()
    .collect()
}

/// Run one refresh detached from the timer so a slow upstream never delays
/// the next tick. A refresh already running for the key is joined.
fn spawn_refresh<S: CacheStorage + 'static>(layer: CacheLayer<S>, registration: Registration) {
  tokio::spawn(async move {
    let Registration { key, fetcher, .. } = registration;
    match layer.force_refresh(&key, move || fetcher()).await {
      Ok(_) => debug!(key = %key, "Scheduled refresh complete"),
      Err(error) => warn!(key = %key, %error, "Scheduled refresh failed"),
    }
  });
}
