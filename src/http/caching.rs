//! HTTP client that transparently routes matching reads through the cache.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{CACHE_CONTROL, PRAGMA};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheStorage, RefreshPolicy};
use crate::category::PayloadNormalizer;
use crate::config::InterceptConfig;

use super::client::{HttpClient, HttpRequest, HttpResponse};
use super::key::RequestKey;

/// Which requests are served from cache, and how a caller asks for a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptRule {
  /// Path fragment identifying the cached endpoint
  pub path_fragment: String,
  /// Query parameter that forces a refresh
  pub refresh_param: String,
}

impl InterceptRule {
  pub fn new(path_fragment: &str, refresh_param: &str) -> Self {
    Self {
      path_fragment: path_fragment.to_string(),
      refresh_param: refresh_param.to_string(),
    }
  }

  /// Read-only requests to the cached endpoint.
  pub fn matches(&self, request: &HttpRequest) -> bool {
    request.is_read_only() && request.url.path().contains(&self.path_fragment)
  }

  /// Whether the request carries a cache-busting marker: the refresh query
  /// parameter (unless set to `0` or `false`) or a `no-cache` directive.
  pub fn wants_refresh(&self, request: &HttpRequest) -> bool {
    let marker = request
      .url
      .query_pairs()
      .any(|(name, value)| name == self.refresh_param.as_str() && value != "0" && value != "false");

    let no_cache = [CACHE_CONTROL, PRAGMA].iter().any(|header| {
      request
        .headers
        .get_all(header)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains("no-cache"))
    });

    marker || no_cache
  }
}

impl From<&InterceptConfig> for InterceptRule {
  fn from(config: &InterceptConfig) -> Self {
    Self::new(&config.path_fragment, &config.refresh_param)
  }
}

/// HTTP client with transparent caching support.
///
/// This wraps another client and provides the same interface. Matching reads
/// are answered from the cache with a synthetic response; everything else,
/// and anything the cache fails to answer, goes to the wrapped client.
pub struct CachingClient<C, S: CacheStorage> {
  inner: Arc<C>,
  cache: CacheLayer<S>,
  rule: InterceptRule,
  normalizer: Option<Arc<PayloadNormalizer>>,
  policy: RefreshPolicy,
}

impl<C, S> CachingClient<C, S>
where
  C: HttpClient + 'static,
  S: CacheStorage + 'static,
{
  pub fn new(inner: C, cache: CacheLayer<S>, rule: InterceptRule) -> Self {
    Self::from_shared(Arc::new(inner), cache, rule)
  }

  pub fn from_shared(inner: Arc<C>, cache: CacheLayer<S>, rule: InterceptRule) -> Self {
    let policy = cache.policy().clone();
    Self {
      inner,
      cache,
      rule,
      normalizer: None,
      policy,
    }
  }

  /// Clean categorical fields of fetched payloads before they are cached.
  pub fn with_normalizer(mut self, normalizer: PayloadNormalizer) -> Self {
    self.normalizer = Some(Arc::new(normalizer));
    self
  }

  /// Refresh on every read, for callers that must never see lag.
  pub fn privileged(mut self) -> Self {
    self.policy.privileged_bypass = true;
    self
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn rule(&self) -> &InterceptRule {
    &self.rule
  }

  /// Storage key for a request.
  pub fn cache_key(&self, request: &HttpRequest) -> String {
    RequestKey::new(request, &self.rule.refresh_param).cache_hash()
  }

  /// Fetch a request's payload from the network, normalized and ready to cache.
  ///
  /// The cache-busting marker is stripped before sending. Non-success statuses
  /// are errors so they are never cached.
  pub fn fetch_payload(&self, request: &HttpRequest) -> BoxFuture<'static, Result<Value>> {
    let inner = Arc::clone(&self.inner);
    let normalizer = self.normalizer.clone();
    let key = RequestKey::new(request, &self.rule.refresh_param);
    let mut upstream = request.clone();
    upstream.url = key.upstream_url().clone();

    async move {
      let response = inner.send(upstream).await?;
      if !response.is_success() {
        return Err(eyre!("{} returned {}", key, response.status()));
      }

      let payload: Value = response.json()?;
      Ok::<_, color_eyre::Report>(match normalizer {
        Some(normalizer) => normalizer.normalize(payload),
        None => payload,
      })
    }
    .boxed()
  }

  async fn send_cached(&self, request: &HttpRequest) -> Result<HttpResponse> {
    let key = self.cache_key(request);
    let fetcher = {
      let fetch = self.fetch_payload(request);
      move || fetch
    };

    if self.rule.wants_refresh(request) {
      debug!(url = %request.url, "Forced refresh requested");
      let value = self
        .cache
        .force_refresh_with(&key, &self.policy, fetcher)
        .await?;
      return HttpResponse::from_json(&value, "REFRESH");
    }

    let result = self.cache.read_with(&key, &self.policy, fetcher).await?;
    debug!(url = %request.url, source = result.source.label(), "Served from cache layer");
    HttpResponse::from_json(&result.data, result.source.label())
  }
}

impl<C, S> HttpClient for CachingClient<C, S>
where
  C: HttpClient + 'static,
  S: CacheStorage + 'static,
{
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
    async move {
      if !self.rule.matches(&request) {
        return self.inner.send(request).await;
      }

      match self.send_cached(&request).await {
        Ok(response) => Ok(response),
        Err(error) => {
          warn!(
            url = %request.url,
            error = %format!("{:#}", error),
            "Cache layer failed, falling back to network"
          );
          self.inner.send(request).await
        }
      }
    }
    .boxed()
  }
}

impl<C, S: CacheStorage> Clone for CachingClient<C, S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
      cache: self.cache.clone(),
      rule: self.rule.clone(),
      normalizer: self.normalizer.clone(),
      policy: self.policy.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, ManualClock, SqliteStorage};
  use crate::category::Vocabulary;
  use crate::http::client::mock::{ok_json, MockHttpClient};
  use chrono::Duration;
  use reqwest::header::HeaderMap;
  use reqwest::{Method, StatusCode};
  use serde_json::json;

  const JOBS_URL: &str = "https://hub.test/api/jobs";

  fn layer() -> (CacheLayer<SqliteStorage>, ManualClock) {
    let clock = ManualClock::default();
    let storage = SqliteStorage::open_in_memory()
      .unwrap()
      .with_clock(Arc::new(clock.clone()));
    let layer = CacheLayer::new(storage).with_policy(RefreshPolicy::new(Duration::minutes(10)));
    (layer, clock)
  }

  fn client(
    mock: MockHttpClient,
  ) -> (
    CachingClient<MockHttpClient, SqliteStorage>,
    Arc<MockHttpClient>,
    ManualClock,
  ) {
    let (layer, clock) = layer();
    let mock = Arc::new(mock);
    let client = CachingClient::from_shared(
      Arc::clone(&mock),
      layer,
      InterceptRule::new("/api/jobs", "refresh"),
    );
    (client, mock, clock)
  }

  #[test]
  fn test_rule_matching() {
    let rule = InterceptRule::new("/api/jobs", "refresh");
    let get = HttpRequest::get(JOBS_URL).unwrap();
    let other = HttpRequest::get("https://hub.test/api/books").unwrap();
    let post = HttpRequest::new(Method::POST, get.url.clone());

    assert!(rule.matches(&get));
    assert!(!rule.matches(&other));
    assert!(!rule.matches(&post));
  }

  #[test]
  fn test_refresh_markers() {
    let rule = InterceptRule::new("/api/jobs", "refresh");
    let plain = HttpRequest::get(JOBS_URL).unwrap();
    assert!(!rule.wants_refresh(&plain));
    assert!(rule.wants_refresh(&plain.clone().with_query("refresh", "1")));
    assert!(!rule.wants_refresh(&plain.clone().with_query("refresh", "false")));
    assert!(rule.wants_refresh(
      &plain
        .clone()
        .with_header(CACHE_CONTROL, "No-Cache")
        .unwrap()
    ));
    assert!(rule.wants_refresh(&plain.with_header(PRAGMA, "no-cache").unwrap()));
  }

  #[tokio::test]
  async fn test_second_read_is_served_from_cache() {
    let (client, mock, _) = client(MockHttpClient::json(json!([{"id": 1}])));

    let first = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    assert_eq!(first.cache_status(), Some("MISS"));

    let second = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.cache_status(), Some("HIT"));
    assert_eq!(second.json::<Value>().unwrap(), json!([{"id": 1}]));
    assert_eq!(mock.calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_read_refreshes_in_background() {
    let (client, mock, clock) = client(MockHttpClient::json(json!(["v"])));
    client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();

    clock.advance(Duration::minutes(11));
    let stale = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    assert_eq!(stale.cache_status(), Some(CacheSource::CacheStale.label()));

    let key = client.cache_key(&HttpRequest::get(JOBS_URL).unwrap());
    client.cache().settle(&key).await;
    assert_eq!(mock.calls(), 2);
  }

  #[tokio::test]
  async fn test_refresh_marker_forces_network() {
    let (client, mock, _) = client(MockHttpClient::json(json!([])));
    client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();

    let request = HttpRequest::get(JOBS_URL).unwrap().with_query("refresh", "1");
    let response = client.send(request).await.unwrap();
    assert_eq!(response.cache_status(), Some("REFRESH"));
    assert_eq!(mock.calls(), 2);

    // The marker is not forwarded upstream
    let sent = mock.requests();
    assert_eq!(sent[1].url.as_str(), JOBS_URL);
  }

  #[tokio::test]
  async fn test_other_requests_pass_through() {
    let (client, mock, _) = client(MockHttpClient::json(json!({"ok": true})));

    let books = client
      .send(HttpRequest::get("https://hub.test/api/books").unwrap())
      .await
      .unwrap();
    assert_eq!(books.cache_status(), None);

    let post = HttpRequest::new(Method::POST, url::Url::parse(JOBS_URL).unwrap());
    client.send(post.clone()).await.unwrap();
    client.send(post).await.unwrap();

    assert_eq!(mock.calls(), 3);
  }

  #[tokio::test]
  async fn test_upstream_error_falls_back_to_real_response() {
    let (client, mock, _) = client(MockHttpClient::new(|_| {
      Ok(HttpResponse::new(
        StatusCode::SERVICE_UNAVAILABLE,
        HeaderMap::new(),
        b"down".to_vec(),
      ))
    }));

    let response = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.text().unwrap(), "down");
    assert_eq!(response.cache_status(), None);
    // One attempt through the cache, one fallback
    assert_eq!(mock.calls(), 2);

    let key = client.cache_key(&HttpRequest::get(JOBS_URL).unwrap());
    assert!(client.cache().storage().get(&key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_transport_error_propagates_on_cold_start() {
    let (client, _, _) = client(MockHttpClient::new(|_| Err(eyre!("connection refused"))));
    assert!(client.send(HttpRequest::get(JOBS_URL).unwrap()).await.is_err());
  }

  #[tokio::test]
  async fn test_payload_normalized_before_caching() {
    let (client, _, _) = client(MockHttpClient::json(json!([
      {"id": 1, "region": "LondonUKEU"},
      {"id": 2, "region": []},
    ])));
    let client = client.with_normalizer(PayloadNormalizer::new(
      Arc::new(Vocabulary::regions()),
      "region",
    ));

    let response = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    let body: Value = response.json().unwrap();
    assert_eq!(body[0]["region"], json!(["UK", "EU"]));
    assert_eq!(body[1]["region"], json!(["Others"]));

    let key = client.cache_key(&HttpRequest::get(JOBS_URL).unwrap());
    let stored = client.cache().storage().get(&key).unwrap().unwrap();
    assert_eq!(stored.value, body);
  }

  #[tokio::test]
  async fn test_privileged_client_always_refreshes() {
    let (client, mock, _) = client(MockHttpClient::new(|_| Ok(ok_json(&json!(["live"])))));
    let client = client.privileged();

    client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    let response = client.send(HttpRequest::get(JOBS_URL).unwrap()).await.unwrap();
    assert_eq!(response.cache_status(), Some("MISS"));
    assert_eq!(mock.calls(), 2);
  }
}
