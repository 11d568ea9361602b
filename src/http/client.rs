//! HTTP client abstraction and the plain reqwest-backed client.

use color_eyre::{eyre::eyre, Result};
use futures::future::{BoxFuture, FutureExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// Response header reporting how a cached response was produced.
pub const X_CACHE: &str = "x-cache";

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
}

impl HttpRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
    }
  }

  pub fn get(url: &str) -> Result<Self> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
    Ok(Self::new(Method::GET, url))
  }

  pub fn with_header(mut self, name: HeaderName, value: &str) -> Result<Self> {
    let value =
      HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value for {}: {}", name, e))?;
    self.headers.insert(name, value);
    Ok(self)
  }

  pub fn with_query(mut self, name: &str, value: &str) -> Self {
    self.url.query_pairs_mut().append_pair(name, value);
    self
  }

  /// GET is the only method whose result may be served from cache.
  pub fn is_read_only(&self) -> bool {
    self.method == Method::GET
  }
}

/// A response, either from the network or built from a cached value.
#[derive(Debug, Clone)]
pub struct HttpResponse {
  status: StatusCode,
  headers: HeaderMap,
  body: Vec<u8>,
}

impl HttpResponse {
  pub fn new(status: StatusCode, headers: HeaderMap, body: Vec<u8>) -> Self {
    Self {
      status,
      headers,
      body,
    }
  }

  /// A 200 JSON response carrying `value`, tagged with an `x-cache` header.
  pub fn from_json(value: &Value, cache_status: &'static str) -> Result<Self> {
    let body =
      serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize cached value: {}", e))?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(X_CACHE, HeaderValue::from_static(cache_status));

    Ok(Self::new(StatusCode::OK, headers, body))
  }

  pub fn status(&self) -> StatusCode {
    self.status
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Value of the `x-cache` header, if the response came through the cache.
  pub fn cache_status(&self) -> Option<&str> {
    self.headers.get(X_CACHE).and_then(|v| v.to_str().ok())
  }

  pub fn bytes(&self) -> &[u8] {
    &self.body
  }

  pub fn text(&self) -> Result<String> {
    String::from_utf8(self.body.clone()).map_err(|e| eyre!("Response is not UTF-8: {}", e))
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.body).map_err(|e| eyre!("Failed to parse response body: {}", e))
  }
}

/// Something that can perform HTTP requests.
///
/// The plain client and the caching client share this interface so callers
/// can be handed either.
pub trait HttpClient: Send + Sync {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>>;
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
    (**self).send(request)
  }
}

/// Network client backed by reqwest.
#[derive(Clone)]
pub struct ReqwestClient {
  client: reqwest::Client,
}

impl ReqwestClient {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("hubcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl HttpClient for ReqwestClient {
  fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
    async move {
      let url = request.url.to_string();
      let response = self
        .client
        .request(request.method, request.url)
        .headers(request.headers)
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", url, e))?;

      let status = response.status();
      let headers = response.headers().clone();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", url, e))?;

      Ok::<_, color_eyre::Report>(HttpResponse::new(status, headers, body.to_vec()))
    }
    .boxed()
  }
}

#[cfg(test)]
pub(crate) mod mock {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;

  type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync;

  /// Scripted client that records every request it receives.
  pub struct MockHttpClient {
    handler: Box<Handler>,
    calls: AtomicUsize,
    requests: Mutex<Vec<HttpRequest>>,
  }

  impl MockHttpClient {
    pub fn new<F>(handler: F) -> Self
    where
      F: Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    {
      Self {
        handler: Box::new(handler),
        calls: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
      }
    }

    /// Always answers 200 with `value`.
    pub fn json(value: Value) -> Self {
      Self::new(move |_| Ok(ok_json(&value)))
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
      self.requests.lock().unwrap().clone()
    }
  }

  pub fn ok_json(value: &Value) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    HttpResponse::new(StatusCode::OK, headers, serde_json::to_vec(value).unwrap())
  }

  impl HttpClient for MockHttpClient {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.requests.lock().unwrap().push(request.clone());
      let response = (self.handler)(&request);
      async move { response }.boxed()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_synthetic_response() {
    let response = HttpResponse::from_json(&json!({"ok": true}), "HIT").unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.cache_status(), Some("HIT"));
    assert_eq!(response.json::<Value>().unwrap(), json!({"ok": true}));
    assert_eq!(response.text().unwrap(), r#"{"ok":true}"#);
    assert_eq!(response.bytes(), br#"{"ok":true}"#);
    assert_eq!(
      response.headers().get(CONTENT_TYPE).unwrap(),
      "application/json"
    );
  }

  #[test]
  fn test_request_builders() {
    let request = HttpRequest::get("https://example.com/api/jobs")
      .unwrap()
      .with_query("refresh", "1");
    assert!(request.is_read_only());
    assert_eq!(request.url.as_str(), "https://example.com/api/jobs?refresh=1");

    let post = HttpRequest::new(Method::POST, request.url.clone());
    assert!(!post.is_read_only());

    assert!(HttpRequest::get("not a url").is_err());
  }
}
