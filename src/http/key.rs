//! Cache keys for intercepted requests.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use super::client::HttpRequest;

/// Identity of a cacheable request: method plus normalized URL.
///
/// The cache-busting query parameter, the fragment and query parameter order
/// do not affect the key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
  method: String,
  url: Url,
}

impl RequestKey {
  pub fn new(request: &HttpRequest, refresh_param: &str) -> Self {
    Self {
      method: request.method.as_str().to_string(),
      url: normalize_url(&request.url, refresh_param),
    }
  }

  /// Stable, fixed-length storage key.
  pub fn cache_hash(&self) -> String {
    let input = format!("{} {}", self.method, self.url);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    format!("http:{}", hex::encode(result))
  }

  /// The URL the request should actually be sent to.
  pub fn upstream_url(&self) -> &Url {
    &self.url
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Strip the cache-busting parameter and fragment, and sort the query.
fn normalize_url(url: &Url, refresh_param: &str) -> Url {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut pairs: Vec<(String, String)> = url
    .query_pairs()
    .filter(|(name, _)| name != refresh_param)
    .map(|(name, value)| (name.into_owned(), value.into_owned()))
    .collect();
  pairs.sort();

  if pairs.is_empty() {
    url.set_query(None);
  } else {
    url.query_pairs_mut().clear().extend_pairs(pairs);
  }
  url
}
