//! HTTP plumbing: a client interface, the network client, and the caching
//! client that intercepts reads of the cached endpoint.

mod caching;
mod client;
mod key;

pub use caching::{CachingClient, InterceptRule};
pub use client::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, X_CACHE};
pub use key::RequestKey;
