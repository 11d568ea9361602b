//! Stale-while-revalidate data cache for content-hub APIs.
//!
//! Reads are served from a persistent store and refreshed in the background,
//! requests to the cached endpoint are intercepted by a client that shares the
//! plain client's interface, and multi-valued category fields are cleaned
//! against a closed vocabulary before anything is cached.

pub mod cache;
pub mod category;
pub mod config;
pub mod http;
pub mod logging;
pub mod scheduler;
