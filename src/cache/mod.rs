//! Page-level response cache.
//!
//! Full responses are stored under keys derived from the request method,
//! path and the header values named by the response's `Vary`. The store is
//! either in-process or shared through Redis; invalidation arrives through
//! [`crate::invalidation`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! timeout_seconds = 300
//! key_prefix = "quire"
//! anonymous_only = false
//!
//! [store]
//! backend = "memory"   # or "redis"
//! memory_capacity = 1000
//! timeout_ms = 250
//! ```

mod config;
pub mod deps;
mod error;
mod freshness;
mod keys;
pub(crate) mod lock;
mod middleware;
mod redis;
mod registrar;
mod store;

pub use config::CacheConfig;
pub use error::CacheError;
pub use freshness::{MAX_TTL, clamp_ttl, etag_for, get_max_age, http_date, patch_response_headers};
pub use keys::{
    CacheKey, RequestSignature, build_cache_key, get_cache_key, header_list_key,
    learn_cache_key, normalize_path, patch_vary_headers, vary_header_names,
};
pub use middleware::{CacheState, Principal, response_cache_layer};
pub use redis::RedisStore;
pub use registrar::DependencyRegistrar;
pub use store::{CacheBackend, CachedResponse, MemoryStore, ResponseStore};
