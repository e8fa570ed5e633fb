//! Cache configuration.
//!
//! Resolved from the `[cache]` and `[store]` tables of `quire.toml`.

use std::time::Duration;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const DEFAULT_KEY_PREFIX: &str = "quire";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;

/// Runtime policy of the response cache middleware.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Install the response cache at all.
    pub enabled: bool,
    /// TTL applied when a response carries no `max-age` directive.
    pub default_ttl: Duration,
    /// Namespace for every key written to the store.
    pub key_prefix: String,
    /// Only cache requests from anonymous principals.
    pub anonymous_only: bool,
    /// Bound for one store round-trip; exceeding it counts as a miss.
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            anonymous_only: false,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

impl From<&crate::config::Settings> for CacheConfig {
    fn from(settings: &crate::config::Settings) -> Self {
        Self {
            enabled: settings.cache.enabled,
            default_ttl: settings.cache.timeout,
            key_prefix: settings.cache.key_prefix.clone(),
            anonymous_only: settings.cache.anonymous_only,
            store_timeout: settings.store.timeout,
        }
    }
}
