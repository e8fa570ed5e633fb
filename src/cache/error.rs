use thiserror::Error;

/// Failures inside the response cache.
///
/// Only `Configuration` ever reaches a client; everything else degrades to a
/// miss or a skipped write.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache misconfigured: {0}")]
    Configuration(String),
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache operation `{op}` exceeded {timeout_ms}ms")]
    Timeout { op: &'static str, timeout_ms: u128 },
    #[error("cached entry could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}
