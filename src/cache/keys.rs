//! Cache key derivation.
//!
//! Keys are derived in two phases because the `Vary` header is only known
//! once a response exists:
//!
//! 1. [`get_cache_key`] looks up the header list learned for a path and, if
//!    one exists, builds the page key from this request's header values.
//! 2. [`learn_cache_key`] records the response's `Vary` header names for the
//!    path and returns the page key for the request that produced it.
//!
//! The first request for any path therefore always misses.

use std::fmt;
use std::time::Duration;

use axum::http::{
    HeaderMap, Method, Request,
    header::{HeaderValue, VARY},
};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::store::CacheBackend;

const HEADER_LIST_SEGMENT: &str = "vary";

/// Storage key of one cached page.
///
/// Format: `{prefix}:{METHOD}:{path}:{vary-hash}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The request characteristics a cache key depends on.
///
/// Captured before the request is handed to the inner service so the
/// response phase can still derive keys.
#[derive(Debug, Clone)]
pub struct RequestSignature {
    pub method: Method,
    pub path: String,
    pub has_query: bool,
    pub headers: HeaderMap,
}

impl RequestSignature {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();
        Self {
            method: request.method().clone(),
            path: normalize_path(uri.path()),
            has_query: uri.query().is_some_and(|q| !q.is_empty()),
            headers: request.headers().clone(),
        }
    }

    /// HEAD shares GET's entries.
    fn key_method(&self) -> &str {
        if self.method == Method::HEAD {
            Method::GET.as_str()
        } else {
            self.method.as_str()
        }
    }
}

pub fn normalize_path(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

/// Secondary key under which the `Vary` header list for `path` is stored.
pub fn header_list_key(prefix: &str, path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    format!(
        "{prefix}:{HEADER_LIST_SEGMENT}:{}",
        hex::encode(hasher.finalize())
    )
}

/// Build the page key from the learned header names and this request's values.
pub fn build_cache_key(
    prefix: &str,
    signature: &RequestSignature,
    header_names: &[String],
) -> CacheKey {
    let mut hasher = Sha256::new();
    for name in header_names {
        hasher.update(name.as_bytes());
        hasher.update([0x1f]);
        let mut first = true;
        for value in signature.headers.get_all(name.as_str()) {
            if !first {
                hasher.update(b",");
            }
            hasher.update(value.as_bytes());
            first = false;
        }
        hasher.update([0x1e]);
    }

    CacheKey(format!(
        "{prefix}:{}:{}:{}",
        signature.key_method(),
        signature.path,
        hex::encode(hasher.finalize())
    ))
}

/// Header names listed in `Vary`, lowercased and deduplicated in order.
///
/// Returns `None` for `Vary: *`, which makes a response uncacheable.
pub fn vary_header_names(headers: &HeaderMap) -> Option<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for value in headers.get_all(VARY) {
        let Ok(text) = value.to_str() else {
            continue;
        };
        for name in text.split(',') {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() {
                continue;
            }
            if name == "*" {
                return None;
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    Some(names)
}

/// Add `names` to the response's `Vary` header, keeping existing entries.
pub fn patch_vary_headers(headers: &mut HeaderMap, names: &[&str]) {
    let Some(mut current) = vary_header_names(headers) else {
        return;
    };
    let before = current.len();
    for name in names {
        let lowered = name.to_ascii_lowercase();
        if !current.contains(&lowered) {
            current.push(lowered);
        }
    }
    if current.len() == before {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&current.join(", ")) {
        headers.insert(VARY, value);
    }
}

/// Phase one: derive the key from a previously learned header list.
pub async fn get_cache_key(
    signature: &RequestSignature,
    prefix: &str,
    backend: &CacheBackend,
) -> Option<CacheKey> {
    let list_key = header_list_key(prefix, &signature.path);
    let raw = backend.fetch(&list_key).await?;
    match serde_json::from_slice::<Vec<String>>(&raw) {
        Ok(header_names) => Some(build_cache_key(prefix, signature, &header_names)),
        Err(err) => {
            debug!(key = %list_key, error = %err, "ignoring malformed header list");
            None
        }
    }
}

/// Phase two: record the response's `Vary` names for the path and return the key.
///
/// Returns `None` when the response varies on `*` or the list cannot be stored.
pub async fn learn_cache_key(
    signature: &RequestSignature,
    response_headers: &HeaderMap,
    ttl: Duration,
    prefix: &str,
    backend: &CacheBackend,
) -> Option<CacheKey> {
    let header_names = vary_header_names(response_headers)?;
    let encoded = match serde_json::to_vec(&header_names) {
        Ok(encoded) => Bytes::from(encoded),
        Err(_) => return None,
    };

    let list_key = header_list_key(prefix, &signature.path);
    if !backend.put(&list_key, encoded, ttl).await {
        return None;
    }

    Some(build_cache_key(prefix, signature, &header_names))
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use axum::body::Body;

    use super::*;
    use crate::cache::store::MemoryStore;

    fn backend() -> CacheBackend {
        let store = MemoryStore::new(NonZeroUsize::new(16).expect("non-zero"));
        CacheBackend::new(Arc::new(store), Duration::from_secs(1))
    }

    fn signature(method: Method, uri: &str, headers: &[(&str, &str)]) -> RequestSignature {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        RequestSignature::from_request(&builder.body(Body::empty()).unwrap())
    }

    fn vary(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(VARY, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn key_has_prefix_method_path_and_hash() {
        let sig = signature(Method::GET, "/articles/1/", &[]);
        let key = build_cache_key("site", &sig, &[]);

        let text = key.as_str();
        assert!(text.starts_with("site:GET:/articles/1/:"));
        let hash = text.rsplit(':').next().unwrap();
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn head_requests_share_get_keys() {
        let get = signature(Method::GET, "/articles/1/", &[]);
        let head = signature(Method::HEAD, "/articles/1/", &[]);
        assert_eq!(
            build_cache_key("p", &get, &[]),
            build_cache_key("p", &head, &[])
        );
    }

    #[test]
    fn vary_values_partition_keys() {
        let names = vec!["accept-language".to_string()];
        let en = signature(Method::GET, "/", &[("accept-language", "en")]);
        let cs = signature(Method::GET, "/", &[("accept-language", "cs")]);
        let en_again = signature(Method::GET, "/", &[("Accept-Language", "en")]);

        assert_ne!(
            build_cache_key("p", &en, &names),
            build_cache_key("p", &cs, &names)
        );
        assert_eq!(
            build_cache_key("p", &en, &names),
            build_cache_key("p", &en_again, &names)
        );
    }

    #[test]
    fn unlisted_headers_do_not_affect_key() {
        let names = vec!["accept-language".to_string()];
        let a = signature(Method::GET, "/", &[("user-agent", "a")]);
        let b = signature(Method::GET, "/", &[("user-agent", "b")]);
        assert_eq!(
            build_cache_key("p", &a, &names),
            build_cache_key("p", &b, &names)
        );
    }

    #[test]
    fn prefixes_namespace_keys() {
        let sig = signature(Method::GET, "/", &[]);
        assert_ne!(
            build_cache_key("a", &sig, &[]),
            build_cache_key("b", &sig, &[])
        );
        assert_ne!(header_list_key("a", "/"), header_list_key("b", "/"));
    }

    #[test]
    fn vary_names_are_normalized_and_deduplicated() {
        let mut headers = vary("Accept-Language, Cookie");
        headers.append(VARY, HeaderValue::from_static("cookie, Accept-Encoding"));

        assert_eq!(
            vary_header_names(&headers),
            Some(vec![
                "accept-language".to_string(),
                "cookie".to_string(),
                "accept-encoding".to_string(),
            ])
        );
    }

    #[test]
    fn vary_star_is_uncacheable() {
        assert_eq!(vary_header_names(&vary("Cookie, *")), None);
    }

    #[test]
    fn patch_vary_appends_missing_names_only() {
        let mut headers = vary("Accept-Language");
        patch_vary_headers(&mut headers, &["cookie", "accept-language"]);
        assert_eq!(headers[VARY], "accept-language, cookie");
    }

    #[test]
    fn patch_vary_leaves_star_alone() {
        let mut headers = vary("*");
        patch_vary_headers(&mut headers, &["cookie"]);
        assert_eq!(headers[VARY], "*");
    }

    #[test]
    fn query_presence_is_captured() {
        assert!(signature(Method::GET, "/?page=2", &[]).has_query);
        assert!(!signature(Method::GET, "/?", &[]).has_query);
        assert!(!signature(Method::GET, "/", &[]).has_query);
    }

    #[tokio::test]
    async fn unknown_path_has_no_key() {
        let backend = backend();
        let sig = signature(Method::GET, "/articles/1/", &[]);
        assert!(get_cache_key(&sig, "p", &backend).await.is_none());
    }

    #[tokio::test]
    async fn learned_key_matches_later_lookup() {
        let backend = backend();
        let sig = signature(Method::GET, "/articles/1/", &[("cookie", "sessionid=abc")]);

        let learned = learn_cache_key(&sig, &vary("Cookie"), Duration::from_secs(60), "p", &backend)
            .await
            .expect("learned key");
        let looked_up = get_cache_key(&sig, "p", &backend)
            .await
            .expect("derived key");

        assert_eq!(learned, looked_up);
    }

    #[tokio::test]
    async fn learned_vary_partitions_other_sessions() {
        let backend = backend();
        let alice = signature(Method::GET, "/", &[("cookie", "sessionid=alice")]);
        let bob = signature(Method::GET, "/", &[("cookie", "sessionid=bob")]);

        let learned = learn_cache_key(&alice, &vary("Cookie"), Duration::from_secs(60), "p", &backend)
            .await
            .expect("learned key");
        let bob_key = get_cache_key(&bob, "p", &backend).await.expect("derived key");

        assert_ne!(learned, bob_key);
    }

    #[tokio::test]
    async fn vary_star_learns_nothing() {
        let backend = backend();
        let sig = signature(Method::GET, "/", &[]);

        assert!(
            learn_cache_key(&sig, &vary("*"), Duration::from_secs(60), "p", &backend)
                .await
                .is_none()
        );
        assert!(get_cache_key(&sig, "p", &backend).await.is_none());
    }
}
