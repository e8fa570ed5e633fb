//! Response cache middleware.
//!
//! Serves stored pages for cacheable GET/HEAD requests and stores freshly
//! rendered 200 responses, stamping them with freshness headers first.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::{Body, HttpBody, to_bytes},
    extract::State,
    http::{HeaderMap, Method, Request, StatusCode, header::CONTENT_LENGTH},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, histogram};
use tracing::{debug, error, instrument, warn};

use super::{
    CacheConfig,
    deps::{self, Dependencies},
    error::CacheError,
    freshness::{clamp_ttl, get_max_age, patch_response_headers},
    keys::{
        RequestSignature, get_cache_key, learn_cache_key, patch_vary_headers, vary_header_names,
    },
    registrar::DependencyRegistrar,
    store::{CacheBackend, CachedResponse},
};
use crate::application::error::HttpError;
use crate::invalidation::InvalidationPublisher;

const METRIC_HIT: &str = "quire_cache_hit_total";
const METRIC_MISS: &str = "quire_cache_miss_total";
const METRIC_STORE: &str = "quire_cache_store_total";
const METRIC_BYPASS: &str = "quire_cache_bypass_total";
const METRIC_LOOKUP_MS: &str = "quire_cache_lookup_ms";

/// Largest body written to the store; bigger pages are served uncached.
const MAX_CACHEABLE_BODY: usize = 4 * 1024 * 1024;

/// Request headers that identify a principal.
const CREDENTIAL_HEADERS: [&str; 2] = ["cookie", "authorization"];

/// Identity of the client, attached to requests as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    Anonymous,
    Authenticated { id: String },
}

impl Principal {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Principal::Authenticated { .. })
    }
}

/// Shared cache state for middleware.
#[derive(Clone)]
pub struct CacheState {
    pub config: CacheConfig,
    pub backend: CacheBackend,
    /// Receives the dependencies of every stored page.
    pub registrar: Option<DependencyRegistrar>,
}

impl CacheState {
    pub fn new(config: CacheConfig, backend: CacheBackend) -> Self {
        Self {
            config,
            backend,
            registrar: None,
        }
    }

    /// Register stored pages' dependencies through `publisher`.
    ///
    /// Spawns the registration worker, so it must run inside a Tokio runtime.
    pub fn with_publisher(mut self, publisher: Arc<InvalidationPublisher>) -> Self {
        self.registrar = Some(DependencyRegistrar::spawn(publisher));
        self
    }

    /// Wait for queued dependency registrations to be sent.
    pub async fn flush_registrations(&self) {
        if let Some(registrar) = &self.registrar {
            registrar.flush().await;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Bypass {
    Method,
    Query,
    Authenticated,
}

impl Bypass {
    fn as_str(&self) -> &'static str {
        match self {
            Bypass::Method => "method",
            Bypass::Query => "query",
            Bypass::Authenticated => "authenticated",
        }
    }
}

/// Middleware for response caching.
///
/// Lookups use the header list learned from earlier responses, so the first
/// request for a path always misses. Whatever handlers record through
/// [`deps`] is registered against the stored page's key.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !cache.config.enabled {
        return next.run(request).await;
    }

    let signature = RequestSignature::from_request(&request);

    let bypass = match check_principal(&cache.config, &request) {
        Ok(bypass) => bypass.or_else(|| bypass_reason(&signature)),
        Err(err) => return misconfigured(err),
    };
    if let Some(reason) = bypass {
        counter!(METRIC_BYPASS, "reason" => reason.as_str()).increment(1);
        debug!(cache = "response", outcome = "bypass", reason = reason.as_str());
        let mut response = next.run(request).await;
        vary_on_principal(&cache.config, response.headers_mut());
        return response;
    }

    let started = Instant::now();
    let cached = lookup(&cache, &signature).await;
    histogram!(METRIC_LOOKUP_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    if let Some(cached) = cached {
        counter!(METRIC_HIT).increment(1);
        debug!(cache = "response", outcome = "hit", "serving cached response");
        return cached.into_response();
    }

    counter!(METRIC_MISS).increment(1);
    debug!(cache = "response", outcome = "miss", "cache miss, executing handler");

    let (mut response, deps) = deps::with_collector(next.run(request)).await;
    vary_on_principal(&cache.config, response.headers_mut());
    update_cache(&cache, &signature, response, deps).await
}

/// Anonymous-only pages depend on the credentials the client sent.
fn vary_on_principal(config: &CacheConfig, headers: &mut HeaderMap) {
    if config.anonymous_only {
        patch_vary_headers(headers, &CREDENTIAL_HEADERS);
    }
}

/// `Err` when anonymous-only caching is on but nothing identified the client.
fn check_principal(
    config: &CacheConfig,
    request: &Request<Body>,
) -> Result<Option<Bypass>, CacheError> {
    if !config.anonymous_only {
        return Ok(None);
    }
    match request.extensions().get::<Principal>() {
        Some(principal) if principal.is_authenticated() => Ok(Some(Bypass::Authenticated)),
        Some(_) => Ok(None),
        None => Err(CacheError::configuration(
            "anonymous-only caching requires the principal middleware; \
             install `identify_principal` before `response_cache_layer`",
        )),
    }
}

fn bypass_reason(signature: &RequestSignature) -> Option<Bypass> {
    if signature.method != Method::GET && signature.method != Method::HEAD {
        return Some(Bypass::Method);
    }
    if signature.has_query {
        return Some(Bypass::Query);
    }
    None
}

fn misconfigured(err: CacheError) -> Response {
    error!(
        target = "quire::cache::middleware",
        error = %err,
        "response cache is misconfigured"
    );
    HttpError::from_error(
        "cache::middleware::response_cache_layer",
        StatusCode::INTERNAL_SERVER_ERROR,
        "The page cache is misconfigured",
        &err,
    )
    .into_response()
}

async fn lookup(cache: &CacheState, signature: &RequestSignature) -> Option<CachedResponse> {
    let key = get_cache_key(signature, &cache.config.key_prefix, &cache.backend).await?;
    cache.backend.fetch_response(key.as_str()).await
}

async fn update_cache(
    cache: &CacheState,
    signature: &RequestSignature,
    response: Response,
    deps: Dependencies,
) -> Response {
    if signature.method != Method::GET || response.status() != StatusCode::OK {
        return response;
    }

    let ttl = match get_max_age(response.headers()) {
        Some(0) => return response,
        Some(seconds) => clamp_ttl(Duration::from_secs(seconds)),
        None => clamp_ttl(cache.config.default_ttl),
    };

    if vary_header_names(response.headers()).is_none() {
        return response;
    }

    if exceeds_cacheable_size(response.headers(), response.body()) {
        debug!("response too large to cache");
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "response body failed while buffering for the cache");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    patch_response_headers(&mut parts.headers, &bytes, ttl);

    if bytes.len() > MAX_CACHEABLE_BODY {
        debug!(size = bytes.len(), "response too large to cache");
        return Response::from_parts(parts, Body::from(bytes));
    }

    let prefix = &cache.config.key_prefix;
    if let Some(key) = learn_cache_key(signature, &parts.headers, ttl, prefix, &cache.backend).await
    {
        let cached = CachedResponse::from_parts(&parts, bytes.clone());
        if cache.backend.put_response(key.as_str(), &cached, ttl).await {
            counter!(METRIC_STORE).increment(1);
            debug!(
                cache = "response",
                key = %key,
                ttl_secs = ttl.as_secs(),
                deps_count = deps.len(),
                "caching response"
            );
            if let Some(registrar) = &cache.registrar {
                registrar.submit(key.as_str(), deps);
            }
        }
    }

    Response::from_parts(parts, Body::from(bytes))
}

/// Judge the body size from its length hint or `Content-Length`, before
/// buffering it.
fn exceeds_cacheable_size(headers: &HeaderMap, body: &Body) -> bool {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    let hinted = body.size_hint().lower();
    declared.unwrap_or(0).max(hinted) > MAX_CACHEABLE_BODY as u64
}
