//! Freshness headers for cached responses.

use std::time::Duration;

use axum::http::{
    HeaderMap, HeaderValue,
    header::{CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED},
};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

/// IMF-fixdate, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
const HTTP_DATE_FORMAT: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

const ETAG_HEX_LEN: usize = 32;

/// Longest freshness lifetime honoured; larger `max-age` values are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(1 << 31);

pub fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.min(MAX_TTL)
}

pub fn http_date(at: OffsetDateTime) -> String {
    at.to_offset(time::UtcOffset::UTC)
        .format(HTTP_DATE_FORMAT)
        .unwrap_or_default()
}

/// `max-age` from the response's Cache-Control, if present and numeric.
pub fn get_max_age(headers: &HeaderMap) -> Option<u64> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|directive| {
            let (name, value) = directive.trim().split_once('=')?;
            if !name.trim().eq_ignore_ascii_case("max-age") {
                return None;
            }
            value.trim().trim_matches('"').parse().ok()
        })
}

/// Quoted SHA-256 prefix of `body`.
pub fn etag_for(body: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(body));
    format!("\"{}\"", &digest[..ETAG_HEX_LEN])
}

/// Stamp ETag, Last-Modified and Expires when absent, and set `max-age=<ttl>`
/// in Cache-Control, keeping any other directives.
pub fn patch_response_headers(headers: &mut HeaderMap, body: &[u8], ttl: Duration) {
    patch_response_headers_at(headers, body, ttl, OffsetDateTime::now_utc());
}

pub(crate) fn patch_response_headers_at(
    headers: &mut HeaderMap,
    body: &[u8],
    ttl: Duration,
    now: OffsetDateTime,
) {
    let ttl = clamp_ttl(ttl);

    if !headers.contains_key(ETAG) {
        if let Ok(value) = HeaderValue::from_str(&etag_for(body)) {
            headers.insert(ETAG, value);
        }
    }

    if !headers.contains_key(LAST_MODIFIED) {
        if let Ok(value) = HeaderValue::from_str(&http_date(now)) {
            headers.insert(LAST_MODIFIED, value);
        }
    }

    if !headers.contains_key(EXPIRES) {
        let expires = time::Duration::try_from(ttl)
            .ok()
            .and_then(|ttl| now.checked_add(ttl));
        if let Some(value) = expires.and_then(|at| HeaderValue::from_str(&http_date(at)).ok()) {
            headers.insert(EXPIRES, value);
        }
    }

    let mut directives: Vec<String> = headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|directive| directive.trim().to_string())
        .filter(|directive| {
            !directive.is_empty()
                && !directive
                    .split('=')
                    .next()
                    .is_some_and(|name| name.trim().eq_ignore_ascii_case("max-age"))
        })
        .collect();
    directives.push(format!("max-age={}", ttl.as_secs()));

    if let Ok(value) = HeaderValue::from_str(&directives.join(", ")) {
        headers.insert(CACHE_CONTROL, value);
    }
}
