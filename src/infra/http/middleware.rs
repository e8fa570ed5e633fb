use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, header},
    middleware::Next,
    response::Response,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, cache::Principal};

/// Cookie carried by signed-in browser sessions.
pub const SESSION_COOKIE: &str = "sessionid";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub path: String,
}

tokio::task_local! {
    static CURRENT_REQUEST: RequestContext;
}

/// The request being served on this task, if any.
pub fn current_request() -> Option<RequestContext> {
    CURRENT_REQUEST.try_with(Clone::clone).ok()
}

pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
        method: request.method().clone(),
        path: request.uri().path().to_string(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = CURRENT_REQUEST.scope(ctx.clone(), next.run(request)).await;
    response.extensions_mut().insert(ctx);
    response
}

/// Tag the request with the caller's [`Principal`].
///
/// Any `Authorization` header or session cookie counts as signed in; the
/// credentials themselves are not checked here.
pub async fn identify_principal(mut request: Request<Body>, next: Next) -> Response {
    let principal = principal_from_headers(request.headers());
    request.extensions_mut().insert(principal);
    next.run(request).await
}

fn principal_from_headers(headers: &HeaderMap) -> Principal {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
    {
        return Principal::Authenticated {
            id: value
                .split_whitespace()
                .next_back()
                .unwrap_or_default()
                .to_string(),
        };
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| Principal::Authenticated {
            id: value.to_string(),
        })
        .unwrap_or(Principal::Anonymous)
}

pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let request_id = request
        .extensions()
        .get::<RequestContext>()
        .map(|ctx| ctx.request_id.clone())
        .unwrap_or_default();

    let mut response = next.run(request).await;
    let status = response.status();

    if status.is_client_error() || status.is_server_error() {
        let elapsed_ms = start.elapsed().as_millis();
        let report = response.extensions_mut().remove::<ErrorReport>();
        let (source, messages) = match report {
            Some(report) => (report.source, report.messages),
            None => ("unknown", Vec::new()),
        };
        let detail = messages
            .first()
            .cloned()
            .unwrap_or_else(|| "no diagnostic available".to_string());

        if status.is_server_error() {
            error!(
                target = "quire::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                query = uri.query().unwrap_or(""),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                chain = ?messages,
                request_id = request_id,
                "request failed",
            );
        } else {
            warn!(
                target = "quire::http::response",
                status = status.as_u16(),
                method = %method,
                path = %uri.path(),
                elapsed_ms = elapsed_ms,
                source = source,
                detail = %detail,
                request_id = request_id,
                "client request error",
            );
        }
    }

    response
}
