use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use crate::{
    application::error::AppError,
    cache::response_cache_layer,
    presentation::views::{
        ArticleTemplate, IndexTemplate, render_not_found_response, render_template_response,
    },
};

use super::HttpState;

/// Public pages, wrapped in the response cache when one is configured.
pub fn build_public_router(state: &HttpState) -> Router<HttpState> {
    let cached_routes = Router::new()
        .route("/", get(index))
        .route("/articles/{id}/", get(article_detail))
        .fallback(fallback);

    let cached_routes = match state.cache.clone() {
        Some(cache_state) => cached_routes.layer(middleware::from_fn_with_state(
            cache_state,
            response_cache_layer,
        )),
        None => cached_routes,
    };

    cached_routes.route("/_health", get(health))
}

async fn index(State(state): State<HttpState>) -> Response {
    match state.articles.list_published().await {
        Ok(articles) => render_template_response(IndexTemplate::new(&articles), StatusCode::OK),
        Err(err) => err.into_response(),
    }
}

async fn article_detail(State(state): State<HttpState>, Path(id): Path<String>) -> Response {
    let Ok(id) = id.parse::<u64>() else {
        return render_not_found_response();
    };

    match state.articles.get_published(id).await {
        Ok(article) => render_template_response(ArticleTemplate::new(&article), StatusCode::OK),
        Err(AppError::NotFound) => render_not_found_response(),
        Err(err) => err.into_response(),
    }
}

async fn fallback() -> Response {
    render_not_found_response()
}

#[derive(Debug, Serialize)]
struct HealthBody {
    status: &'static str,
    cache: &'static str,
    bus: &'static str,
}

async fn health(State(state): State<HttpState>) -> Json<HealthBody> {
    let cache = if state.cache.as_ref().is_some_and(|cache| cache.config.enabled) {
        "enabled"
    } else {
        "disabled"
    };
    let bus = if !state.bus.is_enabled() {
        "disabled"
    } else if state.bus.is_connected() {
        "connected"
    } else {
        "disconnected"
    };

    Json(HealthBody {
        status: "ok",
        cache,
        bus,
    })
}
