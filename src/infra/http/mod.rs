pub mod api;
pub mod middleware;
mod public;

use std::sync::Arc;

use axum::{Router, middleware as axum_middleware};

use crate::application::articles::ArticleService;
use crate::cache::CacheState;
use crate::invalidation::BusConnection;

pub use api::build_api_router;
pub use middleware::{RequestContext, current_request};
pub use public::build_public_router;

#[derive(Clone)]
pub struct HttpState {
    pub articles: Arc<ArticleService>,
    pub bus: Arc<BusConnection>,
    pub cache: Option<CacheState>,
}

/// Public pages and the write API behind the shared request middleware.
///
/// Layers run outermost first: request context, response logging, principal
/// detection, then the page cache on the public routes only.
pub fn build_router(state: HttpState) -> Router {
    build_public_router(&state)
        .merge(build_api_router())
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::identify_principal))
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
