//! JSON write API for articles.
//!
//! Writes go through the repository, so each one fires the lifecycle signals
//! that publish cache invalidations.

pub mod error;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{post, put},
};
use serde::Serialize;

use crate::domain::articles::{Article, ArticleDraft};

use super::HttpState;
use error::ApiError;

#[derive(Debug, Serialize)]
pub struct ArticleResponse {
    pub article: Article,
    pub path: String,
}

impl From<Article> for ArticleResponse {
    fn from(article: Article) -> Self {
        let path = article.path();
        Self { article, path }
    }
}

pub fn build_api_router() -> Router<HttpState> {
    Router::new()
        .route("/api/articles", post(create_article))
        .route(
            "/api/articles/{id}",
            put(update_article).delete(delete_article),
        )
}

fn parse_body(payload: Result<Json<ArticleDraft>, JsonRejection>) -> Result<ArticleDraft, ApiError> {
    payload
        .map(|Json(draft)| draft)
        .map_err(|rejection| ApiError::bad_request("Malformed article", Some(rejection.body_text())))
}

pub async fn create_article(
    State(state): State<HttpState>,
    payload: Result<Json<ArticleDraft>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = parse_body(payload)?;
    let article = state.articles.create(draft).await?;
    Ok((StatusCode::CREATED, Json(ArticleResponse::from(article))))
}

pub async fn update_article(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
    payload: Result<Json<ArticleDraft>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let draft = parse_body(payload)?;
    let article = state.articles.update(id, draft).await?;
    Ok(Json(ArticleResponse::from(article)))
}

pub async fn delete_article(
    State(state): State<HttpState>,
    Path(id): Path<u64>,
) -> Result<impl IntoResponse, ApiError> {
    state.articles.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
