use crate::application::error::{ErrorReport, HttpError};
use crate::domain::articles::Article;
use askama::{Error as AskamaError, Template};
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{public_message}")]
pub struct TemplateRenderError {
    pub(crate) source: &'static str,
    pub(crate) public_message: &'static str,
    #[source]
    pub(crate) error: AskamaError,
}

impl TemplateRenderError {
    pub fn new(source: &'static str, public_message: &'static str, error: AskamaError) -> Self {
        Self {
            source,
            public_message,
            error,
        }
    }
}

impl From<TemplateRenderError> for HttpError {
    fn from(err: TemplateRenderError) -> Self {
        HttpError::from_error(
            err.source,
            StatusCode::INTERNAL_SERVER_ERROR,
            err.public_message,
            &err.error,
        )
    }
}

pub fn render_template<T: Template>(template: T) -> Result<Html<String>, HttpError> {
    template.render().map(Html).map_err(|err| {
        TemplateRenderError::new(
            "presentation::views::render_template",
            "Template rendering failed",
            err,
        )
        .into()
    })
}

pub fn render_template_response<T: Template>(template: T, status: StatusCode) -> Response {
    match render_template(template) {
        Ok(html) => (status, html).into_response(),
        Err(err) => err.into_response(),
    }
}

pub fn render_not_found_response() -> Response {
    let mut response = render_template_response(
        NotFoundTemplate {
            site_title: SITE_TITLE,
        },
        StatusCode::NOT_FOUND,
    );
    ErrorReport::from_message(
        "presentation::views::render_not_found_response",
        StatusCode::NOT_FOUND,
        "Resource not found",
    )
    .attach(&mut response);
    response
}

pub const SITE_TITLE: &str = "Quire";

pub struct ArticleCard {
    pub href: String,
    pub title: String,
    pub section: String,
    pub date: String,
}

impl From<&Article> for ArticleCard {
    fn from(article: &Article) -> Self {
        Self {
            href: article.path(),
            title: article.title.clone(),
            section: article.section.clone(),
            date: article.human_date(),
        }
    }
}

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub site_title: &'static str,
    pub articles: Vec<ArticleCard>,
}

impl IndexTemplate {
    pub fn new(articles: &[Article]) -> Self {
        Self {
            site_title: SITE_TITLE,
            articles: articles.iter().map(ArticleCard::from).collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "article.html")]
pub struct ArticleTemplate {
    pub site_title: &'static str,
    pub title: String,
    pub section: String,
    pub date: String,
    pub paragraphs: Vec<String>,
}

impl ArticleTemplate {
    pub fn new(article: &Article) -> Self {
        Self {
            site_title: SITE_TITLE,
            title: article.title.clone(),
            section: article.section.clone(),
            date: article.human_date(),
            paragraphs: article
                .body
                .split("\n\n")
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Template)]
#[template(path = "not_found.html")]
pub struct NotFoundTemplate {
    pub site_title: &'static str,
}
