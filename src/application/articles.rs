//! Article use cases shared by the public pages and the write API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::{info, instrument};

use super::error::AppError;
use super::repos::{RepoError, Repository};
use crate::cache::deps;
use crate::domain::articles::{Article, ArticleDraft};
use crate::invalidation::Model;

/// Predicate matching every article shown on the front page.
pub const PUBLISHED_TEST: &str = "published=true";

pub struct ArticleService {
    repo: Arc<dyn Repository<Article>>,
    next_id: AtomicU64,
}

impl ArticleService {
    pub fn new(repo: Arc<dyn Repository<Article>>) -> Self {
        Self {
            repo,
            next_id: AtomicU64::new(1),
        }
    }

    /// Published articles, newest first.
    ///
    /// The rendering page depends on every listed article and on any article
    /// that becomes published later.
    pub async fn list_published(&self) -> Result<Vec<Article>, AppError> {
        deps::record_test(Article::LABEL, PUBLISHED_TEST);

        let mut articles: Vec<Article> = self
            .repo
            .list()
            .await?
            .into_iter()
            .filter(|article| article.published)
            .collect();
        articles.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        for article in &articles {
            deps::record_instance(Arc::new(article.clone()));
        }
        Ok(articles)
    }

    pub async fn get_published(&self, id: u64) -> Result<Article, AppError> {
        match self.repo.get(&id.to_string()).await? {
            Some(article) if article.published => {
                deps::record_instance(Arc::new(article.clone()));
                Ok(article)
            }
            _ => Err(AppError::NotFound),
        }
    }

    pub async fn get(&self, id: u64) -> Result<Article, AppError> {
        self.repo
            .get(&id.to_string())
            .await?
            .ok_or(AppError::NotFound)
    }

    #[instrument(skip_all, fields(title = %draft.title))]
    pub async fn create(&self, draft: ArticleDraft) -> Result<Article, AppError> {
        draft.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let article = Article::from_draft(id, draft, OffsetDateTime::now_utc());
        let saved = self.repo.save(article).await?;
        info!(id = saved.id, "article created");
        Ok(saved)
    }

    #[instrument(skip(self, draft))]
    pub async fn update(&self, id: u64, draft: ArticleDraft) -> Result<Article, AppError> {
        draft.validate()?;
        let mut article = self.get(id).await?;
        article.apply(draft, OffsetDateTime::now_utc());
        let saved = self.repo.save(article).await?;
        info!(id = saved.id, "article updated");
        Ok(saved)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, id: u64) -> Result<Article, AppError> {
        let removed = match self.repo.delete(&id.to_string()).await {
            Ok(article) => article,
            Err(RepoError::NotFound) => return Err(AppError::NotFound),
            Err(err) => return Err(err.into()),
        };
        info!(id, "article deleted");
        Ok(removed)
    }
}
