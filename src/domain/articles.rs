use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use super::error::DomainError;
use crate::invalidation::Model;

pub const HUMAN_DATE_FORMAT: &[FormatItem<'static>] =
    format_description!("[month repr:long] [day padding:none], [year]");

const MAX_TITLE_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: u64,
    pub title: String,
    pub section: String,
    pub body: String,
    pub published: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Article {
    pub fn from_draft(id: u64, draft: ArticleDraft, now: OffsetDateTime) -> Self {
        Self {
            id,
            title: draft.title.trim().to_string(),
            section: draft.section.trim().to_string(),
            body: draft.body,
            published: draft.published,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, draft: ArticleDraft, now: OffsetDateTime) {
        self.title = draft.title.trim().to_string();
        self.section = draft.section.trim().to_string();
        self.body = draft.body;
        self.published = draft.published;
        self.updated_at = now;
    }

    pub fn path(&self) -> String {
        format!("/articles/{}/", self.id)
    }

    pub fn human_date(&self) -> String {
        self.updated_at
            .format(HUMAN_DATE_FORMAT)
            .unwrap_or_else(|_| self.updated_at.date().to_string())
    }
}

impl Model for Article {
    const LABEL: &'static str = "article";

    fn pk(&self) -> String {
        self.id.to_string()
    }
}

/// Client-supplied article content.
#[derive(Debug, Clone, Deserialize)]
pub struct ArticleDraft {
    pub title: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub published: bool,
}

impl ArticleDraft {
    pub fn validate(&self) -> Result<(), DomainError> {
        let title = self.title.trim();
        if title.is_empty() {
            return Err(DomainError::invalid("title", "must not be empty"));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(DomainError::invalid(
                "title",
                format!("exceeds {MAX_TITLE_CHARS} characters"),
            ));
        }
        Ok(())
    }
}
