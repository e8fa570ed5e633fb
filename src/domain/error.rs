use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid `{field}`: {message}")]
    InvalidField { field: &'static str, message: String },
}

impl DomainError {
    pub fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            message: message.into(),
        }
    }
}
