use thiserror::Error;

use crate::{context::ContextError, error::TracedError};

use super::DataType;

#[derive(Debug, Error)]
pub enum FetchErrorKind {
    #[error(r#"Stored {data_type} with ID="{id}" not found."#)]
    NotFound { id: String, data_type: DataType },
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch deadline exceeded")]
    DeadlineExceeded,
    #[error("error contacting stored data endpoint: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stored data endpoint responded with status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("invalid stored data endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid ab_config: {0}")]
    InvalidAbConfig(String),
    #[error("stored data error: {0}")]
    Other(String),
}

impl From<ContextError> for FetchErrorKind {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::Cancelled => FetchErrorKind::Cancelled,
            ContextError::DeadlineExceeded => FetchErrorKind::DeadlineExceeded,
        }
    }
}

pub type FetchError = TracedError<FetchErrorKind>;

// it would be great to define this impl in error.rs, but it conflicts with the blanket
// `impl From<T> for T`
impl<E> From<E> for FetchError
where
    E: Into<FetchErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl FetchError {
    pub fn not_found(id: impl Into<String>, data_type: DataType) -> Self {
        Self::new(FetchErrorKind::NotFound { id: id.into(), data_type })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, FetchErrorKind::NotFound { .. })
    }

    /// The missing ID, for `NotFound` errors.
    pub fn not_found_id(&self) -> Option<(&str, DataType)> {
        match &self.kind {
            FetchErrorKind::NotFound { id, data_type } => Some((id.as_str(), *data_type)),
            _ => None,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, FetchErrorKind::Cancelled | FetchErrorKind::DeadlineExceeded)
    }

    /// Network level failures, as opposed to bad data or bad queries.
    pub fn is_network(&self) -> bool {
        match &self.kind {
            FetchErrorKind::Cancelled | FetchErrorKind::DeadlineExceeded => true,
            FetchErrorKind::Http(err) => err.is_timeout() || err.is_connect(),
            FetchErrorKind::Database(err) => {
                matches!(err, sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
            }
            _ => false,
        }
    }
}
