// Repository trait for the backend widget collection
use crate::domain::widget::{ValidationError, Widget, WidgetSpec};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("backend responded with {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("backend unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected backend response: {0}")]
    MalformedResponse(String),

    #[error("dashboard session is closed")]
    SessionClosed,
}

impl PersistenceError {
    pub fn is_validation(&self) -> bool {
        matches!(self, PersistenceError::Validation(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WidgetRepository: Send + Sync {
    /// `POST /widgets`; the response echoes the submitted widget plus server fields.
    async fn create(&self, spec: &WidgetSpec) -> Result<Widget, PersistenceError>;

    /// `GET /widgets`
    async fn list(&self) -> Result<Vec<Widget>, PersistenceError>;

    /// `GET /widgets/{id}`; `None` when the backend reports not-found.
    async fn get(&self, id: &str) -> Result<Option<Widget>, PersistenceError>;
}
