use thiserror::Error;

use cdp_session::SessionError;

#[derive(Debug, Error)]
pub enum ExtractorError {
    /// The page was mid-navigation when extraction started. Retryable
    /// after a short bounded wait; a partial element list is never
    /// returned in its place.
    #[error("extraction raced an in-flight navigation")]
    NavigationRace,

    /// The browser returned a tree or snapshot we could not make sense of.
    #[error("malformed dom payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ExtractorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExtractorError::NavigationRace)
    }
}
