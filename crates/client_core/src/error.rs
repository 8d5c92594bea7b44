use shared::error::ApiError;
use thiserror::Error;

use crate::views::VoteGuard;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The server rejected the request.
    #[error("{}", .0.message)]
    Api(ApiError),
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected response ({status}): {body}")]
    Unexpected { status: u16, body: String },
    #[error("subscription failed: {0}")]
    Subscription(String),
    #[error("invalid server url: {0}")]
    Url(#[from] url::ParseError),
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Guard(#[from] VoteGuard),
}

impl ClientError {
    pub fn api(&self) -> Option<&ApiError> {
        match self {
            ClientError::Api(err) => Some(err),
            _ => None,
        }
    }
}
