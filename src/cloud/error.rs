use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("unexpected response payload: {0}")]
    Decode(String),
}

impl CloudError {
    /// Transient errors are expected to resolve on retry; permanent ones
    /// need operator intervention (revoked credentials, deleted resource).
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Transport(_) => true,
            CloudError::Api { status, .. } => *status == 429 || *status >= 500,
            CloudError::Unauthorized(_) | CloudError::NotFound(_) | CloudError::Decode(_) => false,
        }
    }
}
