use thiserror::Error;

/// Errors surfaced by the cache layer and its collaborators.
///
/// `Clone` so one in-flight result can be handed to every coalesced waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid response: {0}")]
    Decode(String),

    #[error("Background proxy unavailable")]
    ProxyUnavailable,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl CacheError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status {
            404 | 410 => CacheError::NotFound(truncated),
            429 => CacheError::Transport("Rate limited - please wait before retrying".to_string()),
            500..=599 => CacheError::Transport(format!("Server error {}: {}", status, truncated)),
            _ => CacheError::Decode(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Transport failures are the only ones a stale cached value may paper over.
    pub fn is_transport(&self) -> bool {
        matches!(self, CacheError::Transport(_))
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(err: reqwest::Error) -> Self {
        CacheError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Decode(err.to_string())
    }
}
