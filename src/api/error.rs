use thiserror::Error;

/// Failures talking to the photo service API (metadata calls, not file
/// transfers).
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Not authenticated")]
    NotAuthenticated,
    #[error("Access forbidden: {0}")]
    Permission(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rate limit exceeded (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("API fault in {method}: {message}")]
    Fault { method: String, message: String },
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("No download URL available for photo: {0}")]
    NoDownloadUrl(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Http(reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(0)
        } else {
            ApiError::Http(e)
        }
    }
}

impl ApiError {
    /// Gallery-level failures that should be deferred to the retrieval queue
    /// instead of failing the gallery outright.
    pub fn is_deferrable(&self) -> bool {
        match self {
            ApiError::Timeout(_) => true,
            ApiError::Server { status, .. } => *status >= 500,
            ApiError::Fault { message, .. } => message.contains("500"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_deferrable() {
        assert!(ApiError::Timeout(120).is_deferrable());
    }

    #[test]
    fn test_server_500_is_deferrable() {
        let e = ApiError::Server {
            status: 500,
            message: "Internal Server Error".into(),
        };
        assert!(e.is_deferrable());
    }

    #[test]
    fn test_not_found_is_not_deferrable() {
        assert!(!ApiError::NotFound("gallery 7".into()).is_deferrable());
        assert!(!ApiError::Authentication("bad password".into()).is_deferrable());
    }
}
