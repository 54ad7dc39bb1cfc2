use thiserror::Error;

use crate::retry::{BreakerError, ErrorClass};

/// Typed download errors enabling retry classification.
///
/// [`DownloadError::class`] maps each failure onto the retry policy: auth,
/// permission and not-found faults are final, rate limits carry the server's
/// delay, timeouts escalate to the retrieval queue once they persist, and
/// everything transient (network, 5xx, truncated or corrupt files) is retried.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Authentication required - token may have expired")]
    Authentication,

    #[error("Access forbidden")]
    Permission,

    #[error("File not found on server")]
    NotFound,

    #[error("Rate limit exceeded (retry after {retry_after}s)")]
    RateLimit { retry_after: u64 },

    /// 5xx responses. `message` is already user-facing.
    #[error("{message}")]
    Server { status: u16, message: String },

    #[error("HTTP {status}")]
    HttpStatus { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Download timeout: {0}")]
    Timeout(String),

    #[error("File integrity check failed for {path}: {reasons}")]
    Integrity { path: String, reasons: String },

    #[error("Disk error: {0}")]
    Disk(#[from] std::io::Error),

    /// The run was stopped before this download started.
    #[error("Download stopped")]
    Stopped,

    /// The run was stopped mid-transfer.
    #[error("Download cancelled")]
    Cancelled,

    #[error("Circuit breaker is open")]
    CircuitOpen,
}

impl DownloadError {
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout(e.to_string())
        } else {
            DownloadError::Network(e.to_string())
        }
    }

    /// Build the error for a 5xx response from its body text.
    ///
    /// HTML error pages (typically from the CDN) are summarized instead of
    /// echoed.
    pub fn server(status: u16, body: &str) -> Self {
        let lower = body.to_ascii_lowercase();
        let message = if lower.contains("cloudflare") || lower.contains("<html>") {
            format!("Server temporarily unavailable (HTTP {status})")
        } else {
            let snippet: String = body.chars().take(100).collect();
            format!("Server error {status}: {snippet}")
        };
        DownloadError::Server { status, message }
    }

    /// Map a non-200 response status onto the taxonomy.
    pub fn from_status(status: u16, retry_after: Option<u64>, body: &str) -> Self {
        match status {
            401 => DownloadError::Authentication,
            403 => DownloadError::Permission,
            404 => DownloadError::NotFound,
            429 => DownloadError::RateLimit {
                retry_after: retry_after.unwrap_or(60),
            },
            s if s >= 500 => DownloadError::server(s, body),
            s => DownloadError::HttpStatus { status: s },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            DownloadError::RateLimit { retry_after } => ErrorClass::RateLimited {
                retry_after: Some(std::time::Duration::from_secs(*retry_after)),
            },
            DownloadError::Timeout(_) => ErrorClass::Timeout,
            DownloadError::Server { .. }
            | DownloadError::Network(_)
            | DownloadError::Integrity { .. } => ErrorClass::Transient,
            // Unexpected 1xx/3xx responses may be a flaky edge; 4xx won't change.
            DownloadError::HttpStatus { status } if *status < 400 => ErrorClass::Transient,
            DownloadError::HttpStatus { .. }
            | DownloadError::Authentication
            | DownloadError::Permission
            | DownloadError::NotFound
            | DownloadError::Disk(_)
            | DownloadError::Stopped
            | DownloadError::Cancelled
            | DownloadError::CircuitOpen => ErrorClass::Fatal,
        }
    }

    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.class() != ErrorClass::Fatal
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DownloadError::Timeout(_))
    }

    /// Whether the run's stop flag produced this error.
    pub fn is_stop(&self) -> bool {
        matches!(self, DownloadError::Stopped | DownloadError::Cancelled)
    }
}

impl BreakerError for DownloadError {
    fn circuit_open() -> Self {
        DownloadError::CircuitOpen
    }

    fn trips_breaker(&self) -> bool {
        !self.is_stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_404_not_retryable() {
        assert!(!DownloadError::from_status(404, None, "").is_retryable());
    }

    #[test]
    fn test_http_401_not_retryable() {
        let e = DownloadError::from_status(401, None, "");
        assert!(matches!(e, DownloadError::Authentication));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_http_403_not_retryable() {
        assert!(!DownloadError::from_status(403, None, "").is_retryable());
    }

    #[test]
    fn test_http_429_uses_retry_after() {
        let e = DownloadError::from_status(429, Some(17), "");
        assert_eq!(
            e.class(),
            ErrorClass::RateLimited {
                retry_after: Some(std::time::Duration::from_secs(17))
            }
        );
    }

    #[test]
    fn test_http_429_defaults_to_sixty_seconds() {
        let e = DownloadError::from_status(429, None, "");
        assert!(matches!(e, DownloadError::RateLimit { retry_after: 60 }));
    }

    #[test]
    fn test_http_500_retryable_with_body_snippet() {
        let body = "x".repeat(300);
        let e = DownloadError::from_status(500, None, &body);
        assert!(e.is_retryable());
        assert_eq!(e.to_string(), format!("Server error 500: {}", "x".repeat(100)));
    }

    #[test]
    fn test_http_503_html_page_summarized() {
        let e = DownloadError::from_status(503, None, "<html><body>Cloudflare</body></html>");
        assert_eq!(e.to_string(), "Server temporarily unavailable (HTTP 503)");
        assert!(matches!(e, DownloadError::Server { status: 503, .. }));
    }

    #[test]
    fn test_other_4xx_not_retryable() {
        let e = DownloadError::from_status(410, None, "");
        assert_eq!(e.to_string(), "HTTP 410");
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_timeout_classified_as_timeout() {
        let e = DownloadError::Timeout("deadline elapsed".into());
        assert_eq!(e.class(), ErrorClass::Timeout);
        assert!(e.is_timeout());
    }

    #[test]
    fn test_integrity_retryable() {
        let e = DownloadError::Integrity {
            path: "x".into(),
            reasons: "File is empty".into(),
        };
        assert!(e.is_retryable());
    }

    #[test]
    fn test_disk_not_retryable() {
        let e = DownloadError::Disk(std::io::Error::other("disk full"));
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_stop_does_not_trip_breaker() {
        assert!(!DownloadError::Stopped.trips_breaker());
        assert!(!DownloadError::Cancelled.trips_breaker());
        assert!(DownloadError::NotFound.trips_breaker());
    }
}
