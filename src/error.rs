use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Coarse failure classes. Decided once, where the raw response is parsed,
/// and consulted by the scheduler and job instead of error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    RateLimitShort,
    RateLimitDaily,
    PermissionDenied,
    Transient,
    Fatal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::RateLimitShort => "RATE_LIMIT_SHORT",
            FailureKind::RateLimitDaily => "RATE_LIMIT_DAILY",
            FailureKind::PermissionDenied => "PERMISSION_DENIED",
            FailureKind::Transient => "TRANSIENT",
            FailureKind::Fatal => "FATAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Retries exhausted after {attempts} attempts for {url} (status {status:?}): {body}")]
    RetryExhausted {
        url: String,
        attempts: u32,
        status: Option<u16>,
        body: String,
    },

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Daily rate limit exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Request URI too long: {url}")]
    UriTooLong { url: String },

    #[error("Pagination error: {0}")]
    Pagination(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Document sink error: {0}")]
    Sink(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid sync unit: {0}")]
    InvalidSyncUnit(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::RateLimited(_) => FailureKind::RateLimitShort,
            Error::QuotaExceeded(_) => FailureKind::RateLimitDaily,
            Error::PermissionDenied(_) => FailureKind::PermissionDenied,
            Error::Http(_) | Error::RetryExhausted { .. } | Error::Timeout(_) => {
                FailureKind::Transient
            }
            _ => FailureKind::Fatal,
        }
    }

    /// Short description without URLs, bodies or unit details, so failures
    /// of the same cause collapse into one report entry.
    pub fn reason(&self) -> String {
        match self {
            Error::Http(_) => "http error".to_string(),
            Error::Api { status, .. } => format!("api status {status}"),
            Error::RetryExhausted { status: Some(status), .. } => {
                format!("retries exhausted (status {status})")
            }
            Error::RetryExhausted { status: None, .. } => "retries exhausted".to_string(),
            Error::RateLimited(_) => "rate limit exceeded".to_string(),
            Error::QuotaExceeded(_) => "daily rate limit exceeded".to_string(),
            Error::PermissionDenied(_) => "permission denied".to_string(),
            Error::UriTooLong { .. } => "request uri too long".to_string(),
            Error::Pagination(_) => "pagination error".to_string(),
            Error::MalformedResponse(_) => "malformed response".to_string(),
            Error::Sink(_) => "document sink error".to_string(),
            Error::Database(_) => "database error".to_string(),
            Error::Migration(_) => "migration error".to_string(),
            Error::Config(msg) => format!("configuration error: {msg}"),
            Error::Timeout(_) => "timed out".to_string(),
            Error::InvalidSyncUnit(_) => "invalid sync unit".to_string(),
            Error::Other(msg) => msg.clone(),
        }
    }

    /// Report key: failure class plus short reason.
    pub fn failure_key(&self) -> String {
        format!("{}: {}", self.kind(), self.reason())
    }

    /// True for failures that end the whole run rather than a single unit.
    pub fn aborts_job(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::RateLimitShort | FailureKind::RateLimitDaily
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<rusqlite_migration::Error> for Error {
    fn from(e: rusqlite_migration::Error) -> Self {
        Error::Migration(e.to_string())
    }
}

impl<E: fmt::Display> From<tokio_rusqlite::Error<E>> for Error {
    fn from(e: tokio_rusqlite::Error<E>) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedResponse(e.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            Error::RateLimited("x".into()).kind(),
            FailureKind::RateLimitShort
        );
        assert_eq!(
            Error::QuotaExceeded("x".into()).kind(),
            FailureKind::RateLimitDaily
        );
        assert_eq!(
            Error::PermissionDenied("x".into()).kind(),
            FailureKind::PermissionDenied
        );
        assert_eq!(Error::Timeout("x".into()).kind(), FailureKind::Transient);
        assert_eq!(
            Error::Api { status: 400, body: String::new() }.kind(),
            FailureKind::Fatal
        );
    }

    #[test]
    fn test_aborts_job_only_for_rate_limits() {
        assert!(Error::QuotaExceeded("daily".into()).aborts_job());
        assert!(Error::RateLimited("ten secondly".into()).aborts_job());
        assert!(!Error::PermissionDenied("denied".into()).aborts_job());
        assert!(!Error::Pagination("same offset".into()).aborts_job());
    }

    #[test]
    fn test_failure_key_drops_urls_and_bodies() {
        let a = Error::RetryExhausted {
            url: "https://graph.facebook.com/v3.2/act_1/insights?time_range=1".into(),
            attempts: 5,
            status: Some(503),
            body: "upstream".into(),
        };
        let b = Error::RetryExhausted {
            url: "https://graph.facebook.com/v3.2/act_2/insights?time_range=2".into(),
            attempts: 5,
            status: Some(503),
            body: "busy".into(),
        };
        assert_eq!(a.failure_key(), b.failure_key());
        assert_eq!(a.failure_key(), "TRANSIENT: retries exhausted (status 503)");
        assert_eq!(
            Error::RateLimited("https://api.linkedin.com/v2/x: throttled".into()).failure_key(),
            "RATE_LIMIT_SHORT: rate limit exceeded"
        );
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::RateLimitDaily.to_string(), "RATE_LIMIT_DAILY");
        assert_eq!(FailureKind::PermissionDenied.to_string(), "PERMISSION_DENIED");
    }
}
