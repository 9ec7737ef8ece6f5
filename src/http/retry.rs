use std::sync::Arc;
use std::time::Duration;

use super::{classify, Classification, HttpRequest, HttpResponse, HttpTransport, TransportError};
use crate::error::{Error, Result};

/// Bounded, fixed-delay retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Delay after a failed connection, usually longer than `delay`.
    pub connect_delay: Duration,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            connect_delay: delay,
        }
    }

    /// No sleeping between attempts (for tests).
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    pub const fn with_connect_delay(mut self, connect_delay: Duration) -> Self {
        self.connect_delay = connect_delay;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryReason {
    RateLimit,
    Transient,
    Connect,
}

/// Outcome of one attempt.
#[derive(Debug)]
enum Attempt {
    Done(HttpResponse),
    Retry {
        reason: RetryReason,
        status: Option<u16>,
        detail: String,
    },
    Fail(Error),
}

/// HTTP client that classifies every response and retries the retryable
/// ones with a fixed delay.
#[derive(Clone)]
pub struct RetryingHttpClient {
    transport: Arc<dyn HttpTransport>,
    policy: RetryPolicy,
}

impl RetryingHttpClient {
    pub fn new(transport: Arc<dyn HttpTransport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    /// Same transport, different policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let attempts = self.policy.max_attempts.max(1);
        let mut last: Option<(RetryReason, Option<u16>, String)> = None;

        for attempt in 1..=attempts {
            match self.attempt(&request).await {
                Attempt::Done(response) => return Ok(response),
                Attempt::Fail(e) => return Err(e),
                Attempt::Retry {
                    reason,
                    status,
                    detail,
                } => {
                    log::warn!(
                        "Request to {} failed ({reason:?}, status {status:?}), attempt {attempt}/{attempts}: {detail}",
                        redact(&request.url)
                    );
                    if attempt < attempts {
                        self.backoff(reason).await;
                    }
                    last = Some((reason, status, detail));
                }
            }
        }

        Err(match last {
            Some((RetryReason::RateLimit, _, detail)) => {
                Error::RateLimited(format!("{}: {detail}", redact(&request.url)))
            }
            Some((_, status, detail)) => Error::RetryExhausted {
                url: redact(&request.url),
                attempts,
                status,
                body: detail,
            },
            None => Error::Other(format!("no attempt made for {}", redact(&request.url))),
        })
    }

    async fn attempt(&self, request: &HttpRequest) -> Attempt {
        let response = match self.transport.send(request.clone()).await {
            Ok(response) => response,
            Err(TransportError::Invalid(msg)) => return Attempt::Fail(Error::Http(msg)),
            Err(e @ TransportError::Timeout(_)) => {
                return Attempt::Retry {
                    reason: RetryReason::Transient,
                    status: None,
                    detail: e.to_string(),
                }
            }
            Err(e @ TransportError::Connect(_)) => {
                return Attempt::Retry {
                    reason: RetryReason::Connect,
                    status: None,
                    detail: e.to_string(),
                }
            }
        };

        let status = Some(response.status);
        match classify(&response) {
            Classification::Success => Attempt::Done(response),
            Classification::RateLimitShort(detail) => Attempt::Retry {
                reason: RetryReason::RateLimit,
                status,
                detail,
            },
            Classification::Transient(detail) => Attempt::Retry {
                reason: RetryReason::Transient,
                status,
                detail,
            },
            Classification::RateLimitDaily(detail) => Attempt::Fail(Error::QuotaExceeded(detail)),
            Classification::PermissionDenied(detail) => {
                Attempt::Fail(Error::PermissionDenied(detail))
            }
            Classification::UriTooLong => Attempt::Fail(Error::UriTooLong {
                url: redact(&request.url),
            }),
            Classification::Fatal(_) => Attempt::Fail(Error::Api {
                status: response.status,
                body: response.body,
            }),
        }
    }

    async fn backoff(&self, reason: RetryReason) {
        let wait = match reason {
            RetryReason::Connect => self.policy.connect_delay,
            RetryReason::RateLimit | RetryReason::Transient => self.policy.delay,
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Strip credentials carried in query strings before a URL is logged.
pub(crate) fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            let pairs: Vec<(String, String)> = parsed
                .query_pairs()
                .map(|(k, v)| {
                    let secret = matches!(
                        k.as_ref(),
                        "hapikey" | "access_token" | "oauth2_access_token" | "client_secret"
                            | "refresh_token"
                    );
                    let v = if secret { "***".to_string() } else { v.into_owned() };
                    (k.into_owned(), v)
                })
                .collect();
            if pairs.is_empty() {
                return parsed.to_string();
            }
            parsed.query_pairs_mut().clear().extend_pairs(pairs);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::http::MockHttpTransport;

    fn client_with(mock: MockHttpTransport, attempts: u32) -> RetryingHttpClient {
        RetryingHttpClient::new(Arc::new(mock), RetryPolicy::immediate(attempts))
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(200, "{}")));
        let client = client_with(mock, 3);
        let resp = client.request(HttpRequest::get("https://api.test/x")).await.unwrap();
        assert_eq!(resp.status, 200);
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let mut mock = MockHttpTransport::new();
        let mut calls = 0;
        mock.expect_send().times(3).returning(move |_| {
            calls += 1;
            match calls {
                1 => Err(TransportError::Connect("reset".into())),
                2 => Ok(HttpResponse::new(503, "unavailable")),
                _ => Ok(HttpResponse::new(200, "ok")),
            }
        });
        let client = client_with(mock, 3);
        let resp = client.request(HttpRequest::get("https://api.test/x")).await.unwrap();
        assert_eq!(resp.body, "ok");
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(3)
            .returning(|_| Ok(HttpResponse::new(500, "boom")));
        let client = client_with(mock, 3);
        let err = client
            .request(HttpRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        match err {
            Error::RetryExhausted {
                attempts, status, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(status, Some(500));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_short_rate_limit_exhaustion_aborts() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send().times(2).returning(|_| {
            Ok(HttpResponse::new(
                429,
                r#"{"errorType":"RATE_LIMIT","policyName":"TEN_SECONDLY_ROLLING"}"#,
            ))
        });
        let client = client_with(mock, 2);
        let err = client
            .request(HttpRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimitShort);
        assert!(err.aborts_job());
    }

    #[tokio::test]
    async fn test_daily_rate_limit_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send().times(1).returning(|_| {
            Ok(HttpResponse::new(
                429,
                r#"{"errorType":"RATE_LIMIT","policyName":"DAILY"}"#,
            ))
        });
        let client = client_with(mock, 15);
        let err = client
            .request(HttpRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::RateLimitDaily);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(401, "unauthorized")));
        let client = client_with(mock, 5);
        let err = client
            .request(HttpRequest::get("https://api.test/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_uri_too_long_is_returned_to_caller() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(414, "")));
        let client = client_with(mock, 5);
        let err = client
            .request(HttpRequest::get("https://api.test/x?property=a"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UriTooLong { .. }));
    }

    #[tokio::test]
    async fn test_fatal_4xx_keeps_status() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(409, "exists")));
        let client = client_with(mock, 5);
        let err = client
            .request(HttpRequest::post_json("https://ds.test/add", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api { status: 409, .. }));
    }

    #[test]
    fn test_redact_hides_credentials() {
        let redacted = redact("https://api.hubapi.com/contacts?hapikey=secret&count=100");
        assert!(!redacted.contains("secret"));
        assert!(redacted.contains("count=100"));
    }
}
