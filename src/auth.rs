use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};

pub const LINKEDIN_VALIDATE_URL: &str = "https://api.linkedin.com/v2/me";
pub const LINKEDIN_TOKEN_URL: &str = "https://www.linkedin.com/oauth/v2/accessToken";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// The stored access token still works.
    Valid(String),
    /// A new access token was issued from the refresh token.
    Refreshed(String),
}

impl TokenStatus {
    pub fn token(&self) -> &str {
        match self {
            TokenStatus::Valid(t) | TokenStatus::Refreshed(t) => t,
        }
    }

    pub fn into_token(self) -> String {
        match self {
            TokenStatus::Valid(t) | TokenStatus::Refreshed(t) => t,
        }
    }

    pub fn was_refreshed(&self) -> bool {
        matches!(self, TokenStatus::Refreshed(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Returns a usable access token. Refusal of both the access token and
    /// the refresh token is reported as `Error::PermissionDenied`.
    async fn ensure_valid(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<TokenStatus>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Refresh-token grant against an OAuth2 token endpoint, optionally
/// preceded by a cheap validation call with the current access token.
pub struct OAuthRefresher {
    client: RetryingHttpClient,
    validate_url: Option<String>,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl OAuthRefresher {
    pub fn new(
        client: RetryingHttpClient,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            validate_url: None,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    pub fn linkedin(client: RetryingHttpClient, client_id: &str, client_secret: &str) -> Self {
        Self::new(client, LINKEDIN_TOKEN_URL, client_id, client_secret)
            .with_validate_url(LINKEDIN_VALIDATE_URL)
    }

    pub fn google(client: RetryingHttpClient, client_id: &str, client_secret: &str) -> Self {
        Self::new(client, GOOGLE_TOKEN_URL, client_id, client_secret)
    }

    pub fn with_validate_url(mut self, url: impl Into<String>) -> Self {
        self.validate_url = Some(url.into());
        self
    }

    async fn validate(&self, url: &str, access_token: &str) -> Result<bool> {
        let url = url::Url::parse_with_params(url, &[("oauth2_access_token", access_token)])?;
        match self.client.request(HttpRequest::get(url.as_str())).await {
            Ok(_) => Ok(true),
            Err(Error::PermissionDenied(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<String> {
        let fields = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
            ("client_id".to_string(), self.client_id.clone()),
            ("client_secret".to_string(), self.client_secret.clone()),
        ];
        let response = match self
            .client
            .request(HttpRequest::post_form(self.token_url.as_str(), fields))
            .await
        {
            Ok(r) => r,
            // A refused refresh token usually comes back as 400 invalid_grant.
            Err(Error::Api { status, body }) if (400..500).contains(&status) => {
                return Err(Error::PermissionDenied(format!(
                    "refresh token rejected (status {status}): {body}"
                )))
            }
            Err(e) => return Err(e),
        };
        let token: TokenResponse = response.json()?;
        if token.access_token.is_empty() {
            return Err(Error::PermissionDenied("empty access token in refresh response".into()));
        }
        Ok(token.access_token)
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn ensure_valid(
        &self,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<TokenStatus> {
        if let Some(url) = &self.validate_url {
            if !access_token.is_empty() && self.validate(url, &access_token).await? {
                return Ok(TokenStatus::Valid(access_token));
            }
        }

        let Some(refresh_token) = refresh_token.filter(|t| !t.trim().is_empty()) else {
            return Err(Error::PermissionDenied(
                "access token invalid and no refresh token available".into(),
            ));
        };
        log::info!("Refreshing access token via {}", self.token_url);
        self.refresh(&refresh_token).await.map(TokenStatus::Refreshed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::FailureKind;
    use crate::http::{Body, HttpResponse, Method, MockHttpTransport, RetryPolicy};

    fn client(mock: MockHttpTransport) -> RetryingHttpClient {
        RetryingHttpClient::new(Arc::new(mock), RetryPolicy::immediate(2))
    }

    #[tokio::test]
    async fn test_valid_token_is_kept() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|req| req.url.starts_with(LINKEDIN_VALIDATE_URL) && req.url.contains("oauth2_access_token=old"))
            .returning(|_| Ok(HttpResponse::new(200, "{}")));
        let refresher = OAuthRefresher::linkedin(client(mock), "id", "secret");
        let status = refresher
            .ensure_valid("old".into(), Some("refresh".into()))
            .await
            .unwrap();
        assert_eq!(status, TokenStatus::Valid("old".into()));
        assert!(!status.was_refreshed());
    }

    #[tokio::test]
    async fn test_invalid_token_is_refreshed() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|req| req.method == Method::Get)
            .returning(|_| Ok(HttpResponse::new(401, "expired")));
        mock.expect_send()
            .times(1)
            .withf(|req| {
                req.method == Method::Post
                    && req.url == LINKEDIN_TOKEN_URL
                    && matches!(&req.body, Some(Body::Form(fields))
                        if fields.contains(&("grant_type".to_string(), "refresh_token".to_string())))
            })
            .returning(|_| Ok(HttpResponse::new(200, r#"{"access_token": "new", "expires_in": 5184000}"#)));
        let refresher = OAuthRefresher::linkedin(client(mock), "id", "secret");
        let status = refresher
            .ensure_valid("old".into(), Some("refresh".into()))
            .await
            .unwrap();
        assert_eq!(status, TokenStatus::Refreshed("new".into()));
    }

    #[tokio::test]
    async fn test_rejected_refresh_is_permission_denied() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(400, r#"{"error": "invalid_grant"}"#)));
        let refresher = OAuthRefresher::google(client(mock), "id", "secret");
        let err = refresher
            .ensure_valid(String::new(), Some("refresh".into()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_missing_refresh_token() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(401, "expired")));
        let refresher = OAuthRefresher::linkedin(client(mock), "id", "secret");
        let err = refresher.ensure_valid("old".into(), None).await.unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_google_refresh_skips_validation() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|req| req.url == GOOGLE_TOKEN_URL)
            .returning(|_| Ok(HttpResponse::new(200, r#"{"access_token": "ya29"}"#)));
        let refresher = OAuthRefresher::google(client(mock), "id", "secret");
        let token = refresher
            .ensure_valid(String::new(), Some("refresh".into()))
            .await
            .unwrap()
            .into_token();
        assert_eq!(token, "ya29");
    }
}
