use std::time::Duration;

use serde_json::{json, Value};

use crate::config::Environment;
use crate::http::{HttpRequest, RetryPolicy, RetryingHttpClient};
use crate::metrics::RunReport;

pub const DEFAULT_HEALTHCHECK_BASE: &str = "https://hc-ping.com";
const PING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub env: Environment,
    pub healthcheck_base: String,
    pub ping_id: Option<String>,
    pub token_failure_ping_id: Option<String>,
    /// Alerting endpoint for job-level problems (rate-limit aborts).
    pub notify_url: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            env: Environment::Development,
            healthcheck_base: DEFAULT_HEALTHCHECK_BASE.to_string(),
            ping_id: None,
            token_failure_ping_id: None,
            notify_url: None,
        }
    }
}

/// Posts run outcomes to the healthcheck service. Outside production every
/// message is only logged. Delivery failures never fail the run.
pub struct HealthcheckNotifier {
    client: RetryingHttpClient,
    config: NotifierConfig,
}

impl HealthcheckNotifier {
    pub fn new(client: &RetryingHttpClient, config: NotifierConfig) -> Self {
        Self {
            client: client.with_policy(RetryPolicy::fixed(1, Duration::ZERO)),
            config,
        }
    }

    pub fn ping_url(&self, ping_id: &str, failed: bool) -> String {
        let base = self.config.healthcheck_base.trim_end_matches('/');
        if failed {
            format!("{base}/{ping_id}/fail")
        } else {
            format!("{base}/{ping_id}")
        }
    }

    pub async fn ping(&self, ping_id: &str, message: &Value, failed: bool) {
        let url = self.ping_url(ping_id, failed);
        if !self.config.env.is_production() {
            log::info!("Healthcheck ping skipped outside production: {url} {message}");
            return;
        }
        let request = HttpRequest::post_json(url.as_str(), message.clone()).with_timeout(PING_TIMEOUT);
        if let Err(e) = self.client.request(request).await {
            log::error!("Failed to ping healthcheck {url}: {e}");
        }
    }

    /// Final report: the main check (with `/fail` on any failure) and the
    /// token-failure check when credentials were refused.
    pub async fn report(&self, report: &RunReport) {
        let message = match serde_json::to_value(report) {
            Ok(v) => v,
            Err(e) => {
                log::error!("Failed to serialize run report: {e}");
                json!({ "message": report.message })
            }
        };

        match &self.config.ping_id {
            Some(id) => self.ping(id, &message, report.has_failures()).await,
            None => log::info!("No healthcheck configured, report: {message}"),
        }

        if report.has_token_failures() {
            if let Some(id) = &self.config.token_failure_ping_id {
                let token_message = json!({
                    "platform": report.platform,
                    "token_failures": report.token_failures,
                });
                self.ping(id, &token_message, true).await;
            }
        }
    }

    pub async fn notify(&self, source: &str, message: &str) {
        let payload = json!({
            "env": self.config.env.as_str(),
            "message": message,
            "source": source,
        });
        let Some(url) = &self.config.notify_url else {
            log::warn!("{source}: {message}");
            return;
        };
        if !self.config.env.is_production() {
            log::warn!("Notification skipped outside production: {payload}");
            return;
        }
        let request = HttpRequest::post_json(url.as_str(), payload).with_timeout(PING_TIMEOUT);
        if let Err(e) = self.client.request(request).await {
            log::error!("Failed to send notification from {source}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http::{HttpResponse, MockHttpTransport};
    use crate::metrics::RunStats;

    fn notifier(mock: MockHttpTransport, env: Environment) -> HealthcheckNotifier {
        let client = RetryingHttpClient::new(Arc::new(mock), RetryPolicy::immediate(3));
        HealthcheckNotifier::new(
            &client,
            NotifierConfig {
                env,
                ping_id: Some("abc".into()),
                token_failure_ping_id: Some("tok".into()),
                notify_url: Some("https://notify.test/v1/notify".into()),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_success_pings_plain_url() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|req| req.url == "https://hc-ping.com/abc" && req.timeout == Some(PING_TIMEOUT))
            .returning(|_| Ok(HttpResponse::new(200, "OK")));
        let mut stats = RunStats::new();
        stats.record_success(1, "a", "ads");
        notifier(mock, Environment::Production)
            .report(&stats.report("adwords", "production"))
            .await;
    }

    #[tokio::test]
    async fn test_failures_ping_fail_and_token_channel() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .withf(|req| req.url == "https://hc-ping.com/abc/fail")
            .returning(|_| Ok(HttpResponse::new(200, "OK")));
        mock.expect_send()
            .times(1)
            .withf(|req| req.url == "https://hc-ping.com/tok/fail")
            .returning(|_| Ok(HttpResponse::new(200, "OK")));
        let mut stats = RunStats::new();
        stats.record_token_failure(1, "ads", "expired");
        notifier(mock, Environment::Production)
            .report(&stats.report("adwords", "production"))
            .await;
    }

    #[tokio::test]
    async fn test_non_production_only_logs() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send().never();
        let n = notifier(mock, Environment::Development);
        let mut stats = RunStats::new();
        stats.record_failure(1, "ads", "boom");
        n.report(&stats.report("adwords", "development")).await;
        n.notify("adwords_sync", "rate limited").await;
    }

    #[tokio::test]
    async fn test_delivery_failure_is_swallowed() {
        let mut mock = MockHttpTransport::new();
        mock.expect_send()
            .times(1)
            .returning(|_| Ok(HttpResponse::new(500, "down")));
        notifier(mock, Environment::Production)
            .notify("hubspot_sync", "daily limit")
            .await;
    }

    #[test]
    fn test_ping_url_trims_base() {
        let client = RetryingHttpClient::new(Arc::new(MockHttpTransport::new()), RetryPolicy::immediate(1));
        let n = HealthcheckNotifier::new(
            &client,
            NotifierConfig {
                healthcheck_base: "https://hc.example/".into(),
                ..Default::default()
            },
        );
        assert_eq!(n.ping_url("id", false), "https://hc.example/id");
        assert_eq!(n.ping_url("id", true), "https://hc.example/id/fail");
    }
}
