use async_trait::async_trait;
use serde_json::json;
use url::Url;

use super::{Document, DocumentSink, SinkOutcome, SyncStateSource};
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::sync::unit::{AccountSettings, LastSyncInfo};

/// HTTP client for the internal data service.
pub struct DataService {
    client: RetryingHttpClient,
    host: Url,
    platform: String,
    dry_run: bool,
}

impl DataService {
    pub fn new(client: RetryingHttpClient, host: &str, platform: &str, dry_run: bool) -> Result<Self> {
        let host = Url::parse(host)?;
        if host.cannot_be_a_base() {
            return Err(Error::Config(format!("data service host is not a base URL: {host}")));
        }
        Ok(Self {
            client,
            host,
            platform: platform.to_string(),
            dry_run,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/data_service/{}/{path}",
            self.host.as_str().trim_end_matches('/'),
            self.platform
        )
    }

    /// Wraps failures as sink errors, except the ones whose class the job
    /// acts on (rate limits abort, permission failures are cached).
    fn sink_error(&self, what: &str, e: Error) -> Error {
        match e {
            e @ (Error::RateLimited(_) | Error::QuotaExceeded(_) | Error::PermissionDenied(_)) => e,
            Error::Api { status, body } => Error::Sink(format!("{what} failed with status {status}: {body}")),
            other => Error::Sink(format!("{what} failed: {other}")),
        }
    }
}

#[async_trait]
impl DocumentSink for DataService {
    async fn add(&self, document: Document) -> Result<SinkOutcome> {
        if self.dry_run {
            log::info!(
                "Dry run, skipping add of {} {} for project {}",
                document.document_type,
                document.id,
                document.project_id
            );
            return Ok(SinkOutcome::DryRun);
        }

        let body = serde_json::to_value(&document)?;
        let request = HttpRequest::post_json(self.endpoint("documents/add"), body);
        match self.client.request(request).await {
            Ok(_) => Ok(SinkOutcome::Created),
            Err(Error::Api { status: 409, .. }) => Ok(SinkOutcome::AlreadyExists),
            Err(e) => Err(self.sink_error("documents/add", e)),
        }
    }

    async fn add_batch(
        &self,
        project_id: u64,
        document_type: String,
        documents: Vec<Document>,
    ) -> Result<SinkOutcome> {
        if self.dry_run {
            log::info!(
                "Dry run, skipping batch of {} {document_type} documents for project {project_id}",
                documents.len()
            );
            return Ok(SinkOutcome::DryRun);
        }

        let body = json!({
            "project_id": project_id,
            "doc_type": document_type,
            "documents": documents,
        });
        let request = HttpRequest::post_json(self.endpoint("documents/add_batch"), body);
        match self.client.request(request).await {
            Ok(_) => Ok(SinkOutcome::Created),
            Err(Error::Api { status: 409, .. }) => Ok(SinkOutcome::AlreadyExists),
            Err(e) => Err(self.sink_error("documents/add_batch", e)),
        }
    }
}

#[async_trait]
impl SyncStateSource for DataService {
    async fn account_settings(&self) -> Result<Vec<AccountSettings>> {
        let response = self
            .client
            .request(HttpRequest::get(self.endpoint("project/settings")))
            .await?;
        response.json()
    }

    async fn last_sync_info(&self, project_id: u64, account_id: String) -> Result<Vec<LastSyncInfo>> {
        let url = Url::parse_with_params(
            &self.endpoint("documents/last_sync_info"),
            &[
                ("project_id", project_id.to_string()),
                ("account_id", account_id),
            ],
        )?;
        let response = self.client.request(HttpRequest::get(url.as_str())).await?;
        response.json()
    }

    async fn update_access_token(&self, project_id: u64, access_token: String) -> Result<()> {
        if self.dry_run {
            log::info!("Dry run, not storing refreshed access token for project {project_id}");
            return Ok(());
        }
        let body = json!({ "project_id": project_id, "access_token": access_token });
        self.client
            .request(HttpRequest::put_json(self.endpoint("access_token"), body))
            .await
            .map(|_| ())
            .map_err(|e| self.sink_error("access_token", e))
    }
}
