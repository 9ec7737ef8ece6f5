pub mod data_service;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::AllowList;
use crate::error::Result;
use crate::sync::unit::{AccountSettings, LastSyncInfo};

pub use data_service::DataService;

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MIN_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 500;

/// One document as the data service stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub project_id: u64,
    #[serde(rename = "customer_acc_id")]
    pub account_id: String,
    #[serde(rename = "type_alias")]
    pub document_type: String,
    pub id: String,
    pub value: Value,
    pub timestamp: i64,
    /// Breakdown the row belongs to, for types split by platform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Document {
    /// What the data service deduplicates on.
    pub fn identity(&self) -> (&str, &str, i64, Option<&str>) {
        (
            self.id.as_str(),
            self.document_type.as_str(),
            self.timestamp,
            self.platform.as_deref(),
        )
    }
}

/// Document types whose rows come in one aggregate series plus one series
/// per platform breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformSplit {
    /// Row field naming the platform.
    pub field: &'static str,
    /// Platform of the aggregate rows; its sync marker drives the schedule.
    pub aggregate: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Created,
    /// 409 from the data service; counted as success.
    AlreadyExists,
    DryRun,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentSink: Send + Sync {
    async fn add(&self, document: Document) -> Result<SinkOutcome>;

    async fn add_batch(
        &self,
        project_id: u64,
        document_type: String,
        documents: Vec<Document>,
    ) -> Result<SinkOutcome>;
}

/// Read side of the data service: account settings and sync markers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncStateSource: Send + Sync {
    async fn account_settings(&self) -> Result<Vec<AccountSettings>>;

    async fn last_sync_info(&self, project_id: u64, account_id: String) -> Result<Vec<LastSyncInfo>>;

    async fn update_access_token(&self, project_id: u64, access_token: String) -> Result<()>;
}

/// When to use `add_batch` instead of one request per document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub size: usize,
    pub projects: AllowList,
    pub document_types: AllowList,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_BATCH_SIZE,
            projects: AllowList::none(),
            document_types: AllowList::none(),
        }
    }
}

impl BatchConfig {
    pub fn new(size: usize, projects: AllowList, document_types: AllowList) -> Self {
        Self {
            size: size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE),
            projects,
            document_types,
        }
    }

    pub fn enabled_for(&self, project_id: u64, document_type: &str) -> bool {
        self.projects.contains_project(project_id) && self.document_types.contains(document_type)
    }
}

/// Where a set of rows goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub project_id: u64,
    pub account_id: String,
    pub document_type: String,
    pub id_field: String,
    pub timestamp: i64,
    pub platform: Option<PlatformSplit>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub created: usize,
    pub already_existing: usize,
    pub dry_run: usize,
    pub placeholder: bool,
}

impl WriteSummary {
    fn count(&mut self, outcome: SinkOutcome, n: usize) {
        match outcome {
            SinkOutcome::Created => self.created += n,
            SinkOutcome::AlreadyExists => self.already_existing += n,
            SinkOutcome::DryRun => self.dry_run += n,
        }
    }
}

/// Turns fetched rows into documents and hands them to the sink.
#[derive(Clone)]
pub struct DocumentWriter {
    sink: Arc<dyn DocumentSink>,
    batch: BatchConfig,
}

impl DocumentWriter {
    pub fn new(sink: Arc<dyn DocumentSink>, batch: BatchConfig) -> Self {
        Self { sink, batch }
    }

    /// Write all rows for one unit. An empty row set still writes a single
    /// placeholder document so the remote marker advances.
    pub async fn add_all(&self, target: &WriteTarget, rows: Vec<Value>) -> Result<WriteSummary> {
        let mut summary = WriteSummary::default();

        if rows.is_empty() {
            let placeholder = self.document(target, placeholder_id(), Value::Object(Map::new()));
            log::info!(
                "No rows for project {} {} {}, writing placeholder",
                target.project_id,
                target.account_id,
                target.document_type
            );
            let outcome = self.sink.add(placeholder).await?;
            summary.count(outcome, 1);
            summary.placeholder = true;
            return Ok(summary);
        }

        let documents: Vec<Document> = rows
            .into_iter()
            .map(|row| {
                let id = document_id(&row, &target.id_field).unwrap_or_else(placeholder_id);
                self.document(target, id, row)
            })
            .collect();

        if self.batch.enabled_for(target.project_id, &target.document_type) {
            let size = self.batch.size.max(1);
            for chunk in documents.chunks(size) {
                let outcome = self
                    .sink
                    .add_batch(target.project_id, target.document_type.clone(), chunk.to_vec())
                    .await?;
                summary.count(outcome, chunk.len());
            }
        } else {
            for document in documents {
                let outcome = self.sink.add(document).await?;
                summary.count(outcome, 1);
            }
        }
        Ok(summary)
    }

    fn document(&self, target: &WriteTarget, id: String, value: Value) -> Document {
        let platform = target.platform.map(|split| {
            value
                .get(split.field)
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .unwrap_or(split.aggregate)
                .to_string()
        });
        Document {
            project_id: target.project_id,
            account_id: target.account_id.clone(),
            document_type: target.document_type.clone(),
            id,
            value,
            timestamp: target.timestamp,
            platform,
        }
    }
}

fn document_id(row: &Value, id_field: &str) -> Option<String> {
    match row.get(id_field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn placeholder_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn target() -> WriteTarget {
        WriteTarget {
            project_id: 7,
            account_id: "123".into(),
            document_type: "campaigns".into(),
            id_field: "id".into(),
            timestamp: 20240102,
            platform: None,
        }
    }

    #[tokio::test]
    async fn test_empty_rows_write_one_placeholder() {
        let mut sink = MockDocumentSink::new();
        sink.expect_add()
            .times(1)
            .withf(|doc| doc.id.len() == 8 && doc.value == json!({}) && doc.timestamp == 20240102)
            .returning(|_| Ok(SinkOutcome::Created));
        sink.expect_add_batch().never();

        let writer = DocumentWriter::new(Arc::new(sink), BatchConfig::default());
        let summary = writer.add_all(&target(), vec![]).await.unwrap();
        assert!(summary.placeholder);
        assert_eq!(summary.created, 1);
    }

    #[tokio::test]
    async fn test_rows_written_individually_with_ids() {
        let mut sink = MockDocumentSink::new();
        sink.expect_add().times(2).returning(|doc| {
            if doc.id == "2" {
                Ok(SinkOutcome::AlreadyExists)
            } else {
                Ok(SinkOutcome::Created)
            }
        });

        let writer = DocumentWriter::new(Arc::new(sink), BatchConfig::default());
        let summary = writer
            .add_all(&target(), vec![json!({"id": "1"}), json!({"id": 2})])
            .await
            .unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.already_existing, 1);
        assert!(!summary.placeholder);
    }

    #[tokio::test]
    async fn test_batch_mode_chunks() {
        let mut sink = MockDocumentSink::new();
        sink.expect_add().never();
        sink.expect_add_batch()
            .times(3)
            .withf(|project, doc_type, docs| *project == 7 && doc_type == "campaigns" && docs.len() <= 100)
            .returning(|_, _, _| Ok(SinkOutcome::Created));

        let batch = BatchConfig::new(100, AllowList::parse("7"), AllowList::parse("*"));
        let writer = DocumentWriter::new(Arc::new(sink), batch);
        let rows: Vec<Value> = (0..250).map(|i| json!({ "id": i })).collect();
        let summary = writer.add_all(&target(), rows).await.unwrap();
        assert_eq!(summary.created, 250);
    }

    #[tokio::test]
    async fn test_sink_error_propagates() {
        let mut sink = MockDocumentSink::new();
        sink.expect_add()
            .returning(|_| Err(crate::error::Error::Sink("down".into())));
        let writer = DocumentWriter::new(Arc::new(sink), BatchConfig::default());
        assert!(writer.add_all(&target(), vec![json!({"id": 1})]).await.is_err());
    }

    #[tokio::test]
    async fn test_platform_breakdown_rows_are_distinct_documents() {
        let documents = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = documents.clone();
        let mut sink = MockDocumentSink::new();
        sink.expect_add().times(3).returning(move |doc| {
            seen.lock().unwrap().push(doc);
            Ok(SinkOutcome::Created)
        });

        let mut target = target();
        target.document_type = "campaign_insights".into();
        target.id_field = "campaign_id".into();
        target.platform = Some(PlatformSplit {
            field: "platform",
            aggregate: "facebook_all",
        });
        let writer = DocumentWriter::new(Arc::new(sink), BatchConfig::default());
        writer
            .add_all(
                &target,
                vec![
                    json!({"campaign_id": "9", "platform": "facebook_all"}),
                    json!({"campaign_id": "9", "platform": "instagram"}),
                    json!({"campaign_id": "9"}),
                ],
            )
            .await
            .unwrap();

        let documents = documents.lock().unwrap();
        assert_eq!(documents[0].platform.as_deref(), Some("facebook_all"));
        assert_eq!(documents[1].platform.as_deref(), Some("instagram"));
        assert_eq!(documents[2].platform.as_deref(), Some("facebook_all"));
        assert_ne!(documents[0].identity(), documents[1].identity());
        assert_eq!(
            serde_json::to_value(&documents[1]).unwrap()["platform"],
            "instagram"
        );
    }

    #[test]
    fn test_batch_config() {
        let batch = BatchConfig::new(1000, AllowList::parse("1,2"), AllowList::parse("contact"));
        assert_eq!(batch.size, MAX_BATCH_SIZE);
        assert!(batch.enabled_for(1, "contact"));
        assert!(!batch.enabled_for(3, "contact"));
        assert!(!batch.enabled_for(1, "deal"));
        assert_eq!(BatchConfig::new(10, AllowList::All, AllowList::All).size, MIN_BATCH_SIZE);
        assert!(!BatchConfig::default().enabled_for(1, "contact"));
    }

    #[test]
    fn test_document_id() {
        assert_eq!(document_id(&json!({"vid": 42}), "vid"), Some("42".into()));
        assert_eq!(document_id(&json!({"id": ""}), "id"), None);
        assert_eq!(document_id(&json!({"name": "x"}), "id"), None);
    }

    #[test]
    fn test_document_serializes_with_service_field_names() {
        let doc = Document {
            project_id: 1,
            account_id: "a".into(),
            document_type: "ads".into(),
            id: "x".into(),
            value: json!({"k": 1}),
            timestamp: 20240101,
            platform: None,
        };
        let v = serde_json::to_value(&doc).unwrap();
        assert_eq!(v["customer_acc_id"], "a");
        assert_eq!(v["type_alias"], "ads");
        assert!(v.get("platform").is_none());
    }
}
