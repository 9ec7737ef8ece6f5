use std::collections::BTreeMap;

use serde::Serialize;

use crate::sync::SyncStatus;

/// Request, record and latency counters for one project and document type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DocTypeMetrics {
    pub request_count: u64,
    pub record_count: u64,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsEntry {
    pub project_id: u64,
    pub document_type: String,
    #[serde(flatten)]
    pub metrics: DocTypeMetrics,
}

/// message -> document type -> project ids.
pub type ProjectsByMessage = BTreeMap<String, BTreeMap<String, Vec<u64>>>;

/// Serializable summary of one run, posted to the healthcheck.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub platform: String,
    pub env: String,
    pub status: SyncStatus,
    pub message: String,
    pub successes: BTreeMap<u64, Vec<String>>,
    pub success_counts: BTreeMap<String, u64>,
    pub failures: ProjectsByMessage,
    pub token_failures: ProjectsByMessage,
    pub skipped: ProjectsByMessage,
    pub metrics: Vec<MetricsEntry>,
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn has_failures(&self) -> bool {
        self.status != SyncStatus::Success
    }

    pub fn has_token_failures(&self) -> bool {
        !self.token_failures.is_empty()
    }
}
