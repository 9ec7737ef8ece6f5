pub mod types;

pub use types::*;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::sync::SyncStatus;

type Grouped = BTreeMap<String, BTreeMap<String, BTreeSet<u64>>>;

/// Run-scoped aggregation of outcomes. Owned by the run context.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    metrics: BTreeMap<(u64, String), DocTypeMetrics>,
    successes: BTreeMap<u64, BTreeSet<String>>,
    success_counts: BTreeMap<String, u64>,
    failures: Grouped,
    token_failures: Grouped,
    skipped: Grouped,
    aborted: Option<String>,
}

impl RunStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_requests(
        &mut self,
        project_id: u64,
        document_type: &str,
        requests: u64,
        records: u64,
        latency: Duration,
    ) {
        let entry = self
            .metrics
            .entry((project_id, document_type.to_string()))
            .or_default();
        entry.request_count += requests;
        entry.record_count += records;
        entry.latency_ms += latency.as_millis() as u64;
    }

    pub fn record_success(&mut self, project_id: u64, account_id: &str, document_type: &str) {
        self.successes
            .entry(project_id)
            .or_default()
            .insert(account_id.to_string());
        *self
            .success_counts
            .entry(document_type.to_string())
            .or_default() += 1;
    }

    pub fn record_failure(&mut self, project_id: u64, document_type: &str, message: &str) {
        insert_grouped(&mut self.failures, message, document_type, project_id);
    }

    pub fn record_token_failure(&mut self, project_id: u64, document_type: &str, message: &str) {
        insert_grouped(&mut self.token_failures, message, document_type, project_id);
    }

    pub fn record_skip(&mut self, project_id: u64, document_type: &str, reason: &str) {
        insert_grouped(&mut self.skipped, reason, document_type, project_id);
    }

    /// Keeps the first abort reason.
    pub fn record_abort(&mut self, message: &str) {
        if self.aborted.is_none() {
            self.aborted = Some(message.to_string());
        }
    }

    pub fn aborted(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub fn metrics_for(&self, project_id: u64, document_type: &str) -> Option<&DocTypeMetrics> {
        self.metrics.get(&(project_id, document_type.to_string()))
    }

    pub fn success_count(&self, document_type: &str) -> u64 {
        self.success_counts.get(document_type).copied().unwrap_or(0)
    }

    pub fn total_successes(&self) -> u64 {
        self.success_counts.values().sum()
    }

    /// Number of distinct (message, document type, project) failures.
    pub fn failure_count(&self) -> usize {
        count_grouped(&self.failures) + count_grouped(&self.token_failures)
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0 || self.aborted.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        if !self.has_failures() {
            SyncStatus::Success
        } else if self.aborted.is_none() && self.total_successes() > 0 {
            SyncStatus::PartialFailure
        } else {
            SyncStatus::Failed
        }
    }

    pub fn report(&self, platform: &str, env: &str) -> RunReport {
        let status = self.status();
        let message = match (&status, &self.aborted) {
            (_, Some(reason)) => format!("{platform} sync aborted: {reason}"),
            (SyncStatus::Success, None) => format!(
                "{platform} sync succeeded: {} units",
                self.total_successes()
            ),
            _ => format!(
                "{platform} sync finished with {} failures and {} successful units",
                self.failure_count(),
                self.total_successes()
            ),
        };
        RunReport {
            platform: platform.to_string(),
            env: env.to_string(),
            status,
            message,
            successes: self
                .successes
                .iter()
                .map(|(project, accounts)| (*project, accounts.iter().cloned().collect()))
                .collect(),
            success_counts: self.success_counts.clone(),
            failures: flatten(&self.failures),
            token_failures: flatten(&self.token_failures),
            skipped: flatten(&self.skipped),
            metrics: self
                .metrics
                .iter()
                .map(|((project_id, document_type), metrics)| MetricsEntry {
                    project_id: *project_id,
                    document_type: document_type.clone(),
                    metrics: metrics.clone(),
                })
                .collect(),
            aborted: self.aborted.clone(),
        }
    }
}

fn insert_grouped(map: &mut Grouped, message: &str, document_type: &str, project_id: u64) {
    map.entry(message.to_string())
        .or_default()
        .entry(document_type.to_string())
        .or_default()
        .insert(project_id);
}

fn count_grouped(map: &Grouped) -> usize {
    map.values()
        .flat_map(|by_type| by_type.values())
        .map(BTreeSet::len)
        .sum()
}

fn flatten(map: &Grouped) -> ProjectsByMessage {
    map.iter()
        .map(|(message, by_type)| {
            let by_type = by_type
                .iter()
                .map(|(doc_type, projects)| (doc_type.clone(), projects.iter().copied().collect()))
                .collect();
            (message.clone(), by_type)
        })
        .collect()
}
