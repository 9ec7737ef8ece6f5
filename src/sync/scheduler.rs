use chrono::NaiveDate;

use super::context::RunContext;
use super::range::{compute_range, compute_snapshot, weekly_windows, RangeBounds};
use super::unit::{AccountSettings, LastSyncInfo, SkipReason, SyncUnit};
use crate::date_util::TimestampFormat;
use crate::error::{Error, FailureKind, Result};
use crate::sink::PlatformSplit;

/// How a document type advances between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum History {
    /// One unit per missing day, up to yesterday.
    Daily,
    /// Current state only; one unit for today.
    Snapshot,
    /// The platform keeps its own cursor; one unit carrying the raw marker.
    Cursor,
    /// Monday to Sunday windows ending `buffer_weeks` before the last Sunday.
    Weekly { buffer_weeks: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentType {
    pub name: &'static str,
    pub history: History,
    /// Row field holding the document id.
    pub id_field: &'static str,
    pub platform: Option<PlatformSplit>,
    /// Snapshot types only: on the first sync, also write the snapshot
    /// under each day of the lookback window.
    pub backfill: bool,
}

impl DocumentType {
    pub const fn new(name: &'static str, history: History) -> Self {
        Self {
            name,
            history,
            id_field: "id",
            platform: None,
            backfill: false,
        }
    }

    pub const fn with_id_field(mut self, id_field: &'static str) -> Self {
        self.id_field = id_field;
        self
    }

    pub const fn with_platform(mut self, field: &'static str, aggregate: &'static str) -> Self {
        self.platform = Some(PlatformSplit { field, aggregate });
        self
    }

    pub const fn with_backfill(mut self) -> Self {
        self.backfill = true;
        self
    }

    /// Units dated today are still in progress, except cursor units, which
    /// are always dated today.
    pub fn dated(&self) -> bool {
        !matches!(self.history, History::Cursor)
    }
}

/// Units planned for one account, in execution order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub units: Vec<SyncUnit>,
    /// (document type, reason) for work dropped at plan time.
    pub skipped: Vec<(String, SkipReason)>,
}

/// What the job should do after a unit failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Continue,
    AbortJob,
}

pub struct SyncUnitScheduler {
    today: NaiveDate,
    format: TimestampFormat,
    max_lookback_days: u32,
    bounds: RangeBounds,
    skip_today: bool,
}

impl SyncUnitScheduler {
    pub fn new(
        today: NaiveDate,
        format: TimestampFormat,
        max_lookback_days: u32,
        bounds: RangeBounds,
        skip_today: bool,
    ) -> Self {
        Self {
            today,
            format,
            max_lookback_days,
            bounds,
            skip_today,
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    /// Expand one account into units: document types in the given order,
    /// dates ascending within each.
    pub fn plan(
        &self,
        settings: &AccountSettings,
        token: &str,
        infos: &[LastSyncInfo],
        document_types: &[DocumentType],
    ) -> Plan {
        let mut plan = Plan::default();

        for doc_type in document_types {
            let raw = last_timestamp(infos, &settings.account_id, doc_type);
            let last_synced = self.format.decode(raw);

            let windows: Result<Vec<(NaiveDate, NaiveDate)>> = match doc_type.history {
                History::Daily => {
                    let range = compute_range(last_synced, self.today, self.max_lookback_days, self.bounds);
                    if range.exceeded {
                        log::warn!(
                            "Project {} account {} {}: more than {} days behind, older days dropped",
                            settings.project_id,
                            settings.account_id,
                            doc_type.name,
                            self.max_lookback_days
                        );
                    }
                    Ok(range.dates.into_iter().map(|d| (d, d)).collect())
                }
                History::Snapshot if doc_type.backfill && last_synced.is_none() => {
                    let range = compute_range(None, self.today, self.max_lookback_days, self.bounds);
                    let mut days = range.dates;
                    if days.last() != Some(&self.today) {
                        days.push(self.today);
                    }
                    Ok(days.into_iter().map(|d| (d, d)).collect())
                }
                History::Snapshot => Ok(compute_snapshot(last_synced, self.today)
                    .map(|d| vec![(d, d)])
                    .unwrap_or_default()),
                History::Cursor => Ok(vec![(self.today, self.today)]),
                History::Weekly { buffer_weeks } => {
                    weekly_windows(self.today, buffer_weeks, last_synced, self.bounds)
                        .map(|ws| ws.into_iter().map(|w| (w.start, w.end)).collect())
                }
            };

            let windows = match windows {
                Ok(w) => w,
                Err(e) => {
                    plan.skipped
                        .push((doc_type.name.to_string(), SkipReason::InvalidUnit(e.to_string())));
                    continue;
                }
            };

            if windows.is_empty() {
                plan.skipped
                    .push((doc_type.name.to_string(), SkipReason::AlreadySynced));
                continue;
            }

            for (from, to) in windows {
                let unit = SyncUnit::new(
                    settings.project_id,
                    settings.account_id.as_str(),
                    doc_type.name,
                    from,
                    to,
                    token,
                );
                match unit {
                    Ok(unit) => plan.units.push(
                        unit.with_last_timestamp(raw)
                            .first_run(settings.is_first_run || raw == 0),
                    ),
                    Err(e) => {
                        // Identifying fields are shared by every window.
                        plan.skipped
                            .push((doc_type.name.to_string(), SkipReason::InvalidUnit(e.to_string())));
                        break;
                    }
                }
            }
        }
        plan
    }

    /// Last check before a unit runs.
    pub fn admit(&self, unit: &SyncUnit, doc_type: &DocumentType, ctx: &RunContext) -> Option<SkipReason> {
        if ctx.is_permission_denied(&unit.permission_key()) {
            return Some(SkipReason::PermissionDenied);
        }
        if self.skip_today && doc_type.dated() && unit.to >= self.today {
            return Some(SkipReason::Today);
        }
        if ctx.stream_failed(&unit.stream_key()) {
            return Some(SkipReason::PriorFailure);
        }
        None
    }

    /// Record a unit failure in the run context and decide whether the job
    /// continues.
    pub fn on_failure(&self, unit: &SyncUnit, error: &Error, ctx: &RunContext) -> FailureAction {
        match error.kind() {
            FailureKind::RateLimitShort | FailureKind::RateLimitDaily => {
                ctx.abort(&error.failure_key());
                FailureAction::AbortJob
            }
            FailureKind::PermissionDenied => {
                if ctx.record_permission_denied(unit.permission_key(), &error.failure_key()) {
                    log::warn!(
                        "Caching permission failure for {}: {error}",
                        unit.permission_key()
                    );
                }
                ctx.mark_stream_failed(unit.stream_key());
                FailureAction::Continue
            }
            FailureKind::Transient | FailureKind::Fatal => {
                ctx.mark_stream_failed(unit.stream_key());
                FailureAction::Continue
            }
        }
    }
}

fn last_timestamp(infos: &[LastSyncInfo], account_id: &str, doc_type: &DocumentType) -> i64 {
    infos
        .iter()
        .filter(|i| i.document_type == doc_type.name)
        .filter(|i| i.account_id.is_empty() || i.account_id == account_id)
        // Breakdown markers trail the aggregate one.
        .filter(|i| match (doc_type.platform, i.platform.as_deref()) {
            (Some(split), Some(platform)) => platform == split.aggregate,
            _ => true,
        })
        .map(|i| i.last_timestamp)
        .max()
        .unwrap_or(0)
}
