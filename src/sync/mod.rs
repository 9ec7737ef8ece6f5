pub mod context;
pub mod pagination;
pub mod range;
pub mod scheduler;
pub mod unit;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;

use crate::config::{AllowList, Environment};
use crate::error::{Error, Result};
use range::{RangeBounds, MAX_LOOKBACK_DAYS};
use unit::{SyncUnit, UnitState};

pub use context::{PermissionErrorCache, RunContext};
pub use pagination::{FetchResult, Page, PageCursor, PageHint, PageSource, PaginatedFetcher};
pub use scheduler::{DocumentType, History, SyncUnitScheduler};

/// Default wall-clock ceiling for a single unit.
pub const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Which half of the pipeline a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Fetch and write to the data service in one pass.
    #[default]
    Full,
    /// Fetch into the local extract cache only.
    Extract,
    /// Write everything pending in the extract cache.
    Load,
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Phase::Full),
            "extract" => Ok(Phase::Extract),
            "load" => Ok(Phase::Load),
            other => Err(Error::Config(format!("unknown phase: {other}"))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Full => "full",
            Phase::Extract => "extract",
            Phase::Load => "load",
        };
        f.write_str(s)
    }
}

/// Options controlling a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub env: Environment,
    pub dry_run: bool,
    pub skip_today: bool,
    pub projects: AllowList,
    pub max_lookback_days: u32,
    pub bounds: RangeBounds,
    pub unit_timeout: Duration,
    pub phase: Phase,
    /// Pin "today" (tests and reruns).
    pub today: Option<NaiveDate>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            env: Environment::Development,
            dry_run: false,
            skip_today: false,
            projects: AllowList::All,
            max_lookback_days: MAX_LOOKBACK_DAYS,
            bounds: RangeBounds::default(),
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
            phase: Phase::Full,
            today: None,
        }
    }
}

impl SyncOptions {
    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(crate::date_util::today_utc)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

/// Callback trait for reporting sync progress to the caller.
pub trait SyncProgress: Send + Sync {
    fn on_account_start(&self, _project_id: u64, _account_id: &str, _units: usize) {}
    fn on_unit_start(&self, _unit: &SyncUnit, _index: usize, _total: usize) {}
    fn on_unit_complete(&self, _unit: &SyncUnit, _state: &UnitState) {}
}

/// No-op progress reporter.
pub struct NoopProgress;

impl SyncProgress for NoopProgress {}
