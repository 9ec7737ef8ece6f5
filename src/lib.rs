pub mod auth;
pub mod config;
pub mod connectors;
pub mod date_util;
pub mod error;
pub mod http;
pub mod job;
pub mod metrics;
pub mod notify;
pub mod sink;
pub mod storage;
pub mod sync;

pub use config::{AllowList, Environment, OAuthSecret};
pub use connectors::{Connector, Platform};
pub use error::{Error, FailureKind, Result};
pub use job::ConnectorSyncJob;
pub use metrics::{RunReport, RunStats};
pub use notify::{HealthcheckNotifier, NotifierConfig};
pub use storage::Database;
pub use sync::unit::{SyncUnit, UnitState};
pub use sync::{NoopProgress, Phase, SyncOptions, SyncProgress, SyncStatus};
