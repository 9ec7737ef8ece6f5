use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::range::MAX_LOOKBACK_DAYS;
use crate::error::{Error, Result};

/// Per-account configuration returned by the data service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSettings {
    pub project_id: u64,
    #[serde(
        default,
        alias = "customer_acc_id",
        alias = "int_adwords_customer_account_id",
        alias = "int_facebook_ad_account",
        alias = "int_linkedin_ad_account"
    )]
    pub account_id: String,
    #[serde(
        default,
        alias = "access_token",
        alias = "api_key",
        alias = "int_facebook_access_token",
        alias = "int_linkedin_access_token"
    )]
    pub token: String,
    #[serde(
        default,
        alias = "int_adwords_refresh_token",
        alias = "int_linkedin_refresh_token"
    )]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub is_first_run: bool,
}

impl AccountSettings {
    /// One entry per account when `account_id` holds a comma separated list.
    pub fn split_accounts(&self) -> Vec<AccountSettings> {
        self.account_id
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(|account_id| AccountSettings {
                account_id: account_id.to_string(),
                ..self.clone()
            })
            .collect()
    }
}

/// The data service's record of how far a document type has been synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSyncInfo {
    pub project_id: u64,
    #[serde(default, alias = "customer_acc_id")]
    pub account_id: String,
    #[serde(alias = "type_alias", alias = "doc_type")]
    pub document_type: String,
    /// Platform encoded; 0 means never synced.
    #[serde(default)]
    pub last_timestamp: i64,
    /// Set for types split by platform; one marker per platform.
    #[serde(default)]
    pub platform: Option<String>,
}

/// Identifies the ordered series of units for one document type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub project_id: u64,
    pub account_id: String,
    pub document_type: String,
}

/// Permission failures are remembered per account and credential.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionKey {
    pub account_id: String,
    pub token: String,
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the credential itself.
        write!(f, "{}:***", self.account_id)
    }
}

/// One fetch-and-load task for one document type of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncUnit {
    pub project_id: u64,
    pub account_id: String,
    pub document_type: String,
    pub from: NaiveDate,
    pub to: NaiveDate,
    #[serde(skip_serializing)]
    pub token: String,
    pub is_first_run: bool,
    /// Raw marker from the data service, used by cursor-driven document types.
    pub last_timestamp: i64,
}

impl SyncUnit {
    pub fn new(
        project_id: u64,
        account_id: impl Into<String>,
        document_type: impl Into<String>,
        from: NaiveDate,
        to: NaiveDate,
        token: impl Into<String>,
    ) -> Result<Self> {
        let unit = Self {
            project_id,
            account_id: account_id.into(),
            document_type: document_type.into(),
            from,
            to,
            token: token.into(),
            is_first_run: false,
            last_timestamp: 0,
        };
        unit.validate()?;
        Ok(unit)
    }

    /// A unit covering a single day.
    pub fn day(
        project_id: u64,
        account_id: impl Into<String>,
        document_type: impl Into<String>,
        date: NaiveDate,
        token: impl Into<String>,
    ) -> Result<Self> {
        Self::new(project_id, account_id, document_type, date, date, token)
    }

    pub fn with_last_timestamp(mut self, last_timestamp: i64) -> Self {
        self.last_timestamp = last_timestamp;
        self
    }

    pub fn first_run(mut self, is_first_run: bool) -> Self {
        self.is_first_run = is_first_run;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.project_id == 0 {
            return Err(Error::InvalidSyncUnit("missing project_id".into()));
        }
        if self.account_id.trim().is_empty() {
            return Err(Error::InvalidSyncUnit(format!(
                "missing account id for project {}",
                self.project_id
            )));
        }
        if self.document_type.trim().is_empty() {
            return Err(Error::InvalidSyncUnit(format!(
                "missing document type for project {}",
                self.project_id
            )));
        }
        if self.token.trim().is_empty() {
            return Err(Error::InvalidSyncUnit(format!(
                "missing token for project {} account {}",
                self.project_id, self.account_id
            )));
        }
        if self.from > self.to {
            return Err(Error::InvalidSyncUnit(format!(
                "from {} is after to {}",
                self.from, self.to
            )));
        }
        if self.span_days() > MAX_LOOKBACK_DAYS as i64 {
            return Err(Error::InvalidSyncUnit(format!(
                "{}..{} exceeds the {MAX_LOOKBACK_DAYS} day lookback",
                self.from, self.to
            )));
        }
        Ok(())
    }

    pub fn span_days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn stream_key(&self) -> StreamKey {
        StreamKey {
            project_id: self.project_id,
            account_id: self.account_id.clone(),
            document_type: self.document_type.clone(),
        }
    }

    pub fn permission_key(&self) -> PermissionKey {
        PermissionKey {
            account_id: self.account_id.clone(),
            token: self.token.clone(),
        }
    }
}

impl fmt::Display for SyncUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "project {} account {} {} ",
            self.project_id, self.account_id, self.document_type
        )?;
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}..{}", self.from, self.to)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SkipReason {
    InvalidUnit(String),
    PermissionDenied,
    Today,
    AlreadySynced,
    PriorFailure,
    NotAllowed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidUnit(msg) => write!(f, "invalid unit: {msg}"),
            SkipReason::PermissionDenied => f.write_str("permission denied earlier in run"),
            SkipReason::Today => f.write_str("skipping today"),
            SkipReason::AlreadySynced => f.write_str("already synced"),
            SkipReason::PriorFailure => f.write_str("earlier date failed in this run"),
            SkipReason::NotAllowed => f.write_str("not enabled for project"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Success { records: usize },
    Failed(String),
    Skipped(SkipReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_valid_unit() {
        let unit = SyncUnit::day(7, "123", "campaigns", d(2024, 1, 2), "tok").unwrap();
        assert_eq!(unit.span_days(), 1);
        assert_eq!(unit.to_string(), "project 7 account 123 campaigns 2024-01-02");
        assert!(!unit.is_first_run);
    }

    #[test]
    fn test_rejects_missing_fields() {
        let day = d(2024, 1, 2);
        assert!(SyncUnit::day(0, "123", "campaigns", day, "tok").is_err());
        assert!(SyncUnit::day(7, "", "campaigns", day, "tok").is_err());
        assert!(SyncUnit::day(7, "123", "", day, "tok").is_err());
        assert!(SyncUnit::day(7, "123", "campaigns", day, " ").is_err());
    }

    #[test]
    fn test_rejects_inverted_and_oversized_ranges() {
        assert!(SyncUnit::new(7, "1", "x", d(2024, 1, 3), d(2024, 1, 2), "t").is_err());
        assert!(SyncUnit::new(7, "1", "x", d(2024, 1, 1), d(2024, 2, 15), "t").is_err());
        assert!(SyncUnit::new(7, "1", "x", d(2024, 1, 1), d(2024, 1, 30), "t").is_ok());
    }

    #[test]
    fn test_split_accounts() {
        let settings = AccountSettings {
            project_id: 1,
            account_id: "111, 222,".into(),
            token: "tok".into(),
            refresh_token: None,
            is_first_run: false,
        };
        let split = settings.split_accounts();
        assert_eq!(split.len(), 2);
        assert_eq!(split[0].account_id, "111");
        assert_eq!(split[1].account_id, "222");
        assert_eq!(split[1].token, "tok");
    }

    #[test]
    fn test_settings_aliases() {
        let json = r#"{"project_id": 3, "int_adwords_customer_account_id": "999", "int_adwords_refresh_token": "r"}"#;
        let settings: AccountSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.account_id, "999");
        assert_eq!(settings.refresh_token.as_deref(), Some("r"));
        assert!(settings.token.is_empty());
    }

    #[test]
    fn test_last_sync_info_aliases() {
        let json = r#"{"project_id": 3, "customer_acc_id": "999", "type_alias": "campaigns", "last_timestamp": 20240101}"#;
        let info: LastSyncInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.account_id, "999");
        assert_eq!(info.document_type, "campaigns");
        assert_eq!(info.last_timestamp, 20240101);
    }

    #[test]
    fn test_permission_key_display_hides_token() {
        let unit = SyncUnit::day(7, "123", "ads", d(2024, 1, 2), "secret-token").unwrap();
        assert_eq!(unit.permission_key().to_string(), "123:***");
    }
}
