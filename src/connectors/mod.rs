pub mod adwords;
pub mod facebook;
pub mod hubspot;
pub mod linkedin;

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::date_util::TimestampFormat;
use crate::error::{Error, Result};
use crate::sync::unit::{AccountSettings, SyncUnit};
use crate::sync::{DocumentType, FetchResult};

pub use adwords::{AdWordsConfig, AdWordsConnector};
pub use facebook::{FacebookConfig, FacebookConnector};
pub use hubspot::{HubSpotConfig, HubSpotConnector};
pub use linkedin::{LinkedInConfig, LinkedInConnector, MemberCompanyStrategy};

static RE_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(.)([A-Z][a-z]+)").unwrap());
static RE_LOWER_UPPER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([a-z0-9])([A-Z])").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    AdWords,
    Facebook,
    LinkedIn,
    HubSpot,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::AdWords => "adwords",
            Platform::Facebook => "facebook",
            Platform::LinkedIn => "linkedin",
            Platform::HubSpot => "hubspot",
        }
    }

    pub fn timestamp_format(&self) -> TimestampFormat {
        match self {
            Platform::AdWords | Platform::LinkedIn => TimestampFormat::Yyyymmdd,
            Platform::Facebook => TimestampFormat::UnixSeconds,
            Platform::HubSpot => TimestampFormat::UnixMillis,
        }
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adwords" => Ok(Platform::AdWords),
            "facebook" => Ok(Platform::Facebook),
            "linkedin" => Ok(Platform::LinkedIn),
            "hubspot" => Ok(Platform::HubSpot),
            other => Err(Error::Config(format!("unknown platform: {other}"))),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential to use for an account's units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub token: String,
    /// The token was reissued and should be stored back.
    pub refreshed: bool,
}

impl Prepared {
    pub fn unchanged(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            refreshed: false,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;

    /// Document types synced for a project, in execution order.
    fn document_types(&self, project_id: u64) -> Vec<DocumentType>;

    /// Whether settings name ad accounts. Project-wide platforms use the
    /// project id as account.
    fn account_scoped(&self) -> bool {
        true
    }

    async fn prepare(&self, settings: &AccountSettings) -> Result<Prepared> {
        if settings.token.trim().is_empty() {
            return Err(Error::PermissionDenied(format!(
                "no access token for project {}",
                settings.project_id
            )));
        }
        Ok(Prepared::unchanged(settings.token.as_str()))
    }

    async fn fetch(&self, unit: &SyncUnit) -> Result<FetchResult>;
}

/// Look up a document type by name.
pub fn find_document_type<'a>(types: &'a [DocumentType], name: &str) -> Option<&'a DocumentType> {
    types.iter().find(|t| t.name == name)
}

/// `campaignGroupId` -> `campaign_group_id`.
pub fn camel_to_snake(s: &str) -> String {
    let s = RE_WORD.replace_all(s, "${1}_${2}");
    RE_LOWER_UPPER.replace_all(&s, "${1}_${2}").to_lowercase()
}

/// Keep the scalar fields of an API object, with snake_case keys.
pub fn snake_case_scalars(value: &Value) -> Value {
    let mut out = Map::new();
    if let Value::Object(map) = value {
        for (key, v) in map {
            if matches!(v, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                out.insert(camel_to_snake(key), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// Pull the array at `key` out of a response body.
pub(crate) fn take_array(body: &mut Value, key: &str) -> Vec<Value> {
    match body.get_mut(key).map(Value::take) {
        Some(Value::Array(rows)) => rows,
        _ => Vec::new(),
    }
}
