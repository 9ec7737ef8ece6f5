use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Deployment environment. Only production talks to the healthcheck and
/// notification endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(Error::Config(format!("unknown environment: {other}"))),
        }
    }
}

/// `"*"` or a comma separated list of identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AllowList {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl AllowList {
    pub fn none() -> Self {
        AllowList::Only(BTreeSet::new())
    }

    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s == "*" {
            return AllowList::All;
        }
        AllowList::Only(
            s.split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn contains(&self, value: &str) -> bool {
        match self {
            AllowList::All => true,
            AllowList::Only(values) => values.contains(value),
        }
    }

    pub fn contains_project(&self, project_id: u64) -> bool {
        self.contains(&project_id.to_string())
    }
}

impl FromStr for AllowList {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(AllowList::parse(s))
    }
}

/// OAuth client credentials, read from the `{"web": {...}}` secret JSON
/// that the Google console exports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthSecret {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Deserialize)]
struct SecretFile {
    web: SecretWeb,
}

#[derive(Deserialize)]
struct SecretWeb {
    client_id: String,
    client_secret: String,
}

impl OAuthSecret {
    pub fn parse(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Err(Error::Config("empty OAuth secret".into()));
        }
        let file: SecretFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid OAuth secret: {e}")))?;
        if file.web.client_id.is_empty() || file.web.client_secret.is_empty() {
            return Err(Error::Config(
                "OAuth secret is missing client_id or client_secret".into(),
            ));
        }
        Ok(Self {
            client_id: file.web.client_id,
            client_secret: file.web.client_secret,
        })
    }
}
