use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{snake_case_scalars, take_array, Connector, Platform, Prepared};
use crate::auth::TokenRefresher;
use crate::date_util::to_yyyymmdd;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::sync::pagination::{Page, PageCursor, PageHint, PageSource, PaginatedFetcher};
use crate::sync::unit::{AccountSettings, SyncUnit};
use crate::sync::{DocumentType, FetchResult, History};

pub const DEFAULT_API_BASE: &str = "https://adwords.google.com/api/adwords";
pub const API_VERSION: &str = "v201809";
const PAGE_SIZE: u64 = 200;
/// Google access tokens live an hour; re-mint well before that.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(45 * 60);

const CAMPAIGNS: DocumentType = DocumentType::new("campaigns", History::Snapshot);
const ADS: DocumentType = DocumentType::new("ads", History::Snapshot);
const AD_GROUPS: DocumentType = DocumentType::new("ad_groups", History::Snapshot);
const CLICK_REPORT: DocumentType =
    DocumentType::new("click_performance_report", History::Daily).with_id_field("gcl_id");
const CAMPAIGN_REPORT: DocumentType =
    DocumentType::new("campaign_performance_report", History::Daily).with_id_field("campaign_id");
const SEARCH_REPORT: DocumentType = DocumentType::new("search_performance_report", History::Daily);
const KEYWORD_REPORT: DocumentType = DocumentType::new("keyword_performance_report", History::Daily);

/// A `get` call on one of the v201809 campaign management services.
struct ServiceQuery {
    service: &'static str,
    fields: &'static [&'static str],
    /// Nested object whose scalars are merged into the row.
    nested: Option<&'static str>,
}

const CAMPAIGN_SERVICE: ServiceQuery = ServiceQuery {
    service: "CampaignService",
    fields: &[
        "Id", "CampaignGroupId", "Name", "Status", "ServingStatus", "StartDate", "EndDate",
        "AdServingOptimizationStatus", "AdvertisingChannelType", "AdvertisingChannelSubType",
        "CampaignTrialType", "BaseCampaignId", "TrackingUrlTemplate", "FinalUrlSuffix",
    ],
    nested: None,
};

const AD_GROUP_AD_SERVICE: ServiceQuery = ServiceQuery {
    service: "AdGroupAdService",
    fields: &["AdGroupId", "Status", "BaseCampaignId", "BaseAdGroupId"],
    nested: Some("ad"),
};

const AD_GROUP_SERVICE: ServiceQuery = ServiceQuery {
    service: "AdGroupService",
    fields: &[
        "Id", "CampaignId", "CampaignName", "Name", "Status", "ContentBidCriterionTypeGroup",
        "BaseCampaignId", "BaseAdGroupId", "AdGroupType",
    ],
    nested: None,
};

/// An AWQL report. Columns are listed snake_case and sent PascalCase.
struct ReportQuery {
    report: &'static str,
    columns: &'static [&'static str],
}

const CLICK_PERFORMANCE: ReportQuery = ReportQuery {
    report: "CLICK_PERFORMANCE_REPORT",
    columns: &[
        "ad_format", "ad_group_id", "ad_network_type_1", "ad_network_type_2",
        "aoi_most_specific_target_id", "campaign_id", "click_type", "creative_id",
        "criteria_parameters", "date", "device", "gcl_id", "page", "slot", "user_list_id",
    ],
};

const CAMPAIGN_PERFORMANCE: ReportQuery = ReportQuery {
    report: "CAMPAIGN_PERFORMANCE_REPORT",
    columns: &[
        "active_view_impressions", "active_view_measurability", "advertising_channel_sub_type",
        "all_conversion_rate", "all_conversion_value", "all_conversions", "amount", "average_cost",
        "average_position", "base_campaign_id", "bounce_rate", "budget_id", "campaign_id",
        "campaign_status", "clicks", "conversion_value", "conversions", "cost", "start_date",
        "end_date", "engagements", "impressions", "interactions", "invalid_clicks",
        "video_view_rate", "video_views", "view_through_conversions",
    ],
};

const SEARCH_PERFORMANCE: ReportQuery = ReportQuery {
    report: "SEARCH_QUERY_PERFORMANCE_REPORT",
    columns: &[
        "ad_group_id", "ad_group_name", "all_conversions", "average_cost", "average_cpc",
        "campaign_id", "clicks", "conversion_value", "conversions", "cost", "ctr", "date",
        "device", "external_customer_id", "final_url", "impressions", "interactions",
        "keyword_id", "query", "query_match_type_with_variant", "week", "year",
    ],
};

const KEYWORD_PERFORMANCE: ReportQuery = ReportQuery {
    report: "KEYWORDS_PERFORMANCE_REPORT",
    columns: &[
        "id", "ad_group_id", "all_conversions", "approval_status", "average_cost", "average_cpc",
        "campaign_id", "clicks", "conversions", "cpc_bid", "criteria", "ctr", "date",
        "impressions", "keyword_match_type",
    ],
};

#[derive(Debug, Clone)]
pub struct AdWordsConfig {
    pub developer_token: String,
    pub api_base: String,
    /// How long a minted access token is reused.
    pub token_ttl: Duration,
}

impl AdWordsConfig {
    pub fn new(developer_token: impl Into<String>) -> Self {
        Self {
            developer_token: developer_token.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            token_ttl: DEFAULT_TOKEN_TTL,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    minted: Instant,
}

pub struct AdWordsConnector {
    client: RetryingHttpClient,
    refresher: Arc<dyn TokenRefresher>,
    config: AdWordsConfig,
    fetcher: PaginatedFetcher,
    /// refresh token -> access token, reused until `token_ttl` passes.
    access_tokens: Mutex<HashMap<String, CachedToken>>,
}

impl AdWordsConnector {
    pub fn new(client: RetryingHttpClient, refresher: Arc<dyn TokenRefresher>, config: AdWordsConfig) -> Self {
        Self {
            client,
            refresher,
            config,
            fetcher: PaginatedFetcher::default(),
            access_tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Access token for a refresh token, and whether it was minted just now.
    async fn access_token(&self, refresh_token: &str) -> Result<(String, bool)> {
        if let Some(token) = self.cached_token(refresh_token) {
            return Ok((token, false));
        }
        let token = self
            .refresher
            .ensure_valid(String::new(), Some(refresh_token.to_string()))
            .await?
            .into_token();
        if let Ok(mut tokens) = self.access_tokens.lock() {
            tokens.insert(
                refresh_token.to_string(),
                CachedToken {
                    token: token.clone(),
                    minted: Instant::now(),
                },
            );
        }
        Ok((token, true))
    }

    fn cached_token(&self, refresh_token: &str) -> Option<String> {
        let ttl = self.config.token_ttl;
        let mut tokens = self.access_tokens.lock().ok()?;
        match tokens.get(refresh_token) {
            Some(cached) if cached.minted.elapsed() < ttl => Some(cached.token.clone()),
            Some(_) => {
                tokens.remove(refresh_token);
                None
            }
            None => None,
        }
    }

    fn evict_token(&self, refresh_token: &str) {
        if let Ok(mut tokens) = self.access_tokens.lock() {
            tokens.remove(refresh_token);
        }
    }

    async fn fetch_with(&self, unit: &SyncUnit, access_token: &str) -> Result<FetchResult> {
        match unit.document_type.as_str() {
            "campaigns" => self.list(&CAMPAIGN_SERVICE, access_token, &unit.account_id).await,
            "ads" => self.list(&AD_GROUP_AD_SERVICE, access_token, &unit.account_id).await,
            "ad_groups" => self.list(&AD_GROUP_SERVICE, access_token, &unit.account_id).await,
            "click_performance_report" => self.report(&CLICK_PERFORMANCE, unit, access_token).await,
            "campaign_performance_report" => self.report(&CAMPAIGN_PERFORMANCE, unit, access_token).await,
            "search_performance_report" => self.report(&SEARCH_PERFORMANCE, unit, access_token).await,
            "keyword_performance_report" => self.report(&KEYWORD_PERFORMANCE, unit, access_token).await,
            other => Err(Error::InvalidSyncUnit(format!("unknown adwords document type: {other}"))),
        }
    }

    fn request(&self, request: HttpRequest, access_token: &str, customer_id: &str) -> HttpRequest {
        request
            .bearer(access_token)
            .header("developerToken", self.config.developer_token.as_str())
            .header("clientCustomerId", customer_id)
    }

    async fn list(&self, query: &ServiceQuery, access_token: &str, customer_id: &str) -> Result<FetchResult> {
        let mut source = ServiceSource {
            connector: self,
            query,
            url: format!(
                "{}/cm/{API_VERSION}/{}",
                self.config.api_base.trim_end_matches('/'),
                query.service
            ),
            access_token,
            customer_id,
        };
        self.fetcher.fetch_all(&mut source).await
    }

    async fn report(&self, query: &ReportQuery, unit: &SyncUnit, access_token: &str) -> Result<FetchResult> {
        let awql = awql(query, unit);
        log::debug!("Downloading {} for account {}: {awql}", query.report, unit.account_id);
        let request = HttpRequest::post_form(
            format!(
                "{}/reportdownload/{API_VERSION}",
                self.config.api_base.trim_end_matches('/')
            ),
            vec![
                ("__rdquery".to_string(), awql),
                ("__fmt".to_string(), "CSV".to_string()),
            ],
        )
        .header("skipReportHeader", "true")
        .header("skipColumnHeader", "true")
        .header("skipReportSummary", "true");
        let response = self
            .client
            .request(self.request(request, access_token, &unit.account_id))
            .await?;
        Ok(FetchResult {
            rows: parse_report_csv(query.columns, &response.body),
            request_count: 1,
        })
    }
}

#[async_trait]
impl Connector for AdWordsConnector {
    fn platform(&self) -> Platform {
        Platform::AdWords
    }

    fn document_types(&self, _project_id: u64) -> Vec<DocumentType> {
        vec![
            CAMPAIGNS,
            ADS,
            AD_GROUPS,
            CLICK_REPORT,
            CAMPAIGN_REPORT,
            SEARCH_REPORT,
            KEYWORD_REPORT,
        ]
    }

    /// Units carry the refresh token; access tokens are minted on first use.
    async fn prepare(&self, settings: &AccountSettings) -> Result<Prepared> {
        match settings.refresh_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => Ok(Prepared::unchanged(token)),
            _ => Err(Error::PermissionDenied(format!(
                "no refresh token for project {}",
                settings.project_id
            ))),
        }
    }

    async fn fetch(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let (access_token, fresh) = self.access_token(&unit.token).await?;
        match self.fetch_with(unit, &access_token).await {
            // A reused token may have been revoked or expired early.
            Err(Error::PermissionDenied(_)) if !fresh => {
                log::info!(
                    "Reused access token rejected for account {}, minting a new one",
                    unit.account_id
                );
                self.evict_token(&unit.token);
                let (access_token, _) = self.access_token(&unit.token).await?;
                self.fetch_with(unit, &access_token).await
            }
            other => other,
        }
    }
}

struct ServiceSource<'a> {
    connector: &'a AdWordsConnector,
    query: &'a ServiceQuery,
    url: String,
    access_token: &'a str,
    customer_id: &'a str,
}

#[async_trait]
impl<'a> PageSource for ServiceSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let start = match cursor {
            PageCursor::Offset(n) => *n,
            _ => 0,
        };
        let selector = json!({
            "fields": self.query.fields,
            "paging": { "startIndex": start, "numberResults": PAGE_SIZE },
        });
        let request = self.connector.request(
            HttpRequest::post_json(self.url.as_str(), selector),
            self.access_token,
            self.customer_id,
        );
        let mut body: Value = self.connector.client.request(request).await?.json()?;

        let total = match &body["totalNumEntries"] {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
        .ok_or_else(|| {
            Error::MalformedResponse(format!("{} response without totalNumEntries", self.query.service))
        })?;

        let entries = take_array(&mut body, "entries");
        if entries.is_empty() {
            log::warn!("No {} entries for account {}", self.query.service, self.customer_id);
        }
        let rows = entries
            .iter()
            .map(|entry| service_row(entry, self.query.nested))
            .collect();
        Ok(Page {
            rows,
            next: PageHint::Offset {
                page_size: PAGE_SIZE,
                total: Some(total),
            },
        })
    }
}

fn service_row(entry: &Value, nested: Option<&str>) -> Value {
    let mut row = snake_case_scalars(entry);
    if let (Some(key), Value::Object(row_map)) = (nested, &mut row) {
        if let Value::Object(inner) = snake_case_scalars(&entry[key]) {
            row_map.extend(inner);
        }
    }
    row
}

/// `ad_network_type_1` -> `AdNetworkType1`.
fn pascal_case(column: &str) -> String {
    column
        .split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect()
}

fn awql(query: &ReportQuery, unit: &SyncUnit) -> String {
    let columns: Vec<String> = query.columns.iter().map(|c| pascal_case(c)).collect();
    format!(
        "SELECT {} FROM {} WHERE CampaignStatus IN [ENABLED, PAUSED] DURING {},{}",
        columns.join(","),
        query.report,
        to_yyyymmdd(unit.from),
        to_yyyymmdd(unit.to)
    )
}

/// Header-less CSV rows keyed by `columns`. `--` marks an empty cell.
fn parse_report_csv(columns: &[&str], body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| {
            let mut row = Map::new();
            for (i, cell) in split_csv_line(line).into_iter().enumerate() {
                let cell = cell.trim();
                if cell.is_empty() || cell == "--" {
                    continue;
                }
                if let Some(column) = columns.get(i) {
                    row.insert(column.to_string(), Value::String(cell.to_string()));
                }
            }
            (!row.is_empty()).then_some(Value::Object(row))
        })
        .collect()
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => cells.push(std::mem::take(&mut cell)),
            '\r' if !quoted => {}
            other => cell.push(other),
        }
    }
    cells.push(cell);
    cells
}
