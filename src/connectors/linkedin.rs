use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use serde_json::{Map, Value};

use super::{take_array, Connector, Platform, Prepared};
use crate::auth::TokenRefresher;
use crate::config::AllowList;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::sync::pagination::{Page, PageCursor, PageHint, PageSource, PaginatedFetcher};
use crate::sync::unit::{AccountSettings, SyncUnit};
use crate::sync::{DocumentType, FetchResult, History};

pub const DEFAULT_API_BASE: &str = "https://api.linkedin.com/v2";
pub const MEMBER_COMPANY_INSIGHTS: &str = "member_company_insights";
const META_COUNT: u64 = 100;
const INSIGHTS_COUNT: u64 = 10_000;
const ORG_LOOKUP_BATCH: usize = 50;
const NONE_VALUE: &str = "$none";

const INSIGHT_FIELDS: &str = "totalEngagements,impressions,clicks,dateRange,landingPageClicks,\
costInUsd,leadGenerationMailContactInfoShares,leadGenerationMailInterestedClicks,opens,\
videoCompletions,videoFirstQuartileCompletions,videoMidpointCompletions,videoThirdQuartileCompletions,\
videoViews,externalWebsiteConversions,externalWebsitePostClickConversions,\
externalWebsitePostViewConversions,costInLocalCurrency,conversionValueInLocalCurrency,pivotValue";

/// How member-company insights are pulled. The two variants write different
/// row shapes and are never mixed for one project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemberCompanyStrategy {
    /// One unit per day, daily granularity.
    #[default]
    V1Daily,
    /// Monday to Sunday windows, aggregated over the week.
    V2Weekly,
}

impl FromStr for MemberCompanyStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "v1_daily" | "daily" => Ok(MemberCompanyStrategy::V1Daily),
            "v2" | "v2_weekly" | "weekly" => Ok(MemberCompanyStrategy::V2Weekly),
            other => Err(Error::Config(format!("unknown member company strategy: {other}"))),
        }
    }
}

impl fmt::Display for MemberCompanyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberCompanyStrategy::V1Daily => f.write_str("v1_daily"),
            MemberCompanyStrategy::V2Weekly => f.write_str("v2_weekly"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkedInConfig {
    pub api_base: String,
    pub member_company_strategy: MemberCompanyStrategy,
    /// Weeks held back from the most recent Sunday (weekly strategy only).
    pub member_company_buffer_weeks: u32,
    pub member_company_projects: AllowList,
}

impl Default for LinkedInConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            member_company_strategy: MemberCompanyStrategy::default(),
            member_company_buffer_weeks: 0,
            member_company_projects: AllowList::All,
        }
    }
}

/// Campaign hierarchy levels, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Level {
    CampaignGroup,
    Campaign,
    Creative,
}

impl Level {
    fn endpoint(self) -> &'static str {
        match self {
            Level::CampaignGroup => "adCampaignGroupsV2",
            Level::Campaign => "adCampaignsV2",
            Level::Creative => "adCreativesV2",
        }
    }
}

/// One level's metadata rows and, per id, the fields merged into rows
/// that reference it.
#[derive(Debug, Default)]
struct LevelMeta {
    rows: Vec<Value>,
    fields: HashMap<String, Map<String, Value>>,
}

impl LevelMeta {
    /// Creatives name their campaign but not its group; `campaigns`
    /// supplies the group.
    fn build(level: Level, rows: Vec<Value>, campaigns: Option<&LevelMeta>) -> Self {
        let mut fields = HashMap::new();
        for row in &rows {
            let Some(id) = id_string(&row["id"]) else {
                continue;
            };
            let mut meta = Map::new();
            match level {
                Level::CampaignGroup => {
                    meta.insert("campaign_group_id".into(), Value::String(id.clone()));
                    copy_field(&mut meta, "campaign_group_name", &row["name"]);
                    copy_field(&mut meta, "campaign_group_status", &row["status"]);
                }
                Level::Campaign => {
                    if let Some(group) = row["campaignGroup"].as_str().and_then(urn_id) {
                        meta.insert("campaign_group_id".into(), Value::String(group));
                    }
                    meta.insert("campaign_id".into(), Value::String(id.clone()));
                    copy_field(&mut meta, "campaign_name", &row["name"]);
                    copy_field(&mut meta, "campaign_status", &row["status"]);
                    copy_field(&mut meta, "campaign_type", &row["type"]);
                }
                Level::Creative => {
                    let campaign = row["campaign"].as_str().and_then(urn_id);
                    let group = campaign
                        .as_ref()
                        .and_then(|c| campaigns?.fields.get(c))
                        .and_then(|c| c.get("campaign_group_id"))
                        .cloned();
                    if let Some(group) = group {
                        meta.insert("campaign_group_id".into(), group);
                    }
                    if let Some(campaign) = campaign {
                        meta.insert("campaign_id".into(), Value::String(campaign));
                    }
                    meta.insert("creative_id".into(), Value::String(id.clone()));
                    copy_field(&mut meta, "creative_status", &row["status"]);
                    copy_field(&mut meta, "creative_type", &row["type"]);
                }
            }
            fields.insert(id, meta);
        }
        Self { rows, fields }
    }

    /// Metadata rows with their own level's fields merged in.
    fn merged_rows(&self) -> Vec<Value> {
        self.rows
            .iter()
            .cloned()
            .map(|mut row| {
                if let Some(meta) = id_string(&row["id"]).and_then(|id| self.fields.get(&id)) {
                    merge_fields(&mut row, meta);
                }
                row
            })
            .collect()
    }

    fn merge_into(&self, row: &mut Value, id: Option<&Value>) {
        if let Some(meta) = id.and_then(id_string).and_then(|id| self.fields.get(&id)) {
            merge_fields(row, meta);
        }
    }
}

pub struct LinkedInConnector {
    client: RetryingHttpClient,
    refresher: Arc<dyn TokenRefresher>,
    config: LinkedInConfig,
    fetcher: PaginatedFetcher,
    /// (account, level) -> metadata fetched this run. Backfill units and
    /// insight merges reuse it.
    hierarchy: Mutex<HashMap<(String, Level), Arc<LevelMeta>>>,
}

impl LinkedInConnector {
    pub fn new(client: RetryingHttpClient, refresher: Arc<dyn TokenRefresher>, config: LinkedInConfig) -> Self {
        Self {
            client,
            refresher,
            config,
            fetcher: PaginatedFetcher::default(),
            hierarchy: Mutex::new(HashMap::new()),
        }
    }

    fn cached_level(&self, account_id: &str, level: Level) -> Option<Arc<LevelMeta>> {
        let cache = self.hierarchy.lock().ok()?;
        cache.get(&(account_id.to_string(), level)).cloned()
    }

    /// Metadata for one level and the requests it took (zero when cached).
    async fn level(&self, unit: &SyncUnit, level: Level) -> Result<(Arc<LevelMeta>, u64)> {
        let mut requests = 0;
        let campaigns = match level {
            Level::Creative => {
                let (campaigns, n) = self.load_level(unit, Level::Campaign, None).await?;
                requests += n;
                Some(campaigns)
            }
            _ => None,
        };
        let (meta, n) = self.load_level(unit, level, campaigns.as_deref()).await?;
        Ok((meta, requests + n))
    }

    async fn load_level(
        &self,
        unit: &SyncUnit,
        level: Level,
        campaigns: Option<&LevelMeta>,
    ) -> Result<(Arc<LevelMeta>, u64)> {
        if let Some(meta) = self.cached_level(&unit.account_id, level) {
            return Ok((meta, 0));
        }
        let fetched = self.metadata(unit, level.endpoint()).await?;
        let meta = Arc::new(LevelMeta::build(level, fetched.rows, campaigns));
        if let Ok(mut cache) = self.hierarchy.lock() {
            cache.insert((unit.account_id.clone(), level), meta.clone());
        }
        Ok((meta, fetched.request_count))
    }

    /// Snapshot of one level. Units dated before today (first-sync
    /// backfill) write the same snapshot again.
    async fn snapshot(&self, unit: &SyncUnit, level: Level) -> Result<FetchResult> {
        let (meta, request_count) = self.level(unit, level).await?;
        Ok(FetchResult {
            rows: meta.merged_rows(),
            request_count,
        })
    }

    /// Insights for one level with the hierarchy above it merged into each
    /// row.
    async fn hierarchy_insights(&self, unit: &SyncUnit, level: Level, pivot: &str) -> Result<FetchResult> {
        let mut result = self.insights(unit, pivot, "DAILY").await?;
        let (groups, n) = self.level(unit, Level::CampaignGroup).await?;
        result.request_count += n;
        match level {
            Level::CampaignGroup => {
                for row in &mut result.rows {
                    let id = row.get("id").cloned();
                    groups.merge_into(row, id.as_ref());
                }
            }
            Level::Campaign => {
                let (campaigns, n) = self.level(unit, Level::Campaign).await?;
                result.request_count += n;
                for row in &mut result.rows {
                    let id = row.get("id").cloned();
                    campaigns.merge_into(row, id.as_ref());
                    let group = row.get("campaign_group_id").cloned();
                    groups.merge_into(row, group.as_ref());
                }
            }
            Level::Creative => {
                let (creatives, n) = self.level(unit, Level::Creative).await?;
                result.request_count += n;
                let (campaigns, _) = self.level(unit, Level::Campaign).await?;
                for row in &mut result.rows {
                    let id = row.get("id").cloned();
                    creatives.merge_into(row, id.as_ref());
                    let group = row.get("campaign_group_id").cloned();
                    groups.merge_into(row, group.as_ref());
                    let campaign = row.get("campaign_id").cloned();
                    campaigns.merge_into(row, campaign.as_ref());
                }
            }
        }
        Ok(result)
    }

    fn base(&self) -> &str {
        self.config.api_base.trim_end_matches('/')
    }

    async fn ad_account(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let url = format!("{}/adAccountsV2/{}", self.base(), unit.account_id);
        let row: Value = self
            .client
            .request(HttpRequest::get(url).bearer(&unit.token))
            .await?
            .json()?;
        Ok(FetchResult {
            rows: vec![row],
            request_count: 1,
        })
    }

    async fn metadata(&self, unit: &SyncUnit, endpoint: &str) -> Result<FetchResult> {
        let url = format!(
            "{}/{endpoint}?q=search&search.account.values[0]=urn:li:sponsoredAccount:{}&pageSize={META_COUNT}",
            self.base(),
            unit.account_id
        );
        let mut source = MetadataSource {
            client: &self.client,
            url,
            token: &unit.token,
        };
        self.fetcher.fetch_all(&mut source).await
    }

    async fn insights(&self, unit: &SyncUnit, pivot: &str, granularity: &str) -> Result<FetchResult> {
        let url = format!(
            "{}/adAnalyticsV2?q=analytics&pivot={pivot}&{}&timeGranularity={granularity}&fields={INSIGHT_FIELDS}\
&accounts[0]=urn:li:sponsoredAccount:{}&count={INSIGHTS_COUNT}",
            self.base(),
            date_range_params(unit.from, unit.to),
            unit.account_id
        );
        let mut source = AnalyticsSource {
            client: &self.client,
            url,
            token: &unit.token,
        };
        self.fetcher.fetch_all(&mut source).await
    }

    async fn member_companies(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let granularity = match self.config.member_company_strategy {
            MemberCompanyStrategy::V1Daily => "DAILY",
            MemberCompanyStrategy::V2Weekly => "ALL",
        };
        let mut result = self.insights(unit, "MEMBER_COMPANY", granularity).await?;
        if result.rows.is_empty() {
            log::warn!(
                "No member company insights for project {} account {}",
                unit.project_id,
                unit.account_id
            );
            return Ok(result);
        }
        if self.config.member_company_strategy == MemberCompanyStrategy::V2Weekly {
            for row in &mut result.rows {
                set_field(row, "week_start", Value::String(unit.from.to_string()));
                set_field(row, "week_end", Value::String(unit.to.to_string()));
            }
        }
        result.request_count += self.enrich_organizations(&mut result.rows, &unit.token).await?;
        Ok(result)
    }

    /// Adds organization names and locations to member-company rows.
    /// Returns the number of lookup requests made.
    async fn enrich_organizations(&self, rows: &mut [Value], token: &str) -> Result<u64> {
        let ids: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| r["pivotValue"].as_str().and_then(urn_id))
            .collect();
        let ids: Vec<String> = ids.into_iter().collect();

        let mut orgs: HashMap<String, Value> = HashMap::new();
        let mut requests = 0;
        for batch in ids.chunks(ORG_LOOKUP_BATCH) {
            let url = format!("{}/organizationsLookup?ids=List({})", self.base(), batch.join(","));
            let request = HttpRequest::get(url)
                .bearer(token)
                .header("X-Restli-Protocol-Version", "2.0.0");
            let mut body: Value = self.client.request(request).await?.json()?;
            requests += 1;
            match body.get_mut("results").map(Value::take) {
                Some(Value::Object(results)) => orgs.extend(results),
                _ => {
                    return Err(Error::MalformedResponse(
                        "organizationsLookup response without results".into(),
                    ))
                }
            }
        }

        for row in rows.iter_mut() {
            let org = row["pivotValue"]
                .as_str()
                .and_then(urn_id)
                .and_then(|id| orgs.get(&id));
            if org.is_none() {
                log::warn!("No organization data for {}", row["pivotValue"]);
            }
            apply_org_fields(row, org);
        }
        Ok(requests)
    }
}

#[async_trait]
impl Connector for LinkedInConnector {
    fn platform(&self) -> Platform {
        Platform::LinkedIn
    }

    fn document_types(&self, project_id: u64) -> Vec<DocumentType> {
        let mut types = vec![
            DocumentType::new("ad_account", History::Snapshot),
            DocumentType::new("campaign_group", History::Snapshot).with_backfill(),
            DocumentType::new("campaign", History::Snapshot).with_backfill(),
            DocumentType::new("creative", History::Snapshot).with_backfill(),
            DocumentType::new("campaign_group_insights", History::Daily),
            DocumentType::new("campaign_insights", History::Daily),
            DocumentType::new("creative_insights", History::Daily),
        ];
        if self.config.member_company_projects.contains_project(project_id) {
            let history = match self.config.member_company_strategy {
                MemberCompanyStrategy::V1Daily => History::Daily,
                MemberCompanyStrategy::V2Weekly => History::Weekly {
                    buffer_weeks: self.config.member_company_buffer_weeks,
                },
            };
            types.push(DocumentType::new(MEMBER_COMPANY_INSIGHTS, history));
        }
        types
    }

    async fn prepare(&self, settings: &AccountSettings) -> Result<Prepared> {
        let status = self
            .refresher
            .ensure_valid(settings.token.clone(), settings.refresh_token.clone())
            .await?;
        if status.was_refreshed() {
            log::info!("Access token refreshed for project {}", settings.project_id);
        }
        Ok(Prepared {
            refreshed: status.was_refreshed(),
            token: status.into_token(),
        })
    }

    async fn fetch(&self, unit: &SyncUnit) -> Result<FetchResult> {
        match unit.document_type.as_str() {
            "ad_account" => self.ad_account(unit).await,
            "campaign_group" => self.snapshot(unit, Level::CampaignGroup).await,
            "campaign" => self.snapshot(unit, Level::Campaign).await,
            "creative" => self.snapshot(unit, Level::Creative).await,
            "campaign_group_insights" => {
                self.hierarchy_insights(unit, Level::CampaignGroup, "CAMPAIGN_GROUP").await
            }
            "campaign_insights" => self.hierarchy_insights(unit, Level::Campaign, "CAMPAIGN").await,
            "creative_insights" => self.hierarchy_insights(unit, Level::Creative, "CREATIVE").await,
            MEMBER_COMPANY_INSIGHTS => self.member_companies(unit).await,
            other => Err(Error::InvalidSyncUnit(format!("unknown linkedin document type: {other}"))),
        }
    }
}

/// Campaign, group and creative listings: `elements` plus
/// `metadata.nextPageToken`.
struct MetadataSource<'a> {
    client: &'a RetryingHttpClient,
    url: String,
    token: &'a str,
}

#[async_trait]
impl<'a> PageSource for MetadataSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let url = match cursor {
            PageCursor::Composite(page_token) => format!("{}&pageToken={page_token}", self.url),
            _ => self.url.clone(),
        };
        let mut body: Value = self
            .client
            .request(HttpRequest::get(url).bearer(self.token))
            .await?
            .json()?;
        let rows = take_array(&mut body, "elements");
        let next = match body["metadata"]["nextPageToken"].as_str() {
            Some(token) if !token.is_empty() => PageHint::Cursor {
                value: token.to_string(),
                has_more: true,
            },
            _ => PageHint::End,
        };
        Ok(Page { rows, next })
    }
}

/// adAnalyticsV2: offset paging, more while a page is full.
struct AnalyticsSource<'a> {
    client: &'a RetryingHttpClient,
    url: String,
    token: &'a str,
}

#[async_trait]
impl<'a> PageSource for AnalyticsSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let start = match cursor {
            PageCursor::Offset(n) => *n,
            _ => 0,
        };
        let url = format!("{}&start={start}", self.url);
        let mut body: Value = self
            .client
            .request(HttpRequest::get(url).bearer(self.token))
            .await?
            .json()?;
        let rows = take_array(&mut body, "elements")
            .into_iter()
            .map(|mut row| {
                if let Some(id) = row["pivotValue"].as_str().and_then(urn_id) {
                    set_field(&mut row, "id", Value::String(id));
                }
                row
            })
            .collect();
        Ok(Page {
            rows,
            next: PageHint::Offset {
                page_size: INSIGHTS_COUNT,
                total: None,
            },
        })
    }
}

fn date_range_params(from: NaiveDate, to: NaiveDate) -> String {
    format!(
        "dateRange.start.day={}&dateRange.start.month={}&dateRange.start.year={}\
&dateRange.end.day={}&dateRange.end.month={}&dateRange.end.year={}",
        from.day(),
        from.month(),
        from.year(),
        to.day(),
        to.month(),
        to.year()
    )
}

/// `urn:li:sponsoredCampaign:123` -> `123`.
fn urn_id(urn: &str) -> Option<String> {
    urn.split(':').nth(3).filter(|id| !id.is_empty()).map(str::to_string)
}

fn set_field(row: &mut Value, key: &str, value: Value) {
    if let Value::Object(map) = row {
        map.insert(key.to_string(), value);
    }
}

fn merge_fields(row: &mut Value, fields: &Map<String, Value>) {
    if let Value::Object(map) = row {
        map.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

fn copy_field(meta: &mut Map<String, Value>, key: &str, value: &Value) {
    if !value.is_null() {
        meta.insert(key.to_string(), value.clone());
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn apply_org_fields(row: &mut Value, org: Option<&Value>) {
    let none = Value::String(NONE_VALUE.to_string());
    let empty = Value::Object(Map::new());
    let org = org.unwrap_or(&empty);
    let text = |v: &Value| match v {
        Value::String(s) if !s.is_empty() => Value::String(s.clone()),
        _ => none.clone(),
    };

    let headquarters = org["locations"]
        .as_array()
        .and_then(|locations| {
            locations
                .iter()
                .find(|l| l["locationType"] == "HEADQUARTERS" && l["address"]["country"].is_string())
        })
        .map(|l| text(&l["address"]["country"]))
        .unwrap_or_else(|| none.clone());

    set_field(row, "vanityName", text(&org["vanityName"]));
    set_field(row, "localizedName", text(&org["localizedName"]));
    set_field(row, "localizedWebsite", text(&org["localizedWebsite"]));
    set_field(row, "preferredCountry", text(&org["name"]["preferredLocale"]["country"]));
    set_field(row, "companyHeadquarters", headquarters);
}
