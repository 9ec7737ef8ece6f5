use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::{take_array, Connector, Platform};
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::sync::pagination::{Page, PageCursor, PageHint, PageSource, PaginatedFetcher};
use crate::sync::unit::SyncUnit;
use crate::sync::{DocumentType, FetchResult, History};

pub const DEFAULT_GRAPH_BASE: &str = "https://graph.facebook.com/v9.0";
pub const FACEBOOK_ALL: &str = "facebook_all";
const PAGE_LIMIT: u32 = 500;

const AD_ACCOUNT_FIELDS: &str = "id,balance,name,partner,spend_cap,currency";
const CAMPAIGN_FIELDS: &str =
    "id,name,account_id,buying_type,effective_status,spend_cap,start_time,stop_time";
const AD_SET_FIELDS: &str =
    "id,account_id,campaign_id,configured_status,daily_budget,effective_status,end_time,name";
const AD_FIELDS: &str = "id,adset_id,account_id,bid_amount,bid_type,campaign_id,name,status";
const INSIGHT_FIELDS: &str = "account_currency,ad_id,ad_name,adset_name,campaign_name,adset_id,\
campaign_id,clicks,conversions,cost_per_conversion,cost_per_ad_click,cpc,cpm,cpp,ctr,date_start,\
date_stop,frequency,impressions,inline_post_engagement,social_spend,spend,unique_clicks,reach";

#[derive(Debug, Clone)]
pub struct FacebookConfig {
    pub graph_base: String,
    /// Also fetch insights broken down by publisher platform.
    pub publisher_breakdown: bool,
}

impl Default for FacebookConfig {
    fn default() -> Self {
        Self {
            graph_base: DEFAULT_GRAPH_BASE.to_string(),
            publisher_breakdown: true,
        }
    }
}

pub struct FacebookConnector {
    client: RetryingHttpClient,
    config: FacebookConfig,
    fetcher: PaginatedFetcher,
}

impl FacebookConnector {
    pub fn new(client: RetryingHttpClient, config: FacebookConfig) -> Self {
        Self {
            client,
            config,
            fetcher: PaginatedFetcher::default(),
        }
    }

    fn url(&self, path: &str, params: &[(&str, String)], token: &str) -> Result<String> {
        let base = format!("{}/{path}", self.config.graph_base.trim_end_matches('/'));
        let url = Url::parse_with_params(
            &base,
            params
                .iter()
                .map(|(k, v)| (*k, v.as_str()))
                .chain(std::iter::once(("access_token", token))),
        )?;
        Ok(url.into())
    }

    async fn ad_account(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let url = self.url(
            &unit.account_id,
            &[("fields", AD_ACCOUNT_FIELDS.to_string())],
            &unit.token,
        )?;
        let row: Value = self.client.request(HttpRequest::get(url)).await?.json()?;
        Ok(FetchResult {
            rows: vec![tag_platform(row, FACEBOOK_ALL)],
            request_count: 1,
        })
    }

    async fn objects(&self, unit: &SyncUnit, edge: &str, fields: &str) -> Result<FetchResult> {
        let url = self.url(
            &format!("{}/{edge}", unit.account_id),
            &[
                ("fields", fields.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ],
            &unit.token,
        )?;
        let mut source = NextLinkSource::new(&self.client, url, Some(FACEBOOK_ALL));
        self.fetcher.fetch_all(&mut source).await
    }

    async fn insights(&self, unit: &SyncUnit, level: &str) -> Result<FetchResult> {
        let time_range = json!({
            "since": unit.from.format("%Y-%m-%d").to_string(),
            "until": unit.to.format("%Y-%m-%d").to_string(),
        });
        let mut params = vec![
            ("level", level.to_string()),
            ("time_range", time_range.to_string()),
            ("time_increment", "1".to_string()),
            ("fields", INSIGHT_FIELDS.to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        let path = format!("{}/insights", unit.account_id);

        let url = self.url(&path, &params, &unit.token)?;
        let mut source = NextLinkSource::new(&self.client, url, Some(FACEBOOK_ALL));
        let mut result = self.fetcher.fetch_all(&mut source).await?;

        if self.config.publisher_breakdown {
            params.push(("breakdowns", "publisher_platform".to_string()));
            let url = self.url(&path, &params, &unit.token)?;
            let mut source = NextLinkSource::new(&self.client, url, None);
            result.merge(self.fetcher.fetch_all(&mut source).await?);
        }
        Ok(result)
    }
}

#[async_trait]
impl Connector for FacebookConnector {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn document_types(&self, _project_id: u64) -> Vec<DocumentType> {
        // Every row carries its platform; breakdown rows share ids and
        // days with the aggregate ones.
        [
            DocumentType::new("ad_account", History::Snapshot),
            DocumentType::new("campaign", History::Snapshot),
            DocumentType::new("ad_set", History::Snapshot),
            DocumentType::new("ad", History::Snapshot),
            DocumentType::new("campaign_insights", History::Daily).with_id_field("campaign_id"),
            DocumentType::new("ad_set_insights", History::Daily).with_id_field("adset_id"),
            DocumentType::new("ad_insights", History::Daily).with_id_field("ad_id"),
        ]
        .into_iter()
        .map(|t| t.with_platform("platform", FACEBOOK_ALL))
        .collect()
    }

    async fn fetch(&self, unit: &SyncUnit) -> Result<FetchResult> {
        match unit.document_type.as_str() {
            "ad_account" => self.ad_account(unit).await,
            "campaign" => self.objects(unit, "campaigns", CAMPAIGN_FIELDS).await,
            "ad_set" => self.objects(unit, "adsets", AD_SET_FIELDS).await,
            "ad" => self.objects(unit, "ads", AD_FIELDS).await,
            "campaign_insights" => self.insights(unit, "campaign").await,
            "ad_set_insights" => self.insights(unit, "adset").await,
            "ad_insights" => self.insights(unit, "ad").await,
            other => Err(Error::InvalidSyncUnit(format!("unknown facebook document type: {other}"))),
        }
    }
}

/// Graph API listing: rows under `data`, continuation under `paging.next`.
struct NextLinkSource<'a> {
    client: &'a RetryingHttpClient,
    first: String,
    /// Fixed platform tag; otherwise rows are tagged by their
    /// `publisher_platform` breakdown.
    platform: Option<&'static str>,
}

impl<'a> NextLinkSource<'a> {
    fn new(client: &'a RetryingHttpClient, first: String, platform: Option<&'static str>) -> Self {
        Self {
            client,
            first,
            platform,
        }
    }
}

#[async_trait]
impl<'a> PageSource for NextLinkSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let url = match cursor {
            PageCursor::Link(link) => link.clone(),
            _ => self.first.clone(),
        };
        let mut body: Value = self.client.request(HttpRequest::get(url)).await?.json()?;
        let rows = take_array(&mut body, "data")
            .into_iter()
            .map(|row| {
                let platform = match self.platform {
                    Some(p) => p.to_string(),
                    None => row["publisher_platform"]
                        .as_str()
                        .unwrap_or(FACEBOOK_ALL)
                        .to_string(),
                };
                tag_platform(row, &platform)
            })
            .collect();
        let next = match body["paging"]["next"].as_str() {
            Some(link) if !link.is_empty() => PageHint::Link(link.to_string()),
            _ => PageHint::End,
        };
        Ok(Page { rows, next })
    }
}

fn tag_platform(mut row: Value, platform: &str) -> Value {
    if let Value::Object(map) = &mut row {
        map.insert("platform".to_string(), Value::String(platform.to_string()));
    }
    row
}
