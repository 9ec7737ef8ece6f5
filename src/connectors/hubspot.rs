use async_trait::async_trait;
use serde_json::Value;

use super::{take_array, Connector, Platform};
use crate::config::AllowList;
use crate::error::{Error, Result};
use crate::http::{HttpRequest, RetryingHttpClient};
use crate::sync::pagination::{Page, PageCursor, PageHint, PageSource, PaginatedFetcher};
use crate::sync::unit::SyncUnit;
use crate::sync::{DocumentType, FetchResult, History};

pub const DEFAULT_API_BASE: &str = "https://api.hubapi.com";
const PAGE_SIZE: u32 = 100;
/// Bulk updates can land in the recent lists late.
const RECENT_LAG_MS: i64 = 10_800 * 1000;
const CONTACT_MODIFIED: &str = "lastmodifieddate";

const CONTACT: DocumentType = DocumentType::new("contact", History::Cursor).with_id_field("vid");
const COMPANY: DocumentType = DocumentType::new("company", History::Cursor).with_id_field("companyId");
const DEAL: DocumentType = DocumentType::new("deal", History::Cursor).with_id_field("dealId");
const FORM: DocumentType = DocumentType::new("form", History::Cursor).with_id_field("guid");
const FORM_SUBMISSION: DocumentType =
    DocumentType::new("form_submission", History::Cursor).with_id_field("conversionId");
const DELETED_CONTACTS: DocumentType = DocumentType::new("deleted_contacts", History::Cursor);

#[derive(Debug, Clone)]
pub struct HubSpotConfig {
    pub api_base: String,
    /// Projects that also sync archived contacts.
    pub deleted_contacts_projects: AllowList,
}

impl Default for HubSpotConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            deleted_contacts_projects: AllowList::none(),
        }
    }
}

/// HubSpot portals are per project; the unit token is the API key.
pub struct HubSpotConnector {
    client: RetryingHttpClient,
    config: HubSpotConfig,
    fetcher: PaginatedFetcher,
}

impl HubSpotConnector {
    pub fn new(client: RetryingHttpClient, config: HubSpotConfig) -> Self {
        Self {
            client,
            config,
            fetcher: PaginatedFetcher::default(),
        }
    }

    fn url(&self, path: &str, api_key: &str, params: &[(&str, String)]) -> Result<String> {
        let base = format!("{}/{path}", self.config.api_base.trim_end_matches('/'));
        let mut url = url::Url::parse(&base)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("hapikey", api_key);
            for (key, value) in params {
                query.append_pair(key, value);
            }
        }
        Ok(url.into())
    }

    async fn get(&self, url: String) -> Result<Value> {
        self.client.request(HttpRequest::get(url)).await?.json()
    }

    /// Property names for an object type (`contacts`, `companies`, `deals`).
    async fn properties(&self, object: &str, api_key: &str) -> Result<Vec<String>> {
        let url = self.url(&format!("properties/v1/{object}/properties"), api_key, &[])?;
        let body = self.get(url).await?;
        let Value::Array(items) = body else {
            return Err(Error::MalformedResponse(format!("{object} properties is not a list")));
        };
        Ok(items
            .iter()
            .filter_map(|p| p["name"].as_str().map(str::to_string))
            .collect())
    }

    async fn contacts(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let properties = self.properties("contacts", &unit.token).await?;
        let (path, cutoff) = if unit.is_first_run {
            log::info!("Downloading all contacts for project {}", unit.project_id);
            ("contacts/v1/lists/all/contacts/all", None)
        } else {
            log::info!("Downloading recently modified contacts for project {}", unit.project_id);
            (
                "contacts/v1/lists/recently_updated/contacts/recent",
                Some(unit.last_timestamp - RECENT_LAG_MS),
            )
        };
        let mut source = ContactSource {
            connector: self,
            api_key: &unit.token,
            path,
            properties,
            cutoff,
            without_properties: false,
            extra_requests: 0,
        };
        let mut result = self.fetcher.fetch_all(&mut source).await?;
        // Property listing plus batch lookups made after a 414.
        result.request_count += 1 + source.extra_requests;
        Ok(result)
    }

    async fn companies(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let limit = ("limit", PAGE_SIZE.to_string());
        let mut source = if unit.is_first_run {
            let properties = self.properties("companies", &unit.token).await?;
            let mut params = vec![limit];
            params.extend(properties.into_iter().map(|p| ("properties", p)));
            OffsetSource::new(
                &self.client,
                self.url("companies/v2/companies/paged", &unit.token, &params)?,
                "companies",
            )
        } else {
            let params = [limit, ("since", unit.last_timestamp.to_string())];
            OffsetSource::new(
                &self.client,
                self.url("companies/v2/companies/recent/modified", &unit.token, &params)?,
                "results",
            )
        };
        let mut result = self.fetcher.fetch_all(&mut source).await?;
        if unit.is_first_run {
            result.request_count += 1;
        }
        result.request_count += self.fill_company_contacts(&mut result.rows, &unit.token).await?;
        Ok(result)
    }

    /// Adds `contactIds` to each company. Returns the requests made.
    async fn fill_company_contacts(&self, companies: &mut [Value], api_key: &str) -> Result<u64> {
        let mut requests = 0;
        for company in companies.iter_mut() {
            let Some(id) = company["companyId"].as_i64() else {
                continue;
            };
            let url = self.url(&format!("companies/v2/companies/{id}/contacts"), api_key, &[])?;
            requests += 1;
            let ids: Vec<Value> = match self.get(url).await {
                Ok(mut body) => take_array(&mut body, "contacts")
                    .into_iter()
                    .filter_map(|c| c.get("vid").cloned())
                    .collect(),
                Err(e) if e.aborts_job() => return Err(e),
                Err(e) => {
                    log::warn!("Contacts for company {id} unavailable: {e}");
                    Vec::new()
                }
            };
            if let Value::Object(map) = company {
                map.insert("contactIds".to_string(), Value::Array(ids));
            }
        }
        Ok(requests)
    }

    async fn deals(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let limit = ("limit", PAGE_SIZE.to_string());
        if unit.is_first_run {
            let properties = self.properties("deals", &unit.token).await?;
            let mut params = vec![limit.clone(), ("includeAssociations", "true".to_string())];
            params.extend(properties.into_iter().map(|p| ("properties", p)));
            let fallback = [
                limit,
                ("includeAssociations", "true".to_string()),
                ("includeAllProperties", "true".to_string()),
            ];
            let path = "deals/v1/deal/paged";
            let mut source = OffsetSource::new(&self.client, self.url(path, &unit.token, &params)?, "deals")
                .with_fallback(self.url(path, &unit.token, &fallback)?);
            let mut result = self.fetcher.fetch_all(&mut source).await?;
            result.request_count += 1;
            return Ok(result);
        }

        let mut result = FetchResult::default();
        for path in ["deals/v1/deal/recent/created", "deals/v1/deal/recent/modified"] {
            let url = self.url(path, &unit.token, std::slice::from_ref(&limit))?;
            let mut source = OffsetSource::new(&self.client, url, "results");
            result.merge(self.fetcher.fetch_all(&mut source).await?);
        }
        Ok(result)
    }

    async fn forms(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let url = self.url("forms/v2/forms", &unit.token, &[])?;
        match self.get(url).await? {
            Value::Array(rows) => Ok(FetchResult {
                rows,
                request_count: 1,
            }),
            _ => Err(Error::MalformedResponse("forms response is not a list".into())),
        }
    }

    /// Submissions of every form, each tagged with its `formId`.
    async fn form_submissions(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let forms = self.forms(unit).await?;
        let mut result = FetchResult {
            rows: Vec::new(),
            request_count: forms.request_count,
        };
        if forms.rows.is_empty() {
            log::warn!("No forms for project {}, no submissions to sync", unit.project_id);
        }

        for form in &forms.rows {
            let Some(form_id) = form["guid"].as_str().filter(|id| !id.is_empty()) else {
                log::warn!("Form without guid in project {}", unit.project_id);
                continue;
            };
            let url = self.url(
                &format!("form-integrations/v1/submissions/forms/{form_id}"),
                &unit.token,
                &[],
            )?;
            result.request_count += 1;
            let mut body = self.get(url).await?;
            let Some(Value::Array(submissions)) = body.get_mut("results").map(Value::take) else {
                return Err(Error::MalformedResponse(format!(
                    "submissions of form {form_id} without results"
                )));
            };
            log::debug!("{} submissions for form {form_id}", submissions.len());
            result.rows.extend(submissions.into_iter().map(|mut submission| {
                if let Value::Object(map) = &mut submission {
                    map.insert("formId".to_string(), Value::String(form_id.to_string()));
                }
                submission
            }));
        }
        Ok(result)
    }

    async fn deleted_contacts(&self, unit: &SyncUnit) -> Result<FetchResult> {
        let params = [("archived", "true".to_string()), ("limit", PAGE_SIZE.to_string())];
        let mut source = ArchivedSource {
            client: &self.client,
            first: self.url("crm/v3/objects/contacts", &unit.token, &params)?,
            api_key: &unit.token,
        };
        self.fetcher.fetch_all(&mut source).await
    }
}

#[async_trait]
impl Connector for HubSpotConnector {
    fn platform(&self) -> Platform {
        Platform::HubSpot
    }

    fn document_types(&self, project_id: u64) -> Vec<DocumentType> {
        let mut types = vec![CONTACT, COMPANY, DEAL, FORM, FORM_SUBMISSION];
        if self.config.deleted_contacts_projects.contains_project(project_id) {
            types.push(DELETED_CONTACTS);
        }
        types
    }

    fn account_scoped(&self) -> bool {
        false
    }

    async fn fetch(&self, unit: &SyncUnit) -> Result<FetchResult> {
        match unit.document_type.as_str() {
            "contact" => self.contacts(unit).await,
            "company" => self.companies(unit).await,
            "deal" => self.deals(unit).await,
            "form" => self.forms(unit).await,
            "form_submission" => self.form_submissions(unit).await,
            "deleted_contacts" => self.deleted_contacts(unit).await,
            other => Err(Error::InvalidSyncUnit(format!("unknown hubspot document type: {other}"))),
        }
    }
}

// ── Contacts ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recency {
    /// Every record on the page is newer than the cutoff.
    Continue,
    /// Reached records older than the cutoff.
    Stop,
    /// Newest-first ordering broken or timestamps missing; read everything.
    Unordered,
}

fn contact_modified(contact: &Value) -> Option<i64> {
    let value = &contact["properties"][CONTACT_MODIFIED]["value"];
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn check_recency(contacts: &[Value], cutoff: i64) -> Recency {
    let mut previous = i64::MAX;
    for contact in contacts {
        let Some(modified) = contact_modified(contact) else {
            return Recency::Unordered;
        };
        if modified > previous {
            return Recency::Unordered;
        }
        if modified < cutoff {
            return Recency::Stop;
        }
        previous = modified;
    }
    Recency::Continue
}

/// Contact lists page with `vid-offset` (and `time-offset` on the recent
/// list), carried as `vid|time` in the cursor.
struct ContactSource<'a> {
    connector: &'a HubSpotConnector,
    api_key: &'a str,
    path: &'static str,
    properties: Vec<String>,
    /// Recent list only: stop once records are older than this.
    cutoff: Option<i64>,
    /// Set after a 414; properties are then looked up by vid.
    without_properties: bool,
    extra_requests: u64,
}

impl<'a> ContactSource<'a> {
    fn page_params(&self, cursor: &PageCursor) -> Vec<(&'static str, String)> {
        let mut params = vec![("count", PAGE_SIZE.to_string())];
        if let PageCursor::Composite(value) = cursor {
            let mut parts = value.splitn(2, '|');
            if let Some(vid) = parts.next().filter(|v| !v.is_empty()) {
                params.push(("vidOffset", vid.to_string()));
            }
            if let Some(time) = parts.next().filter(|t| !t.is_empty()) {
                params.push(("timeOffset", time.to_string()));
            }
        }
        params
    }

    async fn fill_properties(&mut self, contacts: &mut [Value]) -> Result<()> {
        let vids: Vec<(&str, String)> = contacts
            .iter()
            .filter_map(|c| c["vid"].as_i64())
            .map(|vid| ("vid", vid.to_string()))
            .collect();
        if vids.is_empty() {
            return Ok(());
        }
        let url = self
            .connector
            .url("contacts/v1/contact/vids/batch", self.api_key, &vids)?;
        self.extra_requests += 1;
        let batch = self.connector.get(url).await?;
        for contact in contacts.iter_mut() {
            let Some(vid) = contact["vid"].as_i64() else {
                continue;
            };
            match batch[vid.to_string()].get("properties") {
                Some(properties) => contact["properties"] = properties.clone(),
                None => log::warn!("Contact {vid} missing from batch lookup"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<'a> PageSource for ContactSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let params = self.page_params(cursor);

        let mut body = None;
        if !self.without_properties {
            let mut with_properties = params.clone();
            with_properties.extend(self.properties.iter().map(|p| ("property", p.clone())));
            let url = self.connector.url(self.path, self.api_key, &with_properties)?;
            match self.connector.get(url).await {
                Ok(b) => body = Some(b),
                Err(Error::UriTooLong { .. }) => {
                    log::warn!("Contact property list too long, looking properties up by vid");
                    self.without_properties = true;
                }
                Err(e) => return Err(e),
            }
        }
        let mut body = match body {
            Some(b) => b,
            None => {
                let url = self.connector.url(self.path, self.api_key, &params)?;
                self.connector.get(url).await?
            }
        };

        let Some(Value::Array(mut rows)) = body.get_mut("contacts").map(Value::take) else {
            return Err(Error::MalformedResponse("contacts list without contacts".into()));
        };

        // Rows fetched without properties carry no modified date yet.
        if self.without_properties {
            self.fill_properties(&mut rows).await?;
        }

        let mut has_more = body["has-more"].as_bool().unwrap_or(false);
        if let Some(cutoff) = self.cutoff {
            match check_recency(&rows, cutoff) {
                Recency::Stop => has_more = false,
                Recency::Unordered => {
                    log::warn!("Recent contacts out of order, reading the full list");
                    self.cutoff = None;
                }
                Recency::Continue => {}
            }
        }

        let vid = offset_value(&body["vid-offset"]);
        let next = match vid {
            Some(vid) => {
                let value = match offset_value(&body["time-offset"]) {
                    Some(time) if self.path.contains("recent") => format!("{vid}|{time}"),
                    _ => vid,
                };
                PageHint::Cursor { value, has_more }
            }
            None => PageHint::End,
        };
        Ok(Page { rows, next })
    }
}

// ── Offset lists (companies, deals) ─────────────────────────────────

/// `offset` plus `has-more` (or `hasMore`, depending on the endpoint).
struct OffsetSource<'a> {
    client: &'a RetryingHttpClient,
    url: String,
    /// Request used instead of `url` after a 414.
    fallback: Option<String>,
    use_fallback: bool,
    rows_key: &'static str,
}

impl<'a> OffsetSource<'a> {
    fn new(client: &'a RetryingHttpClient, url: String, rows_key: &'static str) -> Self {
        Self {
            client,
            url,
            fallback: None,
            use_fallback: false,
            rows_key,
        }
    }

    fn with_fallback(mut self, url: String) -> Self {
        self.fallback = Some(url);
        self
    }

    fn page_url(&self, cursor: &PageCursor) -> String {
        let base = match (&self.fallback, self.use_fallback) {
            (Some(fallback), true) => fallback,
            _ => &self.url,
        };
        match cursor {
            PageCursor::Composite(offset) => format!("{base}&offset={offset}"),
            _ => base.clone(),
        }
    }
}

#[async_trait]
impl<'a> PageSource for OffsetSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let response = match self.client.request(HttpRequest::get(self.page_url(cursor))).await {
            Err(Error::UriTooLong { .. }) if self.fallback.is_some() && !self.use_fallback => {
                log::warn!("Property list too long, requesting all properties instead");
                self.use_fallback = true;
                self.client.request(HttpRequest::get(self.page_url(cursor))).await?
            }
            other => other?,
        };
        let mut body: Value = response.json()?;
        let rows = take_array(&mut body, self.rows_key);
        let has_more = body
            .get("has-more")
            .or_else(|| body.get("hasMore"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let next = match offset_value(&body["offset"]) {
            Some(value) => PageHint::Cursor { value, has_more },
            None => PageHint::End,
        };
        Ok(Page { rows, next })
    }
}

// ── Archived contacts ───────────────────────────────────────────────

/// CRM v3 listing with `paging.next.link`. The link drops the API key.
struct ArchivedSource<'a> {
    client: &'a RetryingHttpClient,
    first: String,
    api_key: &'a str,
}

#[async_trait]
impl<'a> PageSource for ArchivedSource<'a> {
    async fn fetch_page(&mut self, cursor: &PageCursor) -> Result<Page> {
        let url = match cursor {
            PageCursor::Link(link) => {
                let separator = if link.contains('?') { '&' } else { '?' };
                format!("{link}{separator}hapikey={}", self.api_key)
            }
            _ => self.first.clone(),
        };
        let mut body: Value = self.client.request(HttpRequest::get(url)).await?.json()?;
        let rows = take_array(&mut body, "results");
        let next = match body["paging"]["next"]["link"].as_str() {
            Some(link) if !link.is_empty() => PageHint::Link(link.to_string()),
            _ => PageHint::End,
        };
        Ok(Page { rows, next })
    }
}

fn offset_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
