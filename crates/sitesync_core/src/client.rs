use std::collections::{BTreeMap, BTreeSet};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{HttpSettings, SiteConfig};
use crate::record::{ContentRecord, RecordOrigin};

pub const TOTAL_PAGES_HEADER: &str = "X-WP-TotalPages";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("{url} does not exist (HTTP 404)")]
    NotFound { url: String },
    #[error("{url} answered HTTP {status}")]
    Http { url: String, status: u16 },
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("{url} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last: String,
    },
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageResponse {
    pub items: Vec<Value>,
    pub total_pages: Option<usize>,
}

/// The CMS as seen by the pipeline. `CmsClient` is the HTTP implementation.
pub trait CmsApi {
    fn get_page(&mut self, url: &str, page: usize, per_page: usize)
    -> Result<PageResponse, FetchError>;
    /// Fetch a single object; `Ok(None)` when the CMS reports 404.
    fn get_item(&mut self, url: &str) -> Result<Option<Value>, FetchError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub per_page: usize,
    pub max_gap_fill: usize,
    /// Collection URL whose item URLs are `{item_base}/{id}`; used to fill ID gaps.
    pub item_base: Option<String>,
    /// Generic collection consulted when the listing looks thin.
    pub fallback_url: Option<String>,
}

impl FetchOptions {
    pub fn from_config(config: &SiteConfig) -> Self {
        Self {
            per_page: config.http.per_page,
            max_gap_fill: config.http.max_gap_fill,
            item_base: None,
            fallback_url: Some(config.endpoints.fallback_url()),
        }
    }
}

pub struct CmsClient {
    client: Client,
    settings: HttpSettings,
    request_count: usize,
}

impl CmsClient {
    pub fn new(settings: HttpSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()
            .context("failed to build CMS HTTP client")?;
        Ok(Self {
            client,
            settings,
            request_count: 0,
        })
    }

    pub fn from_config(config: &SiteConfig) -> Result<Self> {
        Self::new(config.http.clone())
    }

    /// GET with linear backoff (`retry_delay_ms * retry`); 404 is final.
    fn request(&mut self, url: &str, query: &[(&str, String)]) -> Result<(Value, Option<usize>), FetchError> {
        let parsed = Url::parse(url).map_err(|error| FetchError::Transport {
            url: url.to_string(),
            message: format!("invalid URL: {error}"),
        })?;

        let mut last_error = None::<FetchError>;
        for attempt in 0..=self.settings.max_retries {
            if attempt > 0 {
                let delay = self.settings.retry_delay_ms.saturating_mul(attempt as u64);
                debug!(url, attempt, delay_ms = delay, "retrying CMS request");
                sleep(Duration::from_millis(delay));
            }
            self.request_count += 1;
            let response = self
                .client
                .get(parsed.clone())
                .header("User-Agent", self.settings.user_agent.clone())
                .header("Accept", "application/json")
                .query(query)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Err(FetchError::NotFound {
                            url: url.to_string(),
                        });
                    }
                    if !status.is_success() {
                        let error = FetchError::Http {
                            url: url.to_string(),
                            status: status.as_u16(),
                        };
                        if is_retryable_status(status) {
                            warn!(url, status = status.as_u16(), attempt, "CMS request failed");
                            last_error = Some(error);
                            continue;
                        }
                        return Err(error);
                    }
                    let total_pages = response
                        .headers()
                        .get(TOTAL_PAGES_HEADER)
                        .and_then(|value| value.to_str().ok())
                        .and_then(|value| value.trim().parse::<usize>().ok());
                    let payload: Value = response.json().map_err(|error| FetchError::Decode {
                        url: url.to_string(),
                        message: error.to_string(),
                    })?;
                    return Ok((payload, total_pages));
                }
                Err(error) => {
                    warn!(url, attempt, %error, "CMS request failed");
                    last_error = Some(FetchError::Transport {
                        url: url.to_string(),
                        message: error.to_string(),
                    });
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: self.settings.max_retries + 1,
            last: last_error
                .map(|error| error.to_string())
                .unwrap_or_else(|| "no response".to_string()),
        })
    }
}

impl CmsApi for CmsClient {
    fn get_page(
        &mut self,
        url: &str,
        page: usize,
        per_page: usize,
    ) -> Result<PageResponse, FetchError> {
        let (payload, total_pages) = self.request(
            url,
            &[("page", page.to_string()), ("per_page", per_page.to_string())],
        )?;
        let items = match payload {
            Value::Array(items) => items,
            // Some custom endpoints wrap the listing: {"data": [...]} or {"items": [...]}.
            Value::Object(mut fields) => match fields
                .remove("data")
                .or_else(|| fields.remove("items"))
                .or_else(|| fields.remove("posts"))
            {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => {
                return Err(FetchError::Decode {
                    url: url.to_string(),
                    message: "expected a JSON array of records".to_string(),
                });
            }
        };
        Ok(PageResponse { items, total_pages })
    }

    fn get_item(&mut self, url: &str) -> Result<Option<Value>, FetchError> {
        match self.request(url, &[]) {
            Ok((payload, _)) => Ok(Some(unwrap_single(payload))),
            Err(error) if error.is_not_found() => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Fetch every record of a collection: paginate, fill ID gaps, then consult the fallback listing.
pub fn fetch_complete_data<A: CmsApi>(
    api: &mut A,
    url: &str,
    options: &FetchOptions,
) -> Result<Vec<ContentRecord>, FetchError> {
    let per_page = options.per_page.max(1);
    let mut by_id: BTreeMap<u64, ContentRecord> = BTreeMap::new();
    let mut total_items = 0usize;
    let mut page = 1usize;

    loop {
        let response = match api.get_page(url, page, per_page) {
            Ok(response) => response,
            Err(error) if page > 1 && error.is_not_found() => {
                debug!(url, page, "page past the end of the collection");
                break;
            }
            Err(error) => return Err(error),
        };
        if response.items.is_empty() {
            break;
        }
        let received = response.items.len();
        total_items += received;
        for item in response.items {
            insert_record(&mut by_id, item, url, RecordOrigin::Listing);
        }
        info!(url, page, received, "fetched CMS page");

        match response.total_pages {
            Some(total) if page >= total => break,
            None if received < per_page => break,
            _ => {}
        }
        page += 1;
    }

    if let Some(item_base) = options.item_base.as_deref() {
        fill_id_gaps(api, item_base, &mut by_id, options.max_gap_fill);
    }

    let distinct = by_id.len();
    if let Some(fallback_url) = options.fallback_url.as_deref()
        && distinct > 0
        && total_items < distinct * 3
    {
        merge_fallback(api, fallback_url, per_page, &mut by_id);
    }

    Ok(by_id.into_values().rev().collect())
}

/// IDs missing between the smallest and largest known ID, ascending, capped at `limit`.
pub fn missing_ids(known: &BTreeSet<u64>, limit: usize) -> Vec<u64> {
    let (Some(&min), Some(&max)) = (known.first(), known.last()) else {
        return Vec::new();
    };
    (min..=max)
        .filter(|id| !known.contains(id))
        .take(limit)
        .collect()
}

fn fill_id_gaps<A: CmsApi>(
    api: &mut A,
    item_base: &str,
    by_id: &mut BTreeMap<u64, ContentRecord>,
    limit: usize,
) {
    let known = by_id.keys().copied().collect::<BTreeSet<_>>();
    let candidates = missing_ids(&known, limit);
    if candidates.is_empty() {
        return;
    }
    debug!(count = candidates.len(), "probing ID gaps");
    let base = item_base.trim_end_matches('/');
    for id in candidates {
        let item_url = format!("{base}/{id}");
        match api.get_item(&item_url) {
            Ok(Some(value)) => insert_record(by_id, value, &item_url, RecordOrigin::GapFill),
            Ok(None) => {}
            Err(error) => warn!(id, %error, "gap-fill fetch failed"),
        }
    }
}

fn merge_fallback<A: CmsApi>(
    api: &mut A,
    fallback_url: &str,
    per_page: usize,
    by_id: &mut BTreeMap<u64, ContentRecord>,
) {
    match api.get_page(fallback_url, 1, per_page) {
        Ok(response) => {
            let before = by_id.len();
            for item in response.items {
                let Some(id) = item.get("id").and_then(Value::as_u64) else {
                    continue;
                };
                if by_id.contains_key(&id) {
                    continue;
                }
                insert_record(by_id, item, fallback_url, RecordOrigin::Fallback);
            }
            let added = by_id.len() - before;
            if added > 0 {
                info!(fallback_url, added, "merged records from fallback collection");
            }
        }
        Err(error) => warn!(fallback_url, %error, "fallback collection fetch failed"),
    }
}

fn insert_record(
    by_id: &mut BTreeMap<u64, ContentRecord>,
    item: Value,
    source: &str,
    origin: RecordOrigin,
) {
    match ContentRecord::from_value(item) {
        Ok(mut record) => {
            record.origin = origin;
            by_id.entry(record.id).or_insert(record);
        }
        Err(error) => warn!(source, error = %format!("{error:#}"), "skipping undecodable record"),
    }
}

fn unwrap_single(payload: Value) -> Value {
    match payload {
        Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        Value::Object(mut fields) if fields.get("data").is_some_and(Value::is_object) => {
            fields.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
}

/// Item URL base for a collection endpoint: the URL without its query string.
pub fn item_base_for(collection_url: &str) -> String {
    collection_url
        .split_once('?')
        .map(|(base, _)| base)
        .unwrap_or(collection_url)
        .trim_end_matches('/')
        .to_string()
}
