use crate::app::ports::{Clock, HttpClientPort, HttpGetResult};
use crate::error::{ExtractionError, RecoverableExtractionError};
use crate::observability::metrics;
use crate::pipeline::rate_limiter::RateLimiter;
use crate::pipeline::retry::RetryPolicy;
use crate::types::{JsonExt, RawRecord, RecordProfile};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const BODY_EXCERPT_CHARS: usize = 200;

/// Where the paging knobs and the item list live for a given API
#[derive(Debug, Clone, PartialEq)]
pub struct PageLayout {
    pub offset_param: String,
    pub page_size_param: String,
    /// `None` means the body itself is the item list
    pub items_field: Option<String>,
    pub total_field: Option<String>,
}

impl PageLayout {
    pub fn for_profile(profile: RecordProfile) -> Self {
        match profile {
            RecordProfile::Nvd => Self {
                offset_param: "startIndex".to_string(),
                page_size_param: "resultsPerPage".to_string(),
                items_field: Some("vulnerabilities".to_string()),
                total_field: Some("totalResults".to_string()),
            },
            RecordProfile::Posts => Self {
                offset_param: "_start".to_string(),
                page_size_param: "_limit".to_string(),
                items_field: None,
                total_field: None,
            },
        }
    }
}

/// One extraction: what to ask for
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub base_url: String,
    pub query: Vec<(String, String)>,
    pub page_size: usize,
}

/// Everything a drained cursor produced
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub records: Vec<RawRecord>,
    pub pages_fetched: usize,
    /// Set when retries ran out and extraction ended early
    pub truncated: Option<RecoverableExtractionError>,
    pub hit_page_cap: bool,
}

/// Issues paginated GET requests through a rate limiter, retrying transient
/// failures according to its retry policy.
pub struct Extractor {
    http: Arc<dyn HttpClientPort>,
    clock: Arc<dyn Clock>,
    layout: PageLayout,
    retry: RetryPolicy,
    max_pages: usize,
}

impl Extractor {
    pub fn new(
        http: Arc<dyn HttpClientPort>,
        clock: Arc<dyn Clock>,
        layout: PageLayout,
        retry: RetryPolicy,
        max_pages: usize,
    ) -> Self {
        Self {
            http,
            clock,
            layout,
            retry,
            max_pages: max_pages.max(1),
        }
    }

    /// Starts a lazy page cursor. Nothing is requested until `next_page` is awaited.
    pub fn extract<'a>(&'a self, limiter: &'a RateLimiter, request: ExtractRequest) -> RecordPages<'a> {
        RecordPages {
            extractor: self,
            limiter,
            request,
            offset: 0,
            total: None,
            pages_fetched: 0,
            records_yielded: 0,
            hit_page_cap: false,
            finished: false,
        }
    }

    async fn fetch_with_retry(
        &self,
        limiter: &RateLimiter,
        url: &str,
        query: &[(String, String)],
        page: usize,
        offset: usize,
    ) -> Result<HttpGetResult, ExtractionError> {
        let mut attempt: u32 = 0;
        let mut server_hint: Option<Duration> = None;

        loop {
            attempt += 1;
            let hint = server_hint.take().map_or(Duration::ZERO, |h| h.min(self.retry.max_delay()));
            let backoff = self.retry.delay_for(attempt).max(hint);
            if !backoff.is_zero() {
                debug!(page, attempt, "Backing off {:.1}s before retry", backoff.as_secs_f64());
                self.clock.sleep(backoff).await;
            }
            limiter.wait().await;

            let last_error = match self.http.get(url, query).await {
                Ok(resp) if resp.is_success() => return Ok(resp),
                Ok(resp) if resp.status == 429 || (500..=599).contains(&resp.status) => {
                    server_hint = resp.retry_after;
                    format!("HTTP {}", resp.status)
                }
                Ok(resp) => {
                    metrics::extract::request_failed();
                    return Err(ExtractionError::UnexpectedStatus {
                        page,
                        status: resp.status,
                        body_excerpt: resp.body_excerpt(BODY_EXCERPT_CHARS),
                    });
                }
                Err(e) if e.transient => e.message,
                Err(e) => {
                    metrics::extract::request_failed();
                    return Err(ExtractionError::Transport {
                        page,
                        message: e.message,
                    });
                }
            };

            metrics::extract::retry_scheduled();
            if !self.retry.should_retry(attempt) {
                warn!(page, attempt, "Giving up on page: {}", last_error);
                return Err(RecoverableExtractionError {
                    page,
                    offset,
                    attempts: attempt,
                    last_error,
                }
                .into());
            }
            warn!(page, attempt, "Transient failure ({}), retrying", last_error);
        }
    }

    fn parse_page(&self, page: usize, body: &[u8]) -> Result<(Vec<RawRecord>, Option<usize>), ExtractionError> {
        let malformed = |reason: String| ExtractionError::MalformedBody { page, reason };

        let value: Value =
            serde_json::from_slice(body).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

        let total = self
            .layout
            .total_field
            .as_deref()
            .and_then(|field| value.field(field))
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        let items = match (value, self.layout.items_field.as_deref()) {
            (Value::Array(items), _) => items,
            (Value::Object(mut map), Some(field)) => match map.remove(field) {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(malformed(format!("'{}' is not a list", field))),
                None => return Err(malformed(format!("missing '{}' list", field))),
            },
            (_, Some(field)) => return Err(malformed(format!("expected an object holding '{}'", field))),
            (_, None) => return Err(malformed("expected a JSON array of items".to_string())),
        };

        Ok((items, total))
    }
}

/// Lazy, finite, single-pass sequence of pages. Once it has ended (data
/// exhausted, cap reached or an error) it keeps answering `None`.
pub struct RecordPages<'a> {
    extractor: &'a Extractor,
    limiter: &'a RateLimiter,
    request: ExtractRequest,
    offset: usize,
    total: Option<usize>,
    pages_fetched: usize,
    records_yielded: usize,
    hit_page_cap: bool,
    finished: bool,
}

impl<'a> RecordPages<'a> {
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn records_yielded(&self) -> usize {
        self.records_yielded
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<RawRecord>>, ExtractionError> {
        if self.finished {
            return Ok(None);
        }
        if self.pages_fetched >= self.extractor.max_pages {
            warn!(max_pages = self.extractor.max_pages, "Page cap reached, stopping extraction");
            self.hit_page_cap = true;
            self.finished = true;
            return Ok(None);
        }
        if let Some(total) = self.total {
            if self.offset >= total {
                self.finished = true;
                return Ok(None);
            }
        }

        let page = self.pages_fetched + 1;
        let query = self.page_query();
        let fetched = self
            .extractor
            .fetch_with_retry(self.limiter, &self.request.base_url, &query, page, self.offset)
            .await;
        let resp = match fetched {
            Ok(resp) => resp,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        self.pages_fetched += 1;

        let (items, total) = match self.extractor.parse_page(page, &resp.bytes) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };
        if total.is_some() {
            self.total = total;
        }

        metrics::extract::page_fetched(items.len(), resp.bytes.len());
        debug!(page, offset = self.offset, items = items.len(), "Fetched page");

        if items.is_empty() {
            self.finished = true;
            return Ok(None);
        }
        self.offset += items.len();
        self.records_yielded += items.len();
        Ok(Some(items))
    }

    /// Drains the cursor. Exhausted retries end extraction early and are
    /// reported in `truncated`; every other error is returned as-is.
    #[instrument(skip(self))]
    pub async fn collect_all(&mut self) -> Result<ExtractOutcome, ExtractionError> {
        let mut records = Vec::new();
        let mut truncated = None;

        loop {
            match self.next_page().await {
                Ok(Some(items)) => records.extend(items),
                Ok(None) => break,
                Err(ExtractionError::Recoverable(e)) => {
                    warn!("Extraction ended early, keeping {} records: {}", records.len(), e);
                    metrics::extract::truncated();
                    truncated = Some(e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "Extracted {} records over {} pages",
            records.len(),
            self.pages_fetched
        );
        Ok(ExtractOutcome {
            records,
            pages_fetched: self.pages_fetched,
            truncated,
            hit_page_cap: self.hit_page_cap,
        })
    }

    fn page_query(&self) -> Vec<(String, String)> {
        let layout = &self.extractor.layout;
        let mut query = self.request.query.clone();
        query.push((layout.offset_param.clone(), self.offset.to_string()));
        query.push((layout.page_size_param.clone(), self.request.page_size.to_string()));
        query
    }
}

/// NVD's publication-date filter covering the last `days` days
pub fn nvd_publication_window(now: DateTime<Utc>, days: i64) -> Vec<(String, String)> {
    let start = chrono::Duration::try_days(days.max(0))
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let fmt = "%Y-%m-%dT%H:%M:%S%.3fZ";
    vec![
        ("pubStartDate".to_string(), start.format(fmt).to_string()),
        ("pubEndDate".to_string(), now.format(fmt).to_string()),
    ]
}
