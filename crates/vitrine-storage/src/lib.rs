//! Record store client (PostgREST-style REST) + rate-limited page fetcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vitrine_core::ProductRecord;

pub const CRATE_NAME: &str = "vitrine-storage";

/// Columns fetched for the sync snapshot. Embeddings are deliberately not
/// selected: they are not comparable fields and the payload would be huge.
const SNAPSHOT_SELECT: &str = "id,source,product_url,image_url,additional_images,brand,title,\
description,category,gender,price,size,metadata,tags,country,second_hand,sale,other";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("store returned http {status} for {context}")]
    HttpStatus { status: u16, context: String },
}

/// Per-row write result, aggregated into the summary counts by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Failed(String),
}

pub fn written_count(outcomes: &[WriteOutcome]) -> usize {
    outcomes
        .iter()
        .filter(|o| matches!(o, WriteOutcome::Written))
        .count()
}

/// Remote products-table operations the sync engine needs. The engine takes
/// this as an explicit handle so tests can substitute an in-memory double.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Full paginated scan of one source's rows. Failure here is fatal for
    /// a sync run: without a baseline every stored row would look removed.
    async fn list_existing(&self, source: &str) -> Result<Vec<ProductRecord>, StoreError>;

    /// Insert-or-ignore: rows conflicting on the unique key are silently
    /// dropped, not errors. Never fails the batch; failed rows are reported
    /// in their outcome.
    async fn insert_ignore_duplicates(&self, records: &[ProductRecord]) -> Vec<WriteOutcome>;

    /// Full-row replace keyed by id.
    async fn update(&self, records: &[ProductRecord]) -> Vec<WriteOutcome>;

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Vec<WriteOutcome>;

    /// Cheap connectivity probe against the products table.
    async fn check_connection(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    /// Page size for the snapshot scan.
    pub page_size: usize,
    /// Chunk size for batched writes; keeps payloads under request limits.
    pub chunk_size: usize,
    pub timeout: Duration,
}

impl StoreConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let base_url = std::env::var("VITRINE_STORE_URL")
            .context("VITRINE_STORE_URL must be set to the table store root URL")?;
        let api_key = std::env::var("VITRINE_STORE_KEY")
            .context("VITRINE_STORE_KEY must be set to the table store API key")?;
        Ok(Self {
            base_url,
            api_key,
            page_size: 500,
            chunk_size: 100,
            timeout: Duration::from_secs(30),
        })
    }
}

/// PostgREST-style client for the products table.
#[derive(Debug)]
pub struct RestRecordStore {
    client: reqwest::Client,
    endpoint: String,
    chunk_size: usize,
    page_size: usize,
}

impl RestRecordStore {
    pub fn new(config: StoreConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let key_value = reqwest::header::HeaderValue::from_str(&config.api_key)
            .context("store API key is not a valid header value")?;
        let bearer = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .context("store API key is not a valid header value")?;
        headers.insert("apikey", key_value);
        headers.insert(reqwest::header::AUTHORIZATION, bearer);
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .context("building record store client")?;

        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/products", config.base_url.trim_end_matches('/')),
            chunk_size: config.chunk_size.max(1),
            page_size: config.page_size.max(1),
        })
    }

    fn prefer_header(ignore_duplicates: bool) -> &'static str {
        if ignore_duplicates {
            "resolution=ignore-duplicates,return=minimal"
        } else {
            "resolution=merge-duplicates,return=minimal"
        }
    }

    async fn post_rows(
        &self,
        rows: &[ProductRecord],
        prefer: &'static str,
    ) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("Prefer", prefer)
            .json(rows)
            .send()
            .await?;
        let status = resp.status();
        if matches!(
            status,
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT
        ) {
            Ok(())
        } else {
            Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: format!("writing {} row(s)", rows.len()),
            })
        }
    }

    /// Chunked write with row-by-row fallback: one malformed record must
    /// not block the rest of the batch.
    async fn write_rows(
        &self,
        records: &[ProductRecord],
        prefer: &'static str,
    ) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.chunk_size) {
            match self.post_rows(chunk, prefer).await {
                Ok(()) => {
                    debug!(rows = chunk.len(), "store chunk written");
                    outcomes.extend(std::iter::repeat_n(WriteOutcome::Written, chunk.len()));
                }
                Err(err) => {
                    warn!(rows = chunk.len(), %err, "store chunk failed; retrying row-by-row");
                    for row in chunk {
                        match self.post_rows(std::slice::from_ref(row), prefer).await {
                            Ok(()) => outcomes.push(WriteOutcome::Written),
                            Err(row_err) => {
                                error!(title = %row.title, %row_err, "store row write failed");
                                outcomes.push(WriteOutcome::Failed(row_err.to_string()));
                            }
                        }
                    }
                }
            }
        }
        outcomes
    }

    async fn delete_where(&self, id_filter: &str, rows: usize) -> Result<(), StoreError> {
        let resp = self
            .client
            .delete(&self.endpoint)
            .query(&[("id", id_filter)])
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: format!("deleting {rows} row(s)"),
            })
        }
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    async fn list_existing(&self, source: &str) -> Result<Vec<ProductRecord>, StoreError> {
        let mut collected = Vec::new();
        let mut offset = 0usize;
        loop {
            let resp = self
                .client
                .get(&self.endpoint)
                .query(&[
                    ("select", SNAPSHOT_SELECT),
                    ("source", &format!("eq.{source}")),
                    ("limit", &self.page_size.to_string()),
                    ("offset", &offset.to_string()),
                ])
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(StoreError::HttpStatus {
                    status: status.as_u16(),
                    context: format!("listing rows for source {source} at offset {offset}"),
                });
            }
            let page: Vec<ProductRecord> = resp.json().await?;
            let page_len = page.len();
            collected.extend(page);
            if page_len < self.page_size {
                break;
            }
            offset += self.page_size;
        }
        info!(source, rows = collected.len(), "fetched existing snapshot");
        Ok(collected)
    }

    async fn insert_ignore_duplicates(&self, records: &[ProductRecord]) -> Vec<WriteOutcome> {
        if records.is_empty() {
            return Vec::new();
        }
        self.write_rows(records, Self::prefer_header(true)).await
    }

    async fn update(&self, records: &[ProductRecord]) -> Vec<WriteOutcome> {
        if records.is_empty() {
            return Vec::new();
        }
        self.write_rows(records, Self::prefer_header(false)).await
    }

    async fn delete_by_ids(&self, ids: &[Uuid]) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.chunk_size) {
            let joined = chunk
                .iter()
                .map(Uuid::to_string)
                .collect::<Vec<_>>()
                .join(",");
            match self.delete_where(&format!("in.({joined})"), chunk.len()).await {
                Ok(()) => outcomes.extend(std::iter::repeat_n(WriteOutcome::Written, chunk.len())),
                Err(err) => {
                    warn!(rows = chunk.len(), %err, "delete chunk failed; retrying row-by-row");
                    for id in chunk {
                        match self.delete_where(&format!("eq.{id}"), 1).await {
                            Ok(()) => outcomes.push(WriteOutcome::Written),
                            Err(row_err) => {
                                error!(%id, %row_err, "store row delete failed");
                                outcomes.push(WriteOutcome::Failed(row_err.to_string()));
                            }
                        }
                    }
                }
            }
        }
        outcomes
    }

    async fn check_connection(&self) -> Result<(), StoreError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("select", "id"), ("limit", "1")])
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(StoreError::HttpStatus {
                status: status.as_u16(),
                context: "connection probe".to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug)]
struct RateLimiterState {
    tokens: u32,
    last_refill: Instant,
}

/// Token-bucket rate limiter for storefront politeness.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn per_second(requests_per_second: f64) -> Self {
        let rps = requests_per_second.max(0.1);
        Self {
            capacity: 1,
            refill_every: Duration::from_secs_f64(1.0 / rps),
            state: Mutex::new(RateLimiterState {
                tokens: 1,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_concurrent: usize,
    pub requests_per_second: f64,
    pub backoff: BackoffPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36"
                .to_string(),
            max_concurrent: 5,
            requests_per_second: 2.0,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Storefront page fetcher: bounded concurrency, token-bucket pacing, and
/// exponential-backoff retries on transient failures.
#[derive(Debug)]
pub struct PageFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    rate: RateLimiter,
    backoff: BackoffPolicy,
}

impl PageFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("en-US,en;q=0.5"),
        );

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building page fetcher client")?;

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            rate: RateLimiter::per_second(config.requests_per_second),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");
        self.rate.take().await;

        let mut last_request_error: Option<reqwest::Error> = None;
        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
