//! Sync engine: diffs the freshly scraped catalog against the stored
//! snapshot and converges the store with the minimal set of mutations,
//! guarded against mass deletion when a scrape run degrades.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use vitrine_core::{normalize_url, ProductRecord};
use vitrine_embed::{info_text, Embedder};
use vitrine_extract::{
    extract_product, has_next_page, parse_product_links, parse_products_json, ExtractContext,
};
use vitrine_storage::{written_count, PageFetcher, RecordStore};

pub const CRATE_NAME: &str = "vitrine-sync";

/// Shopify's products.json returns at most a full page of 50 before paging.
const PRODUCTS_JSON_PAGE: usize = 50;

/// Safety valve against wiping the catalog when discovery or extraction
/// degrades (bot block, markup change) and a run returns near-zero products.
///
/// Deletion is cleared when the run would remove at least
/// `max_delete_ratio` of the known catalog while inserting fewer than
/// `min_replacement_ratio` times as many replacements. The thresholds are
/// operational heuristics, kept configurable rather than hard-coded.
#[derive(Debug, Clone, Copy)]
pub struct DeleteGuard {
    pub max_delete_ratio: f64,
    pub min_replacement_ratio: f64,
    /// Manual override: a human re-running after inspecting a blocked run.
    pub allow_mass_delete: bool,
}

impl Default for DeleteGuard {
    fn default() -> Self {
        Self {
            max_delete_ratio: 0.9,
            min_replacement_ratio: 0.5,
            allow_mass_delete: false,
        }
    }
}

impl DeleteGuard {
    pub fn blocks(&self, existing: usize, deletes: usize, inserts: usize) -> bool {
        if self.allow_mass_delete || deletes == 0 {
            return false;
        }
        let threshold = ((existing as f64) * self.max_delete_ratio).ceil().max(1.0) as usize;
        deletes >= threshold && (inserts as f64) < (deletes as f64) * self.min_replacement_ratio
    }
}

/// The computed mutation set for one reconciliation pass. A pure function
/// of (scraped set, existing snapshot); applying it is separate IO.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub inserts: Vec<ProductRecord>,
    pub updates: Vec<ProductRecord>,
    pub skipped: usize,
    pub deletes: Vec<Uuid>,
    pub deletes_blocked: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SyncSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
    pub deletes_blocked: bool,
}

/// Classify every scraped record as insert, update, or skip, and collect
/// the delete candidates, applying the mass-deletion guard.
///
/// Records without a usable URL are dropped silently on both sides. The
/// insert/update/skip buckets partition the (deduplicated) scraped set; a
/// given row id can appear in at most one bucket, and never in both a
/// write bucket and the delete set.
pub fn compute_plan(
    scraped: &[ProductRecord],
    existing: &[ProductRecord],
    guard: &DeleteGuard,
) -> SyncPlan {
    let mut scraped_by_key: BTreeMap<String, &ProductRecord> = BTreeMap::new();
    for record in scraped {
        let key = normalize_url(&record.product_url);
        if key.is_empty() {
            continue;
        }
        scraped_by_key.insert(key, record);
    }

    let mut existing_by_key: BTreeMap<String, &ProductRecord> = BTreeMap::new();
    for record in existing {
        let key = normalize_url(&record.product_url);
        if key.is_empty() {
            continue;
        }
        existing_by_key.insert(key, record);
    }

    let mut inserts = Vec::new();
    let mut updates = Vec::new();
    let mut skipped = 0usize;

    for (key, record) in &scraped_by_key {
        match existing_by_key.get(key) {
            None => inserts.push((*record).clone()),
            Some(stored) => {
                if record.same_listing(stored) {
                    skipped += 1;
                } else {
                    // Full-row replace keyed by the stored id: URL drift
                    // means the freshly derived id may not match the row.
                    let mut replacement = (*record).clone();
                    replacement.id = stored.id;
                    updates.push(replacement);
                }
            }
        }
    }

    let mut deletes: Vec<Uuid> = existing_by_key
        .iter()
        .filter(|(key, _)| !scraped_by_key.contains_key(*key))
        .map(|(_, record)| record.id)
        .collect();

    let mut deletes_blocked = false;
    if guard.blocks(existing_by_key.len(), deletes.len(), inserts.len()) {
        error!(
            existing = existing_by_key.len(),
            deletes = deletes.len(),
            inserts = inserts.len(),
            "mass deletion blocked: run would remove most of the catalog \
             without comparable replacements; deletions cleared"
        );
        deletes.clear();
        deletes_blocked = true;
    }

    SyncPlan {
        inserts,
        updates,
        skipped,
        deletes,
        deletes_blocked,
    }
}

/// Converge the store with the scraped catalog for one source.
///
/// The snapshot read is the only fatal failure: without a baseline every
/// stored row would classify as removed. Write failures degrade to
/// per-row outcomes and lower counts, never an abort, and a blocked
/// delete set still lets inserts and updates complete.
pub async fn reconcile(
    store: &dyn RecordStore,
    scraped: &[ProductRecord],
    source: &str,
    guard: &DeleteGuard,
) -> Result<SyncSummary> {
    let existing = store
        .list_existing(source)
        .await
        .with_context(|| format!("fetching existing snapshot for source {source}"))?;

    let plan = compute_plan(scraped, &existing, guard);
    info!(
        source,
        inserts = plan.inserts.len(),
        updates = plan.updates.len(),
        skipped = plan.skipped,
        deletes = plan.deletes.len(),
        deletes_blocked = plan.deletes_blocked,
        "sync plan computed"
    );

    let inserted = written_count(&store.insert_ignore_duplicates(&plan.inserts).await);
    let updated = written_count(&store.update(&plan.updates).await);
    let deleted = written_count(&store.delete_by_ids(&plan.deletes).await);

    Ok(SyncSummary {
        inserted,
        updated,
        skipped: plan.skipped,
        deleted,
        deletes_blocked: plan.deletes_blocked,
    })
}

/// Dry run: compute the plan against the live snapshot, write nothing.
pub async fn preview(
    store: &dyn RecordStore,
    scraped: &[ProductRecord],
    source: &str,
    guard: &DeleteGuard,
) -> Result<SyncSummary> {
    let existing = store
        .list_existing(source)
        .await
        .with_context(|| format!("fetching existing snapshot for source {source}"))?;
    let plan = compute_plan(scraped, &existing, guard);
    Ok(SyncSummary {
        inserted: plan.inserts.len(),
        updated: plan.updates.len(),
        skipped: plan.skipped,
        deleted: plan.deletes.len(),
        deletes_blocked: plan.deletes_blocked,
    })
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: String,
    pub base_url: String,
    pub collection_handle: String,
    pub brand: String,
    pub country: String,
    pub currency: String,
    /// Pagination cap for listing discovery.
    pub page_limit: usize,
    /// Optional cap on products scraped per run (test runs).
    pub product_limit: Option<usize>,
    pub guard: DeleteGuard,
    pub dry_run: bool,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let env_or = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        let env_flag = |key: &str| {
            std::env::var(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };
        let env_f64 = |key: &str, default: f64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };
        Self {
            source: env_or("VITRINE_SOURCE", "about-blank"),
            base_url: env_or("VITRINE_BASE_URL", "https://about---blank.com"),
            collection_handle: env_or("VITRINE_COLLECTION", "shop-all"),
            brand: env_or("VITRINE_BRAND", "About Blank"),
            country: env_or("VITRINE_COUNTRY", "US"),
            currency: env_or("VITRINE_CURRENCY", "USD"),
            page_limit: std::env::var("VITRINE_PAGE_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            product_limit: std::env::var("VITRINE_PRODUCT_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0),
            guard: DeleteGuard {
                max_delete_ratio: env_f64("VITRINE_DELETE_GUARD_RATIO", 0.9),
                min_replacement_ratio: env_f64("VITRINE_REPLACEMENT_RATIO", 0.5),
                allow_mass_delete: env_flag("VITRINE_ALLOW_MASS_DELETE"),
            },
            dry_run: false,
        }
    }

    fn extract_context(&self) -> ExtractContext {
        ExtractContext {
            source: self.source.clone(),
            base_url: self.base_url.clone(),
            brand: self.brand.clone(),
            country: self.country.clone(),
            currency: self.currency.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub source: String,
    pub discovered: usize,
    pub scraped: usize,
    pub sync: SyncSummary,
}

/// One full scrape-and-sync pass: discover, fetch + extract + embed
/// concurrently, then reconcile. Collaborators are injected so the whole
/// pipeline runs against test doubles.
pub struct SyncPipeline {
    config: PipelineConfig,
    fetcher: Arc<PageFetcher>,
    store: Arc<dyn RecordStore>,
    embedder: Arc<dyn Embedder>,
}

impl SyncPipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: PageFetcher,
        store: Arc<dyn RecordStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            fetcher: Arc::new(fetcher),
            store,
            embedder,
        }
    }

    /// Every product URL the storefront currently lists, deduplicated by
    /// normalized URL. Returns the complete current set: the engine needs
    /// full coverage to detect removed products, so already-known URLs are
    /// not filtered out here.
    pub async fn discover(&self) -> Result<Vec<String>> {
        let collection_url = format!(
            "{}/collections/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.collection_handle
        );
        let mut seen = BTreeSet::new();
        let mut urls = Vec::new();
        let mut page = 1usize;

        loop {
            let page_url = if page > 1 {
                format!("{collection_url}?page={page}")
            } else {
                collection_url.clone()
            };
            info!(page, url = %page_url, "fetching listing page");
            let html = match self.fetcher.fetch_text(&page_url).await {
                Ok(html) => html,
                Err(err) => {
                    warn!(%err, url = %page_url, "listing page fetch failed");
                    break;
                }
            };

            let links = parse_product_links(&html, &self.config.base_url)?;
            let mut new_on_page = 0usize;
            for link in links {
                if seen.insert(normalize_url(&link)) {
                    urls.push(link);
                    new_on_page += 1;
                }
            }
            info!(page, new_on_page, "listing page parsed");

            if new_on_page == 0 || !has_next_page(&html)? {
                break;
            }
            page += 1;
            if page > self.config.page_limit {
                warn!(limit = self.config.page_limit, "reached page limit, stopping discovery");
                break;
            }
        }

        // JS-only listings and bot blocks leave the HTML empty of product
        // links; the platform products.json endpoint usually still works.
        if urls.is_empty() {
            info!("no product links in listing HTML; trying products.json fallback");
            let base = self.config.base_url.trim_end_matches('/');
            let mut page = 1usize;
            loop {
                let json_url = format!(
                    "{base}/collections/{}/products.json?page={page}",
                    self.config.collection_handle
                );
                let body = match self.fetcher.fetch_text(&json_url).await {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(%err, url = %json_url, "products.json fetch failed");
                        break;
                    }
                };
                let (page_urls, count) = match parse_products_json(&body, &self.config.base_url) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        warn!(%err, "products.json parse failed");
                        break;
                    }
                };
                for url in page_urls {
                    if seen.insert(normalize_url(&url)) {
                        urls.push(url);
                    }
                }
                if count < PRODUCTS_JSON_PAGE || page >= self.config.page_limit {
                    break;
                }
                page += 1;
            }
        }

        info!(discovered = urls.len(), "discovery finished");
        Ok(urls)
    }

    /// Fetch, extract, and embed every discovered product concurrently.
    /// Per-page failures are logged and dropped; concurrency and pacing
    /// are bounded by the fetcher.
    pub async fn scrape(&self, urls: &[String]) -> Vec<ProductRecord> {
        let ctx = Arc::new(self.config.extract_context());
        let mut tasks = JoinSet::new();
        for url in urls {
            let url = url.clone();
            let ctx = Arc::clone(&ctx);
            let fetcher = Arc::clone(&self.fetcher);
            let embedder = Arc::clone(&self.embedder);
            tasks.spawn(async move { scrape_one(&fetcher, embedder.as_ref(), &ctx, &url).await });
        }

        let mut records = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(%err, "scrape task panicked"),
            }
        }
        info!(scraped = records.len(), of = urls.len(), "scraping finished");
        records
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let mut urls = self.discover().await?;
        if let Some(limit) = self.config.product_limit {
            urls.truncate(limit);
        }
        let discovered = urls.len();

        let records = self.scrape(&urls).await;
        let scraped = records.len();

        let sync = if self.config.dry_run {
            info!("dry run: computing plan without writing");
            preview(self.store.as_ref(), &records, &self.config.source, &self.config.guard).await?
        } else {
            reconcile(self.store.as_ref(), &records, &self.config.source, &self.config.guard)
                .await?
        };

        Ok(RunSummary {
            source: self.config.source.clone(),
            discovered,
            scraped,
            sync,
        })
    }
}

async fn scrape_one(
    fetcher: &PageFetcher,
    embedder: &dyn Embedder,
    ctx: &ExtractContext,
    url: &str,
) -> Option<ProductRecord> {
    let html = match fetcher.fetch_text(url).await {
        Ok(html) => html,
        Err(err) => {
            warn!(%err, url, "product page fetch failed");
            return None;
        }
    };

    let mut record = match extract_product(&html, url, ctx) {
        Ok(Some(record)) => record,
        Ok(None) => return None,
        Err(err) => {
            warn!(%err, url, "product extraction failed");
            return None;
        }
    };

    if let Some(image_url) = record.image_url.clone() {
        record.image_embedding = embedder.embed_image(&image_url).await;
    }
    let text = info_text(&record);
    if !text.is_empty() {
        record.info_embedding = embedder.embed_text(&text).await;
    }

    Some(record)
}
