//! Harvest run orchestration: bounded pagination over the search API, then one idempotent upsert.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::{
    DeadlineFilter, Document, SearchQuery, StopReason, UpsertRecord, DEFAULT_DATASET,
    DEFAULT_DEADLINE_FIELD, DEFAULT_OFFSET_CEILING, DEFAULT_SORT,
};
use harvest_storage::{
    HttpClientConfig, OdsSearchClient, PostgrestConfig, PostgrestStore, SearchApi, SearchError,
    StoreError, UpsertStore, DEFAULT_SEARCH_ENDPOINT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

pub const DEFAULT_TABLE: &str = "boamp_notices";
pub const DEFAULT_ROWS: usize = 1000;
pub const DEFAULT_MAX_PAGES: usize = 50;

pub const ENV_STORAGE_URL: &str = "SUPABASE_URL";
pub const ENV_STORAGE_KEY: &str = "SUPABASE_SERVICE_ROLE_KEY";

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("search transport failure: {0}")]
    Transport(#[from] SearchError),
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    #[error("building http client: {0:#}")]
    HttpClient(anyhow::Error),
}

/// Runtime settings. Missing YAML keys keep their defaults; an explicit `null`
/// for `offset_ceiling`, `deadline_field` or `sort` turns that behaviour off.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub storage_url: Option<String>,
    pub storage_key: Option<String>,
    pub table: String,
    pub search_endpoint: String,
    pub dataset: String,
    pub rows: usize,
    pub max_pages: usize,
    pub offset_ceiling: Option<usize>,
    pub deadline_field: Option<String>,
    pub sort: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            storage_url: None,
            storage_key: None,
            table: DEFAULT_TABLE.to_string(),
            search_endpoint: DEFAULT_SEARCH_ENDPOINT.to_string(),
            dataset: DEFAULT_DATASET.to_string(),
            rows: DEFAULT_ROWS,
            max_pages: DEFAULT_MAX_PAGES,
            offset_ceiling: Some(DEFAULT_OFFSET_CEILING),
            deadline_field: Some(DEFAULT_DEADLINE_FIELD.to_string()),
            sort: Some(DEFAULT_SORT.to_string()),
            http_timeout_secs: 30,
            user_agent: format!("tender-harvest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HarvestConfig {
    /// Defaults, then the optional YAML file, then process environment.
    pub async fn load(path: Option<&Path>) -> Result<Self, HarvestError> {
        Self::load_with_env(path, |key| std::env::var(key).ok()).await
    }

    pub async fn load_with_env<F>(path: Option<&Path>, lookup: F) -> Result<Self, HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path).await.map_err(|err| {
                    HarvestError::Configuration(format!("reading {}: {err}", path.display()))
                })?;
                Self::from_yaml_str(&text).map_err(|err| match err {
                    HarvestError::Configuration(msg) => {
                        HarvestError::Configuration(format!("{}: {msg}", path.display()))
                    }
                    other => other,
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, HarvestError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|err| HarvestError::Configuration(format!("parsing settings: {err}")))
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_STORAGE_URL) {
            self.storage_url = Some(v);
        }
        if let Some(v) = lookup(ENV_STORAGE_KEY) {
            self.storage_key = Some(v);
        }
        if let Some(v) = lookup("HARVEST_TABLE") {
            self.table = v;
        }
        if let Some(v) = lookup("HARVEST_SEARCH_ENDPOINT") {
            self.search_endpoint = v;
        }
        if let Some(v) = lookup("HARVEST_DATASET") {
            self.dataset = v;
        }
        if let Some(v) = lookup("HARVEST_ROWS") {
            self.rows = parse_setting("HARVEST_ROWS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_MAX_PAGES") {
            self.max_pages = parse_setting("HARVEST_MAX_PAGES", &v)?;
        }
        if let Some(v) = lookup("HARVEST_OFFSET_CEILING") {
            self.offset_ceiling = match v.trim().to_ascii_lowercase().as_str() {
                "" | "none" | "off" => None,
                _ => Some(parse_setting("HARVEST_OFFSET_CEILING", &v)?),
            };
        }
        if let Some(v) = lookup("HARVEST_DEADLINE_FIELD") {
            self.deadline_field = non_empty(v);
        }
        if let Some(v) = lookup("HARVEST_SORT") {
            self.sort = non_empty(v);
        }
        if let Some(v) = lookup("HARVEST_HTTP_TIMEOUT_SECS") {
            self.http_timeout_secs = parse_setting("HARVEST_HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("HARVEST_USER_AGENT") {
            self.user_agent = v;
        }
        Ok(())
    }

    pub fn postgrest_config(&self) -> Result<PostgrestConfig, HarvestError> {
        let base_url = self.storage_url.clone().and_then(non_empty);
        let service_key = self.storage_key.clone().and_then(non_empty);
        match (base_url, service_key) {
            (Some(base_url), Some(service_key)) => Ok(PostgrestConfig {
                base_url,
                service_key,
                table: self.table.clone(),
            }),
            _ => Err(HarvestError::Configuration(format!(
                "missing storage credentials: {ENV_STORAGE_URL} and/or {ENV_STORAGE_KEY}"
            ))),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            dataset: self.dataset.clone(),
            rows: self.rows,
            max_pages: self.max_pages,
            offset_ceiling: self.offset_ceiling,
            deadline_field: self.deadline_field.clone(),
            sort: self.sort.clone(),
        }
    }
}

fn parse_setting<T>(key: &str, raw: &str) -> Result<T, HarvestError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| HarvestError::Configuration(format!("{key}={raw:?}: {err}")))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub today: NaiveDate,
}

impl RunContext {
    pub fn start_now() -> Self {
        Self::for_date(Utc::now().date_naive())
    }

    pub fn for_date(today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            today,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub dataset: String,
    pub rows: usize,
    pub max_pages: usize,
    pub offset_ceiling: Option<usize>,
    pub deadline_field: Option<String>,
    pub sort: Option<String>,
}

impl FetchSettings {
    pub fn first_query(&self, today: NaiveDate) -> SearchQuery {
        SearchQuery {
            dataset: self.dataset.clone(),
            rows: self.rows,
            start: 0,
            filter: self
                .deadline_field
                .as_ref()
                .map(|field| DeadlineFilter::new(field.clone(), today).to_where_clause()),
            sort: self.sort.clone(),
        }
    }
}

/// Termination state for one pagination run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    rows: usize,
    max_pages: usize,
    offset_ceiling: Option<usize>,
    start: usize,
    pages_fetched: usize,
}

impl PageCursor {
    pub fn new(rows: usize, max_pages: usize, offset_ceiling: Option<usize>) -> Self {
        Self {
            rows,
            max_pages,
            offset_ceiling,
            start: 0,
            pages_fetched: 0,
        }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    pub fn check_before_page(&self) -> Option<StopReason> {
        if self.pages_fetched >= self.max_pages {
            return Some(StopReason::ExhaustedPageBudget);
        }
        match self.offset_ceiling {
            Some(ceiling) if self.start >= ceiling => Some(StopReason::ReachedOffsetCeiling),
            _ => None,
        }
    }

    pub fn record_page(&mut self, received: usize, total_matching: Option<u64>) -> Option<StopReason> {
        self.pages_fetched += 1;
        if received == 0 {
            return Some(StopReason::NoMoreData);
        }
        self.start = match self.start.checked_add(self.rows) {
            Some(next) => next,
            None => return Some(StopReason::ReachedOffsetCeiling),
        };
        match total_matching {
            Some(total) if self.start as u64 >= total => Some(StopReason::ReachedTotal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub documents: Vec<Document>,
    pub pages_fetched: usize,
    pub stop_reason: StopReason,
}

pub struct BoundedPaginatingFetcher<A> {
    api: A,
    settings: FetchSettings,
}

impl<A: SearchApi> BoundedPaginatingFetcher<A> {
    pub fn new(api: A, settings: FetchSettings) -> Self {
        Self { api, settings }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    pub async fn fetch(&self, ctx: &RunContext) -> Result<FetchOutcome, HarvestError> {
        let rows = self.settings.rows;
        if rows == 0 {
            return Err(HarvestError::Configuration(
                "page size (rows) must be positive".to_string(),
            ));
        }

        let first_query = self.settings.first_query(ctx.today);
        let mut cursor = PageCursor::new(rows, self.settings.max_pages, self.settings.offset_ceiling);
        let mut documents = Vec::new();

        let stop_reason = loop {
            if let Some(reason) = cursor.check_before_page() {
                break reason;
            }

            let query = first_query.at_offset(cursor.start());
            let span = info_span!("search_page", run_id = %ctx.run_id, start = query.start, rows);
            let page = match self.api.search(&query).instrument(span).await {
                Ok(page) => page,
                Err(err) => {
                    error!(run_id = %ctx.run_id, start = query.start, error = %err, "search page failed; aborting run");
                    return Err(err.into());
                }
            };

            let mut page_documents = page.documents;
            if page_documents.len() > rows {
                warn!(
                    start = query.start,
                    rows,
                    received = page_documents.len(),
                    "upstream returned more documents than requested; truncating page"
                );
                page_documents.truncate(rows);
            }
            let received = page_documents.len();
            documents.extend(page_documents);
            debug!(
                start = query.start,
                received,
                total_matching = ?page.total_matching,
                accumulated = documents.len(),
                "search page fetched"
            );

            if let Some(reason) = cursor.record_page(received, page.total_matching) {
                break reason;
            }
        };

        if stop_reason.may_be_truncated() {
            warn!(
                run_id = %ctx.run_id,
                stop_reason = %stop_reason,
                next_start = cursor.start(),
                documents = documents.len(),
                "pagination stopped early; result may be incomplete"
            );
        } else {
            info!(
                run_id = %ctx.run_id,
                stop_reason = %stop_reason,
                pages = cursor.pages_fetched(),
                documents = documents.len(),
                "pagination complete"
            );
        }

        Ok(FetchOutcome {
            documents,
            pages_fetched: cursor.pages_fetched(),
            stop_reason,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpsertBatch {
    pub records: Vec<UpsertRecord>,
    pub dropped_without_id: usize,
    pub duplicate_ids_collapsed: usize,
}

/// Keeps documents with an identifier. A repeated id keeps its first position
/// and takes the payload of its last occurrence.
pub fn build_upsert_batch(documents: Vec<Document>) -> UpsertBatch {
    let mut batch = UpsertBatch::default();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for document in documents {
        let Some(record) = UpsertRecord::from_document(document) else {
            batch.dropped_without_id += 1;
            continue;
        };
        match positions.get(&record.id) {
            Some(&idx) => {
                batch.records[idx] = record;
                batch.duplicate_ids_collapsed += 1;
            }
            None => {
                positions.insert(record.id.clone(), batch.records.len());
                batch.records.push(record);
            }
        }
    }

    batch
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestReport {
    pub written: usize,
    pub dropped_without_id: usize,
    pub duplicate_ids_collapsed: usize,
}

pub struct IdempotentIngestionSink<S> {
    store: S,
}

impl<S: UpsertStore> IdempotentIngestionSink<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn ingest(&self, documents: Vec<Document>) -> Result<IngestReport, HarvestError> {
        let batch = build_upsert_batch(documents);
        let mut report = IngestReport {
            written: 0,
            dropped_without_id: batch.dropped_without_id,
            duplicate_ids_collapsed: batch.duplicate_ids_collapsed,
        };

        if batch.dropped_without_id > 0 {
            info!(dropped = batch.dropped_without_id, "documents without an identifier skipped");
        }

        if batch.records.is_empty() {
            warn!(table = self.store.table(), "no identifiable documents; skipping upsert");
            return Ok(report);
        }

        if let Err(err) = self.store.upsert(&batch.records).await {
            error!(table = self.store.table(), records = batch.records.len(), error = %err, "bulk upsert failed");
            return Err(err.into());
        }

        report.written = batch.records.len();
        info!(
            table = self.store.table(),
            written = report.written,
            duplicates = report.duplicate_ids_collapsed,
            "bulk upsert complete"
        );
        Ok(report)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub today: NaiveDate,
    pub pages_fetched: usize,
    pub documents_fetched: usize,
    pub stop_reason: StopReason,
    pub ingest: Option<IngestReport>,
}

impl HarvestRunSummary {
    pub fn written(&self) -> usize {
        self.ingest.map(|report| report.written).unwrap_or(0)
    }
}

pub struct HarvestPipeline<A, S> {
    fetcher: BoundedPaginatingFetcher<A>,
    sink: IdempotentIngestionSink<S>,
}

impl<A: SearchApi, S: UpsertStore> HarvestPipeline<A, S> {
    pub fn new(fetcher: BoundedPaginatingFetcher<A>, sink: IdempotentIngestionSink<S>) -> Self {
        Self { fetcher, sink }
    }

    pub fn fetcher(&self) -> &BoundedPaginatingFetcher<A> {
        &self.fetcher
    }

    pub fn sink(&self) -> &IdempotentIngestionSink<S> {
        &self.sink
    }

    pub async fn run_once(&self, ctx: RunContext) -> Result<HarvestRunSummary, HarvestError> {
        let started_at = Utc::now();
        info!(run_id = %ctx.run_id, today = %ctx.today, "harvest run started");

        let outcome = self.fetcher.fetch(&ctx).await?;
        let documents_fetched = outcome.documents.len();
        let ingest = self.sink.ingest(outcome.documents).await?;

        let summary = HarvestRunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            today: ctx.today,
            pages_fetched: outcome.pages_fetched,
            documents_fetched,
            stop_reason: outcome.stop_reason,
            ingest: Some(ingest),
        };
        info!(
            run_id = %summary.run_id,
            documents = summary.documents_fetched,
            written = summary.written(),
            stop_reason = %summary.stop_reason,
            "harvest run finished"
        );
        Ok(summary)
    }
}

pub async fn run_sync_once(config: &HarvestConfig) -> Result<HarvestRunSummary, HarvestError> {
    let postgrest = config.postgrest_config()?;
    let http = config.http_client_config();
    let api = OdsSearchClient::new(config.search_endpoint.clone(), &http)
        .map_err(HarvestError::HttpClient)?;
    let store = PostgrestStore::new(postgrest, &http).map_err(HarvestError::HttpClient)?;

    let pipeline = HarvestPipeline::new(
        BoundedPaginatingFetcher::new(api, config.fetch_settings()),
        IdempotentIngestionSink::new(store),
    );
    pipeline.run_once(RunContext::start_now()).await
}

pub async fn run_fetch_only(config: &HarvestConfig) -> Result<HarvestRunSummary, HarvestError> {
    let api = OdsSearchClient::new(config.search_endpoint.clone(), &config.http_client_config())
        .map_err(HarvestError::HttpClient)?;
    let fetcher = BoundedPaginatingFetcher::new(api, config.fetch_settings());

    let ctx = RunContext::start_now();
    let started_at = Utc::now();
    let outcome = fetcher.fetch(&ctx).await?;
    Ok(HarvestRunSummary {
        run_id: ctx.run_id,
        started_at,
        finished_at: Utc::now(),
        today: ctx.today,
        pages_fetched: outcome.pages_fetched,
        documents_fetched: outcome.documents.len(),
        stop_reason: outcome.stop_reason,
        ingest: None,
    })
}
