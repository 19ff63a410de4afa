//! Search API + keyed upsert store adapters for the tender harvester.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use harvest_core::{Document, PageResult, SearchQuery, UpsertRecord};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "harvest-storage";

pub const DEFAULT_SEARCH_ENDPOINT: &str =
    "https://boamp-datadila.opendatasoft.com/api/records/1.0/search/";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding search response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upsert request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upsert into {table} rejected with http status {status}: {body}")]
    HttpStatus {
        status: u16,
        table: String,
        body: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search(&self, query: &SearchQuery) -> Result<PageResult, SearchError>;
}

#[async_trait]
pub trait UpsertStore: Send + Sync {
    fn table(&self) -> &str;

    async fn upsert(&self, records: &[UpsertRecord]) -> Result<(), StoreError>;
}

#[derive(Debug, Deserialize)]
struct OdsSearchResponse {
    // `"records": null` reads as an empty page.
    #[serde(default)]
    records: Option<Vec<Document>>,
    #[serde(default)]
    nhits: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct OdsSearchClient {
    client: reqwest::Client,
    endpoint: String,
}

impl OdsSearchClient {
    pub fn new(endpoint: impl Into<String>, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(config)?,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SearchApi for OdsSearchClient {
    async fn search(&self, query: &SearchQuery) -> Result<PageResult, SearchError> {
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&query.to_params())
            .send()
            .await?;

        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(SearchError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }

        let body = resp.bytes().await?;
        let parsed: OdsSearchResponse =
            serde_json::from_slice(&body).map_err(|source| SearchError::Decode {
                url: url.clone(),
                source,
            })?;

        // A non-integer nhits is treated the same as a missing one.
        let total_matching = parsed.nhits.as_ref().and_then(JsonValue::as_u64);
        let documents = parsed.records.unwrap_or_default();
        debug!(%url, records = documents.len(), ?total_matching, "search page decoded");

        Ok(PageResult {
            documents,
            total_matching,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PostgrestConfig {
    pub base_url: String,
    pub service_key: String,
    pub table: String,
}

#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    config: PostgrestConfig,
}

impl PostgrestStore {
    pub fn new(config: PostgrestConfig, http: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_http_client(http)?,
            config,
        })
    }

    pub fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.table
        )
    }
}

#[async_trait]
impl UpsertStore for PostgrestStore {
    fn table(&self) -> &str {
        &self.config.table
    }

    async fn upsert(&self, records: &[UpsertRecord]) -> Result<(), StoreError> {
        let resp = self
            .client
            .post(self.table_url())
            .query(&[("on_conflict", "id")])
            .header("apikey", &self.config.service_key)
            .bearer_auth(&self.config.service_key)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(records)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            debug!(table = %self.config.table, records = records.len(), "upsert accepted");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            table: self.config.table.clone(),
            body,
        })
    }
}

/// Keyed store held in memory, for tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    table: String,
    rows: Mutex<BTreeMap<String, Document>>,
    upsert_calls: Mutex<usize>,
    failure: Option<String>,
}

impl InMemoryStore {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ..Default::default()
        }
    }

    pub fn failing(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            failure: Some(message.into()),
            ..Default::default()
        }
    }

    pub async fn rows(&self) -> BTreeMap<String, Document> {
        self.rows.lock().await.clone()
    }

    pub async fn upsert_calls(&self) -> usize {
        *self.upsert_calls.lock().await
    }
}

#[async_trait]
impl UpsertStore for InMemoryStore {
    fn table(&self) -> &str {
        &self.table
    }

    async fn upsert(&self, records: &[UpsertRecord]) -> Result<(), StoreError> {
        *self.upsert_calls.lock().await += 1;
        if let Some(message) = &self.failure {
            return Err(StoreError::Unavailable(message.clone()));
        }

        let mut rows = self.rows.lock().await;
        for record in records {
            rows.insert(record.id.clone(), record.raw.clone());
        }
        Ok(())
    }
}
