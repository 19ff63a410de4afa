//! Core domain model for the tender harvester: search queries, pages, opaque documents.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "harvest-core";

/// Field carrying the stable record identifier in upstream documents.
pub const RECORD_ID_FIELD: &str = "recordid";

/// Deepest `start` offset the Opendatasoft v1 search API answers reliably.
pub const DEFAULT_OFFSET_CEILING: usize = 10_000;

pub const DEFAULT_DATASET: &str = "boamp";
pub const DEFAULT_DEADLINE_FIELD: &str = "datelimitereponse";
pub const DEFAULT_SORT: &str = "-datelimitereponse";

/// Opaque upstream record. Only [`RECORD_ID_FIELD`] is ever interpreted.
pub type Document = Map<String, Value>;

/// Returns the document identifier when it is a non-empty string.
pub fn record_id(document: &Document) -> Option<&str> {
    document
        .get(RECORD_ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

/// One page request against the search API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub dataset: String,
    pub rows: usize,
    pub start: usize,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl SearchQuery {
    /// The same query shifted to another offset.
    pub fn at_offset(&self, start: usize) -> Self {
        Self {
            start,
            ..self.clone()
        }
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("dataset", self.dataset.clone()),
            ("rows", self.rows.to_string()),
            ("start", self.start.to_string()),
        ];
        if let Some(filter) = &self.filter {
            params.push(("where", filter.clone()));
        }
        if let Some(sort) = &self.sort {
            params.push(("sort", sort.clone()));
        }
        params
    }
}

/// Documents returned for one [`SearchQuery`], plus the upstream match count when reported.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageResult {
    pub documents: Vec<Document>,
    pub total_matching: Option<u64>,
}

/// "Deadline on or after today" predicate in the Opendatasoft filter language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineFilter {
    pub field: String,
    pub today: NaiveDate,
}

impl DeadlineFilter {
    pub fn new(field: impl Into<String>, today: NaiveDate) -> Self {
        Self {
            field: field.into(),
            today,
        }
    }

    pub fn to_where_clause(&self) -> String {
        format!("{} >= date'{}'", self.field, self.today.format("%Y-%m-%d"))
    }
}

/// Unit written to storage, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpsertRecord {
    pub id: String,
    pub raw: Document,
}

impl UpsertRecord {
    /// Builds a record from a document, or `None` when it carries no usable identifier.
    pub fn from_document(document: Document) -> Option<Self> {
        let id = record_id(&document)?.to_string();
        Some(Self { id, raw: document })
    }
}

/// Why a pagination run ended without failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoMoreData,
    ReachedTotal,
    ReachedOffsetCeiling,
    ExhaustedPageBudget,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::NoMoreData => "no_more_data",
            StopReason::ReachedTotal => "reached_total",
            StopReason::ReachedOffsetCeiling => "reached_offset_ceiling",
            StopReason::ExhaustedPageBudget => "exhausted_page_budget",
        }
    }

    /// True when matching documents may remain upstream.
    pub fn may_be_truncated(&self) -> bool {
        matches!(
            self,
            StopReason::ReachedOffsetCeiling | StopReason::ExhaustedPageBudget
        )
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
