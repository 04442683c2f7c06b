//! Seam between the lifecycle manager and the search engine doing the work.
//!
//! A [`PhysicalIndex`] is one project's index. It must tolerate concurrent
//! reads; the lifecycle manager funnels every write and lifecycle call
//! through the owning project's lock, so implementations never see two
//! mutations for the same project at once.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    model::{IndexedDocument, ProjectId},
};

/// A single hit inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Index of the first matching token in the document.
    pub token_start: usize,
    pub token_length: usize,
    /// Character offsets of the match in the document text.
    pub offset_start: usize,
    pub offset_end: usize,
    pub text: String,
    pub left_context: String,
    pub right_context: String,
    /// Source document id.
    pub document_id: u64,
    pub document_title: String,
}

/// Results keyed by group (document title, or feature value).
pub type GroupedResults = BTreeMap<String, Vec<SearchResult>>;

/// A search request against one project's index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub user: String,
    pub query: String,
    /// Restrict to a single source document.
    pub document: Option<u64>,
    /// Restrict hits to spans of this layer.
    pub layer: Option<String>,
    /// Group hits by this feature of `layer` instead of by document.
    pub feature: Option<String>,
    pub offset: usize,
    pub count: usize,
}

impl SearchQuery {
    pub const DEFAULT_COUNT: usize = 50;

    pub fn new(user: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            query: query.into(),
            document: None,
            layer: None,
            feature: None,
            offset: 0,
            count: Self::DEFAULT_COUNT,
        }
    }

    pub fn in_document(mut self, document: u64) -> Self {
        self.document = Some(document);
        self
    }

    pub fn on_layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn grouped_by(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn page(mut self, offset: usize, count: usize) -> Self {
        self.offset = offset;
        self.count = count;
        self
    }
}

pub trait PhysicalIndex: Send + Sync {
    /// Whether the index exists (on disk or in memory).
    fn is_created(&self) -> bool;

    fn is_open(&self) -> bool;

    /// Create an empty index and open it. Replaces any existing data.
    fn create(&self) -> Result<()>;

    /// Open an existing index. No-op when already open.
    fn open(&self) -> Result<()>;

    /// Release in-memory resources. No-op when not open.
    fn close(&self) -> Result<()>;

    /// Remove every document, keeping the index itself.
    fn clear(&self) -> Result<()>;

    /// Close and remove the index entirely.
    fn delete(&self) -> Result<()>;

    /// Write a document, replacing a previous version with the same key.
    fn index_document(&self, document: &IndexedDocument, cas: &[u8])
    -> Result<()>;

    fn deindex_document(&self, document: &IndexedDocument) -> Result<()>;

    /// Remove a source document together with every annotation copy made
    /// from it, whether or not the copies are still known elsewhere.
    fn deindex_source(&self, source: u64) -> Result<()>;

    fn execute_query(&self, query: &SearchQuery) -> Result<GroupedResults>;

    fn number_of_query_results(&self, query: &SearchQuery) -> Result<u64>;
}

/// Factory for physical indexes, selected once at startup.
pub trait IndexProvider: Send + Sync {
    /// Identifier persisted with each project's index record.
    fn id(&self) -> &'static str;

    /// Obtain a reference to the project's physical index without
    /// necessarily opening or building it.
    fn acquire(&self, project: ProjectId) -> Result<Arc<dyn PhysicalIndex>>;
}
