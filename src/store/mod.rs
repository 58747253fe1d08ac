//! The index store capability.
//!
//! [`IndexStore`] is everything the orchestrator needs from persistence:
//! bulk upsert, delete, boolean and fuzzy text queries, vector kNN and the
//! bookkeeping used by re-encoding and topic generation. Calls are
//! synchronous; async callers bound them with [`crate::runtime::bounded`].
//!
//! [`LocalStore`] is the on-disk implementation backed by tantivy (text)
//! and redb (records, pages, vectors).

pub mod local;
pub mod record_db;
pub mod text_index;

use std::collections::{BTreeMap, HashMap, HashSet};

pub use local::LocalStore;

use crate::{
    document::{Document, DocumentInfo, PageContent},
    error::Result,
    model::SearchFilters,
    query::BoolExpr,
};

/// A vector under one embedding model tag.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelVector {
    pub model: String,
    pub vector: Vec<f32>,
}

/// The persisted projection of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub info: DocumentInfo,
    pub pages: Vec<PageContent>,
    /// One vector per model tag written by this upsert.
    pub vectors: Vec<ModelVector>,
    /// Vector tags this upsert must not remove even though it does not
    /// carry them, such as a legacy model still serving the document.
    pub retain_models: Vec<String>,
}

/// A page matched by a text query.
#[derive(Debug, Clone, PartialEq)]
pub struct TextHit {
    pub document_id: String,
    pub page: u32,
    pub score: f32,
    pub text: String,
}

/// A document matched by a vector query.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub document_id: String,
    pub page: u32,
    pub similarity: f32,
    pub text: String,
}

pub trait IndexStore: Send + Sync {
    /// Insert or replace whole records keyed by document id.
    fn upsert(&self, records: &[IndexRecord]) -> Result<()>;

    /// Remove a document with its pages and vectors. Returns whether it existed.
    fn delete(&self, document_id: &str) -> Result<bool>;

    fn document(&self, document_id: &str) -> Result<Option<DocumentInfo>>;

    fn documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, DocumentInfo>>;

    fn list_documents(&self) -> Result<Vec<DocumentInfo>>;

    fn load_document(&self, document_id: &str) -> Result<Option<Document>>;

    fn pages(&self, document_id: &str) -> Result<Vec<PageContent>>;

    fn page_text(&self, document_id: &str, page: u32) -> Result<Option<String>>;

    fn document_count(&self) -> Result<usize>;

    /// Pages matching a boolean expression, best first, with raw scores.
    fn boolean_query(
        &self,
        expr: &BoolExpr,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TextHit>>;

    /// Pages containing a word within `max_edit_distance` of any term.
    fn fuzzy_query(
        &self,
        terms: &[String],
        max_edit_distance: u8,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TextHit>>;

    /// Nearest documents to `vector` among those embedded with `model`.
    fn knn_query(
        &self,
        vector: &[f32],
        k: usize,
        model: &str,
        filters: &SearchFilters,
        restrict_to: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>>;

    /// Ids of documents containing any of `terms`.
    fn documents_containing(&self, terms: &[String]) -> Result<HashSet<String>>;

    /// Indexed words starting with `prefix`, with document frequencies.
    /// An empty prefix lists the whole vocabulary.
    fn vocabulary(&self, prefix: &str, limit: usize) -> Result<Vec<(String, u64)>>;

    /// Write vectors alongside whatever the documents already hold.
    fn put_vectors(&self, entries: &[(String, ModelVector)]) -> Result<()>;

    fn has_vector(&self, document_id: &str, model: &str) -> Result<bool>;

    fn vector(&self, document_id: &str, model: &str) -> Result<Option<Vec<f32>>>;

    fn vectors_for_model(&self, model: &str) -> Result<Vec<(String, Vec<f32>)>>;

    /// Drop every vector under `model` except for documents in `keep`.
    fn remove_model_vectors(
        &self,
        model: &str,
        keep: &HashSet<String>,
    ) -> Result<usize>;

    /// Replace the topic path of every document; absent ids are cleared.
    fn set_topic_paths(&self, assignments: &BTreeMap<String, String>) -> Result<()>;
}
