//! Shared fixtures for unit tests.

use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::{
    cache::ResultCache,
    config::IndexingSettings,
    document::{DocumentInfo, FileType, PageContent},
    embedding::{EmbeddingService, hashed::HashedFactory, mean_pool},
    events::EventBus,
    extract::ExtractorRegistry,
    indexer::Indexer,
    model_registry::ModelRegistry,
    store::{IndexRecord, IndexStore, LocalStore, ModelVector},
};

pub fn hashed_service() -> Arc<EmbeddingService> {
    Arc::new(EmbeddingService::new(Arc::new(HashedFactory { dimension: 256 })))
}

/// An indexer over `store` with the hashed embedder and fast retries.
pub fn hashed_indexer(
    store: Arc<dyn IndexStore>,
    registry: Arc<ModelRegistry>,
) -> Indexer {
    Indexer::new(
        store,
        hashed_service(),
        registry,
        Arc::new(ResultCache::new(8, Duration::from_secs(60))),
        Arc::new(EventBus::default()),
        ExtractorRegistry::new(),
        IndexingSettings {
            retry_backoff_ms: 1,
            ..IndexingSettings::default()
        },
        true,
    )
}

/// A single-page text record without vectors.
pub fn doc(id: &str, title: &str, text: &str) -> IndexRecord {
    let now = Utc::now();
    IndexRecord {
        info: DocumentInfo {
            id: id.to_string(),
            path: format!("/corpus/{id}.txt"),
            title: title.to_string(),
            file_type: FileType::Txt,
            page_count: 1,
            first_page: 0,
            size: text.len() as u64,
            created: now,
            modified: now,
            indexed_at: now,
            metadata: Default::default(),
            content_hash: blake3::hash(text.as_bytes()).to_hex().to_string(),
            topic_path: None,
        },
        pages: vec![PageContent::new(0, text)],
        vectors: Vec::new(),
        retain_models: Vec::new(),
    }
}

/// A [`LocalStore`] in a temporary directory.
pub struct TestCorpus {
    _dir: tempfile::TempDir,
    store: Arc<LocalStore>,
}

impl TestCorpus {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalStore::open(&dir.path().join("store")).unwrap());
        Self { _dir: dir, store }
    }

    pub fn with(records: &[IndexRecord]) -> Self {
        let corpus = Self::new();
        corpus.store.upsert(records).unwrap();
        corpus
    }

    /// Records embedded page by page with `model`.
    pub fn with_vectors(
        records: &[IndexRecord],
        embeddings: &EmbeddingService,
        model: &str,
    ) -> Self {
        let embedded: Vec<IndexRecord> = records
            .iter()
            .cloned()
            .map(|mut record| {
                let texts: Vec<String> =
                    record.pages.iter().map(|p| p.text.clone()).collect();
                let vectors = embeddings.embed(model, &texts, 16).unwrap();
                record.vectors = vec![ModelVector {
                    model: model.to_string(),
                    vector: mean_pool(&vectors).unwrap(),
                }];
                record
            })
            .collect();
        Self::with(&embedded)
    }

    pub fn store(&self) -> Arc<dyn IndexStore> {
        self.store.clone()
    }
}
