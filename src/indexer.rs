//! Turning extracted documents into index records.
//!
//! The [`Indexer`] chunks pages, embeds the chunks with every model the
//! registry currently writes, pools them into one vector per model and
//! upserts the record. Unchanged documents are recognized by content hash
//! and skipped.

use std::{
    path::Path,
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    cache::ResultCache,
    chunking,
    config::IndexingSettings,
    doc_id::DocumentId,
    document::{ChangeEvent, DocumentContent, DocumentInfo, PageContent},
    embedding::{EmbeddingService, mean_pool},
    error::{Error, Result},
    events::{EventBus, IndexingProgress},
    extract::ExtractorRegistry,
    model_registry::{ModelRegistry, ModelState},
    store::{IndexRecord, IndexStore, ModelVector},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexingResult {
    pub total: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub failed: usize,
    /// (path, reason) for every failed document.
    pub failures: Vec<(String, String)>,
}

/// What applying a [`ChangeEvent`] did to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOutcome {
    Indexed,
    Unchanged,
    Removed,
    /// Nothing to do: unknown path or unsupported file type.
    Ignored,
}

/// A validated document waiting for its vectors.
#[derive(Debug, Clone)]
struct Prepared {
    info: DocumentInfo,
    pages: Vec<PageContent>,
    chunks: Vec<String>,
    /// Models an embedding was tried with, successful or not.
    attempted: Vec<String>,
    retain_models: Vec<String>,
    vectors: Vec<ModelVector>,
}

impl Prepared {
    fn record(&self) -> IndexRecord {
        IndexRecord {
            info: self.info.clone(),
            pages: self.pages.clone(),
            vectors: self.vectors.clone(),
            retain_models: self.retain_models.clone(),
        }
    }
}

enum Preparation {
    Unchanged,
    Ready(Box<Prepared>),
}

pub struct Indexer {
    store: Arc<dyn IndexStore>,
    embeddings: Arc<EmbeddingService>,
    registry: Arc<ModelRegistry>,
    cache: Arc<ResultCache>,
    events: Arc<EventBus>,
    extractors: ExtractorRegistry,
    settings: IndexingSettings,
    semantic: bool,
}

impl Indexer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn IndexStore>,
        embeddings: Arc<EmbeddingService>,
        registry: Arc<ModelRegistry>,
        cache: Arc<ResultCache>,
        events: Arc<EventBus>,
        extractors: ExtractorRegistry,
        settings: IndexingSettings,
        semantic: bool,
    ) -> Self {
        Self {
            store,
            embeddings,
            registry,
            cache,
            events,
            extractors,
            settings,
            semantic,
        }
    }

    /// Storage id of the document at `path`.
    pub fn document_id(path: &Path) -> String {
        DocumentId::from_path(path).as_key()
    }

    /// Index one document. Returns `false` when it was already up to date.
    pub fn index_document(&self, content: &DocumentContent) -> Result<bool> {
        let mut batch = match self.prepare(content)? {
            Preparation::Unchanged => return Ok(false),
            Preparation::Ready(prepared) => vec![*prepared],
        };
        self.write(&mut batch)?;
        self.cache.invalidate_all();
        Ok(true)
    }

    /// Index many documents, embedding them in groups of `batch_size`.
    ///
    /// A group that fails as a whole is retried document by document, so
    /// one bad document only costs itself.
    pub fn bulk_index(&self, documents: &[DocumentContent]) -> IndexingResult {
        let mut result = IndexingResult {
            total: documents.len(),
            ..Default::default()
        };
        let mut processed = 0;

        for group in documents.chunks(self.settings.batch_size.max(1)) {
            let mut ready = Vec::new();
            for content in group {
                match self.prepare(content) {
                    Ok(Preparation::Unchanged) => {
                        result.unchanged += 1;
                        processed += 1;
                        self.progress(processed, &result, &content.path);
                    }
                    Ok(Preparation::Ready(prepared)) => ready.push(*prepared),
                    Err(e) => {
                        processed += 1;
                        record_failure(&mut result, &content.path, &e);
                        self.progress(processed, &result, &content.path);
                    }
                }
            }
            if ready.is_empty() {
                continue;
            }

            if let Err(e) = self.write(&mut ready) {
                tracing::warn!(
                    documents = ready.len(),
                    error = %e,
                    "group indexing failed, retrying documents one by one"
                );
                for prepared in ready {
                    let path = prepared.info.path.clone();
                    match self.write(&mut [prepared]) {
                        Ok(()) => result.indexed += 1,
                        Err(e) => record_failure(&mut result, Path::new(&path), &e),
                    }
                    processed += 1;
                    self.progress(processed, &result, Path::new(&path));
                }
            } else {
                for prepared in &ready {
                    result.indexed += 1;
                    processed += 1;
                    self.progress(processed, &result, Path::new(&prepared.info.path));
                }
            }
        }

        if result.indexed > 0 {
            self.cache.invalidate_all();
        }
        tracing::info!(
            total = result.total,
            indexed = result.indexed,
            unchanged = result.unchanged,
            failed = result.failed,
            "bulk indexing finished"
        );
        result
    }

    /// Remove a document by id. Returns whether it was indexed.
    pub fn delete_document(&self, document_id: &str) -> Result<bool> {
        let removed = self.with_retry("delete", || self.store.delete(document_id))?;
        self.registry.forget(document_id)?;
        if removed {
            self.cache.invalidate_all();
            tracing::debug!(document_id, "document removed");
        }
        Ok(removed)
    }

    /// Bring the index in line with one file-system change.
    ///
    /// Events are interpreted against the current state of the file, so
    /// duplicated or reordered events converge on the same index.
    pub fn apply_change(&self, event: &ChangeEvent) -> Result<ChangeOutcome> {
        let path = event.path();
        let exists = path.is_file();
        match event {
            ChangeEvent::Created(_) | ChangeEvent::Modified(_) if !exists => {
                self.remove_path(path)
            }
            ChangeEvent::Removed(_) if !exists => self.remove_path(path),
            _ => {
                let supported = crate::document::FileType::from_path(path)
                    .is_some_and(|t| self.settings.supported_file_types.contains(&t));
                if !supported {
                    return Ok(ChangeOutcome::Ignored);
                }
                let content = self.extractors.extract(path)?;
                Ok(if self.index_document(&content)? {
                    ChangeOutcome::Indexed
                } else {
                    ChangeOutcome::Unchanged
                })
            }
        }
    }

    /// Read and index files, collecting extraction failures in the result.
    pub fn index_paths(&self, paths: &[std::path::PathBuf]) -> IndexingResult {
        let mut contents = Vec::with_capacity(paths.len());
        let mut failures = IndexingResult::default();
        for path in paths {
            match self.extractors.extract(path) {
                Ok(content) => contents.push(content),
                Err(e) => record_failure(&mut failures, path, &e),
            }
        }
        let mut result = self.bulk_index(&contents);
        result.total += failures.failed;
        result.failed += failures.failed;
        result.failures.extend(failures.failures);
        result
    }

    fn remove_path(&self, path: &Path) -> Result<ChangeOutcome> {
        let mut id = Self::document_id(path);
        if self.store.document(&id)?.is_none() {
            let wanted = path.to_string_lossy();
            match self
                .store
                .list_documents()?
                .into_iter()
                .find(|info| info.path == wanted)
            {
                Some(info) => id = info.id,
                None => return Ok(ChangeOutcome::Ignored),
            }
        }
        Ok(if self.delete_document(&id)? {
            ChangeOutcome::Removed
        } else {
            ChangeOutcome::Ignored
        })
    }

    fn prepare(&self, content: &DocumentContent) -> Result<Preparation> {
        let path = content.path.display().to_string();
        if !content.has_text() {
            return Err(Error::DocumentProcessing {
                path,
                reason: "no extractable text".into(),
            });
        }

        let id = Self::document_id(&content.path);
        let hash = content.content_hash();
        let models = if self.semantic {
            self.registry.snapshot().write_models()
        } else {
            Vec::new()
        };

        let existing = self.store.document(&id)?;
        if let Some(existing) = &existing
            && existing.content_hash == hash
        {
            let mut complete = true;
            for model in &models {
                if !self.store.has_vector(&id, model)? {
                    complete = false;
                    break;
                }
            }
            if complete {
                return Ok(Preparation::Unchanged);
            }
        }

        let chunks: Vec<String> = chunking::chunk_pages(
            &content.pages,
            self.settings.chunk_size,
            self.settings.chunk_overlap,
        )
        .into_iter()
        .map(|c| c.text)
        .collect();

        let title = if content.title.trim().is_empty() {
            content
                .path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "untitled".into())
        } else {
            content.title.trim().to_string()
        };
        let canonical = content
            .path
            .canonicalize()
            .unwrap_or_else(|_| content.path.clone());

        let info = DocumentInfo {
            id: id.clone(),
            path: canonical.to_string_lossy().to_string(),
            title,
            file_type: content.file_type,
            page_count: content.page_count() as u32,
            first_page: content
                .pages
                .iter()
                .map(|p| p.page_number)
                .min()
                .unwrap_or(0),
            size: content.size,
            created: content.created,
            modified: content.effective_modified(),
            indexed_at: Utc::now(),
            metadata: content.metadata.clone(),
            content_hash: hash,
            topic_path: existing.and_then(|e| e.topic_path),
        };

        Ok(Preparation::Ready(Box::new(Prepared {
            info,
            pages: content.pages.clone(),
            chunks,
            attempted: Vec::new(),
            retain_models: Vec::new(),
            vectors: Vec::new(),
        })))
    }

    /// Embed and upsert a batch, retrying transient failures.
    ///
    /// A re-encoding job may start or flip while the batch embeds, so the
    /// models are checked again under the registry write guard and the
    /// upsert only happens once every model the state asks for is covered.
    fn write(&self, batch: &mut [Prepared]) -> Result<()> {
        let mut state = self.registry.snapshot();
        let state = loop {
            let wanted = self.models_to_embed(batch, &state);
            if !wanted.is_empty() {
                let current = state.current.clone();
                self.with_retry("embed", || self.embed(batch, &wanted, &current))?;
            }

            let writes = self.registry.lock_writes();
            let fresh = self.registry.snapshot();
            if !self.models_to_embed(batch, &fresh).is_empty() {
                drop(writes);
                tracing::debug!(
                    from = state.version,
                    to = fresh.version,
                    "model state moved during embedding"
                );
                state = fresh;
                continue;
            }

            for prepared in batch.iter_mut() {
                let served = fresh.served_models(&prepared.info.id);
                prepared.retain_models = if self.semantic {
                    // Vectors of a model that stopped serving meanwhile go.
                    prepared.vectors.retain(|v| served.contains(&v.model));
                    prepared.vectors.iter().map(|v| v.model.clone()).collect()
                } else {
                    // Without fresh vectors every model still serving it stays.
                    served
                };
            }
            let records: Vec<IndexRecord> = batch.iter().map(Prepared::record).collect();
            self.with_retry("upsert", || self.store.upsert(&records))?;
            break fresh;
        };

        let migrated: Vec<String> = batch
            .iter()
            .filter(|p| {
                state.legacy.contains_key(&p.info.id)
                    && p.vectors.iter().any(|v| v.model == state.current)
            })
            .map(|p| p.info.id.clone())
            .collect();
        if !migrated.is_empty() {
            self.registry.clear_legacy(&migrated)?;
        }
        Ok(())
    }

    /// Models `batch` still needs vectors for under `state`.
    ///
    /// The current model comes first whenever a document lacks it. Other
    /// write models are wanted until they have been tried once.
    fn models_to_embed(&self, batch: &[Prepared], state: &ModelState) -> Vec<String> {
        if !self.semantic {
            return Vec::new();
        }
        let mut wanted = Vec::new();
        if batch
            .iter()
            .any(|p| !p.vectors.iter().any(|v| v.model == state.current))
        {
            wanted.push(state.current.clone());
        }
        for model in state.write_models().into_iter().skip(1) {
            if batch.iter().any(|p| !p.attempted.contains(&model)) {
                wanted.push(model);
            }
        }
        wanted
    }

    /// Add one pooled vector per model in `models` to every document.
    ///
    /// Only `required` is mandatory; any other failing model is left to
    /// the re-encoding job.
    fn embed(&self, batch: &mut [Prepared], models: &[String], required: &str) -> Result<()> {
        let texts: Vec<String> =
            batch.iter().flat_map(|p| p.chunks.iter().cloned()).collect();

        for model in models {
            let vectors = match self.embeddings.embed(
                model,
                &texts,
                self.settings.batch_size,
            ) {
                Ok(vectors) => vectors,
                Err(e) if model != required => {
                    tracing::warn!(model, error = %e, "skipping pending model");
                    for prepared in batch.iter_mut() {
                        note_attempt(prepared, model);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut offset = 0;
            for prepared in batch.iter_mut() {
                let count = prepared.chunks.len();
                let pooled = mean_pool(&vectors[offset..offset + count]).ok_or_else(
                    || Error::DocumentProcessing {
                        path: prepared.info.path.clone(),
                        reason: "no chunks to embed".into(),
                    },
                )?;
                offset += count;
                prepared.vectors.retain(|v| &v.model != model);
                prepared.vectors.push(ModelVector {
                    model: model.clone(),
                    vector: pooled,
                });
                note_attempt(prepared, model);
            }
        }
        Ok(())
    }

    /// Retry transient failures with exponential backoff.
    fn with_retry<T>(
        &self,
        operation: &str,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let attempts = self.settings.max_retries.max(1);
        let mut backoff = Duration::from_millis(self.settings.retry_backoff_ms);
        let mut attempt = 1;
        loop {
            match f() {
                Err(e) if e.is_transient() && attempt < attempts => {
                    tracing::debug!(
                        operation,
                        attempt,
                        error = %e,
                        "transient failure, retrying"
                    );
                    std::thread::sleep(backoff);
                    backoff *= 2;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn progress(&self, processed: usize, result: &IndexingResult, path: &Path) {
        self.events.indexing.publish(IndexingProgress {
            processed,
            total: result.total,
            failed: result.failed,
            current_file: Some(path.display().to_string()),
        });
    }
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("batch_size", &self.settings.batch_size)
            .field("semantic", &self.semantic)
            .finish_non_exhaustive()
    }
}

fn note_attempt(prepared: &mut Prepared, model: &str) {
    if !prepared.attempted.iter().any(|m| m == model) {
        prepared.attempted.push(model.to_string());
    }
}

fn record_failure(result: &mut IndexingResult, path: &Path, error: &Error) {
    tracing::warn!(path = %path.display(), error = %error, "document failed");
    result.failed += 1;
    result
        .failures
        .push((path.display().to_string(), error.to_string()));
}
