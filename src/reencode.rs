//! Migrating stored vectors to a new embedding model.
//!
//! A job marks the new model as pending, embeds every document with it
//! alongside the old vectors, and flips the registry pointer at the end.
//! Queries keep using the old model until the flip. Documents that could
//! not be migrated stay on the old model as legacy documents.

use std::{
    collections::{BTreeSet, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
};

use crate::{
    cache::ResultCache,
    chunking,
    config::IndexingSettings,
    embedding::{EmbeddingService, mean_pool},
    error::{Error, Result},
    events::EventBus,
    model_registry::ModelRegistry,
    store::{IndexStore, ModelVector},
};

/// Live progress of a re-encoding job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReEncodingJob {
    pub old_model: String,
    pub new_model: String,
    pub total: usize,
    pub processed: usize,
    pub failed: usize,
    pub completed: bool,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub estimated_remaining: Option<Duration>,
}

impl ReEncodingJob {
    fn new(old_model: &str, new_model: &str, total: usize) -> Self {
        Self {
            old_model: old_model.to_string(),
            new_model: new_model.to_string(),
            total,
            processed: 0,
            failed: 0,
            completed: false,
            cancelled: false,
            started_at: Utc::now(),
            estimated_remaining: None,
        }
    }

    /// Linear extrapolation from the time spent so far.
    fn estimate(&mut self, elapsed: Duration) {
        self.estimated_remaining = if self.processed == 0 {
            None
        } else {
            let remaining = self.total.saturating_sub(self.processed) as u32;
            Some(elapsed / self.processed as u32 * remaining)
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReEncodingResult {
    pub old_model: String,
    pub new_model: String,
    pub total: usize,
    pub migrated: usize,
    /// Documents that already held a vector for the new model.
    pub skipped: usize,
    pub failed_documents: Vec<String>,
    pub cancelled: bool,
    /// Whether the current model pointer moved to the new model.
    pub flipped: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LegacyRetryResult {
    pub attempted: usize,
    pub migrated: Vec<String>,
    pub still_legacy: Vec<String>,
}

/// A pooled vector with the content it was computed from.
struct Encoded {
    document_id: String,
    content_hash: String,
    vector: ModelVector,
}

pub struct ReEncoder {
    store: Arc<dyn IndexStore>,
    embeddings: Arc<EmbeddingService>,
    registry: Arc<ModelRegistry>,
    cache: Arc<ResultCache>,
    events: Arc<EventBus>,
    settings: IndexingSettings,
}

impl ReEncoder {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embeddings: Arc<EmbeddingService>,
        registry: Arc<ModelRegistry>,
        cache: Arc<ResultCache>,
        events: Arc<EventBus>,
        settings: IndexingSettings,
    ) -> Self {
        Self {
            store,
            embeddings,
            registry,
            cache,
            events,
            settings,
        }
    }

    /// Register `new_model` as pending and make sure it can embed.
    pub fn begin(&self, new_model: &str) -> Result<ReEncodingJob> {
        let state = self.registry.begin(new_model)?;
        if !self.embeddings.is_available(new_model) {
            self.registry.abort(new_model)?;
            return Err(Error::ServiceUnavailable(format!(
                "embedder {new_model} is unavailable"
            )));
        }
        let total = match self.store.document_count() {
            Ok(total) => total,
            Err(e) => {
                self.registry.abort(new_model)?;
                return Err(e);
            }
        };
        tracing::info!(
            old_model = %state.current,
            new_model,
            total,
            "re-encoding started"
        );
        Ok(ReEncodingJob::new(&state.current, new_model, total))
    }

    /// Run a job to completion on the current thread.
    pub fn re_encode(&self, new_model: &str) -> Result<ReEncodingResult> {
        let job = self.begin(new_model)?;
        let (progress, _) = watch::channel(job.clone());
        let (_cancel, cancelled) = watch::channel(false);
        self.run(job, &progress, &cancelled)
    }

    /// Run a job in the background.
    pub fn spawn(self: &Arc<Self>, job: ReEncodingJob) -> ReEncodingHandle {
        let (progress, progress_rx) = watch::channel(job.clone());
        let (cancel, cancel_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let task =
            tokio::task::spawn_blocking(move || this.run(job, &progress, &cancel_rx));
        ReEncodingHandle {
            progress: progress_rx,
            cancel,
            task,
        }
    }

    /// Migrate every document of a begun job, then flip the pointer.
    ///
    /// Cancellation is checked between batches. A cancelled or failed job
    /// clears the pending mark and keeps the vectors already written.
    pub fn run(
        &self,
        job: ReEncodingJob,
        progress: &watch::Sender<ReEncodingJob>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReEncodingResult> {
        let new_model = job.new_model.clone();
        match self.migrate(job, progress, cancel) {
            Ok(result) => Ok(result),
            Err(e) => {
                tracing::warn!(new_model, error = %e, "re-encoding aborted");
                self.registry.abort(&new_model)?;
                Err(e)
            }
        }
    }

    fn migrate(
        &self,
        mut job: ReEncodingJob,
        progress: &watch::Sender<ReEncodingJob>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<ReEncodingResult> {
        let started = Instant::now();
        let ids: Vec<String> = self
            .store
            .list_documents()?
            .into_iter()
            .map(|info| info.id)
            .collect();
        job.total = ids.len();

        let mut result = ReEncodingResult {
            old_model: job.old_model.clone(),
            new_model: job.new_model.clone(),
            total: ids.len(),
            migrated: 0,
            skipped: 0,
            failed_documents: Vec::new(),
            cancelled: false,
            flipped: false,
            elapsed: Duration::ZERO,
        };

        for batch in ids.chunks(self.settings.batch_size.max(1)) {
            if *cancel.borrow() {
                self.registry.abort(&job.new_model)?;
                job.cancelled = true;
                self.publish(progress, &job);
                result.cancelled = true;
                result.elapsed = started.elapsed();
                tracing::info!(
                    new_model = %job.new_model,
                    processed = job.processed,
                    "re-encoding cancelled"
                );
                return Ok(result);
            }

            let mut pending = Vec::new();
            for id in batch {
                if self.store.has_vector(id, &job.new_model)? {
                    result.skipped += 1;
                } else {
                    pending.push(id.clone());
                }
            }

            let (migrated, failed) = self.encode_batch(&pending, &job.new_model)?;
            result.migrated += migrated;
            result.failed_documents.extend(failed);

            job.processed += batch.len();
            job.failed = result.failed_documents.len();
            job.estimate(started.elapsed());
            self.publish(progress, &job);
        }

        // Documents rewritten since their batch ran may lack the new vector.
        let mut failed: BTreeSet<String> = result.failed_documents.iter().cloned().collect();
        let stragglers = self.missing_vectors(&job.new_model, &failed)?;
        if !stragglers.is_empty() {
            tracing::debug!(
                documents = stragglers.len(),
                "re-encoding documents written during the job"
            );
            let (migrated, still_failed) = self.encode_batch(&stragglers, &job.new_model)?;
            result.migrated += migrated;
            failed.extend(still_failed);
        }

        let writes = self.registry.lock_writes();
        // Anything still without a vector stays on its old model.
        let unserved = self.missing_vectors(&job.new_model, &failed)?;
        failed.extend(unserved);
        result.failed_documents = failed.iter().cloned().collect();
        let previous = self.registry.snapshot();
        let state = self.registry.complete(&writes, &job.new_model, &failed)?;
        drop(writes);
        result.flipped = true;

        // Vectors of every model that no longer serves a document go.
        let mut superseded: BTreeSet<String> =
            previous.legacy.values().cloned().collect();
        superseded.insert(previous.current.clone());
        superseded.remove(&state.current);
        for model in superseded {
            let keep: HashSet<String> = state
                .legacy
                .iter()
                .filter(|(_, served)| **served == model)
                .map(|(doc, _)| doc.clone())
                .collect();
            let removed = self.store.remove_model_vectors(&model, &keep)?;
            tracing::debug!(model, removed, "superseded vectors removed");
        }
        self.cache.invalidate_all();

        job.completed = true;
        job.estimated_remaining = Some(Duration::ZERO);
        self.publish(progress, &job);

        result.elapsed = started.elapsed();
        tracing::info!(
            old_model = %result.old_model,
            new_model = %result.new_model,
            migrated = result.migrated,
            skipped = result.skipped,
            failed = result.failed_documents.len(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "re-encoding completed"
        );
        Ok(result)
    }

    /// Embed a batch together; on failure, each document alone, twice.
    ///
    /// Returns the number migrated and the ids that failed. Store errors
    /// abort the job.
    fn encode_batch(&self, ids: &[String], model: &str) -> Result<(usize, Vec<String>)> {
        if ids.is_empty() {
            return Ok((0, Vec::new()));
        }
        match self.embed_documents(ids, model) {
            Ok(encoded) => {
                let count = encoded.len();
                self.store_vectors(encoded)?;
                Ok((count, Vec::new()))
            }
            Err(e) => {
                tracing::warn!(
                    model,
                    documents = ids.len(),
                    error = %e,
                    "batch re-encoding failed, retrying documents one by one"
                );
                let mut migrated = 0;
                let mut failed = Vec::new();
                for id in ids {
                    let single = std::slice::from_ref(id);
                    let vectors = self
                        .embed_documents(single, model)
                        .or_else(|_| self.embed_documents(single, model));
                    match vectors {
                        Ok(encoded) => {
                            migrated += encoded.len();
                            self.store_vectors(encoded)?;
                        }
                        Err(e) => {
                            let e = Error::ReEncoding {
                                document_id: id.clone(),
                                reason: e.to_string(),
                            };
                            tracing::warn!(error = %e, "document left on the old model");
                            failed.push(id.clone());
                        }
                    }
                }
                Ok((migrated, failed))
            }
        }
    }

    /// Pooled vectors of `ids` under `model`. Vanished documents are left out.
    fn embed_documents(&self, ids: &[String], model: &str) -> Result<Vec<Encoded>> {
        let mut owners = Vec::new();
        let mut texts = Vec::new();
        for id in ids {
            let Some(info) = self.store.document(id)? else {
                continue;
            };
            let pages = self.store.pages(id)?;
            if pages.is_empty() {
                continue;
            }
            let chunks = chunking::chunk_pages(
                &pages,
                self.settings.chunk_size,
                self.settings.chunk_overlap,
            );
            if chunks.is_empty() {
                continue;
            }
            owners.push((id.clone(), info.content_hash, chunks.len()));
            texts.extend(chunks.into_iter().map(|c| c.text));
        }

        let vectors = self.embeddings.embed(model, &texts, self.settings.batch_size)?;
        let mut offset = 0;
        let mut out = Vec::with_capacity(owners.len());
        for (id, content_hash, count) in owners {
            let pooled = mean_pool(&vectors[offset..offset + count]).ok_or_else(|| {
                Error::ReEncoding {
                    document_id: id.clone(),
                    reason: "no vectors produced".into(),
                }
            })?;
            offset += count;
            out.push(Encoded {
                document_id: id,
                content_hash,
                vector: ModelVector {
                    model: model.to_string(),
                    vector: pooled,
                },
            });
        }
        Ok(out)
    }

    /// Write vectors whose document is unchanged since it was read.
    ///
    /// A document rewritten in between already carries vectors for every
    /// model the registry wanted at that point, so its stale one is dropped.
    fn store_vectors(&self, encoded: Vec<Encoded>) -> Result<usize> {
        let _writes = self.registry.lock_writes();
        let mut fresh = Vec::with_capacity(encoded.len());
        for entry in encoded {
            let unchanged = self
                .store
                .document(&entry.document_id)?
                .is_some_and(|info| info.content_hash == entry.content_hash);
            if unchanged {
                fresh.push((entry.document_id, entry.vector));
            } else {
                tracing::debug!(
                    document_id = %entry.document_id,
                    "document changed while embedding, vector dropped"
                );
            }
        }
        self.store.put_vectors(&fresh)?;
        Ok(fresh.len())
    }

    /// Documents without a vector for `model`, leaving out `except`.
    fn missing_vectors(&self, model: &str, except: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for info in self.store.list_documents()? {
            if !except.contains(&info.id) && !self.store.has_vector(&info.id, model)? {
                missing.push(info.id);
            }
        }
        Ok(missing)
    }

    /// Re-embed legacy documents with the current model.
    pub fn retry_legacy(&self) -> Result<LegacyRetryResult> {
        let state = self.registry.snapshot();
        if let Some(pending) = &state.pending {
            return Err(Error::ReEncodingInProgress {
                pending: pending.clone(),
            });
        }

        let mut result = LegacyRetryResult {
            attempted: state.legacy.len(),
            ..Default::default()
        };
        let mut cleared = Vec::new();
        for id in state.legacy.keys() {
            match self.embed_documents(std::slice::from_ref(id), &state.current) {
                Ok(encoded) if encoded.is_empty() => cleared.push(id.clone()),
                Ok(encoded) => {
                    if self.store_vectors(encoded)? > 0 {
                        result.migrated.push(id.clone());
                        cleared.push(id.clone());
                    } else {
                        result.still_legacy.push(id.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(document_id = %id, error = %e, "legacy retry failed");
                    result.still_legacy.push(id.clone());
                }
            }
        }
        if cleared.is_empty() {
            return Ok(result);
        }

        let updated = self.registry.clear_legacy(&cleared)?;
        let old_models: BTreeSet<&String> = state.legacy.values().collect();
        for model in old_models {
            let keep: HashSet<String> = updated
                .legacy
                .iter()
                .filter(|(_, served)| *served == model)
                .map(|(doc, _)| doc.clone())
                .collect();
            self.store.remove_model_vectors(model, &keep)?;
        }
        self.cache.invalidate_all();
        tracing::info!(
            migrated = result.migrated.len(),
            still_legacy = result.still_legacy.len(),
            "legacy documents retried"
        );
        Ok(result)
    }

    fn publish(&self, progress: &watch::Sender<ReEncodingJob>, job: &ReEncodingJob) {
        progress.send_replace(job.clone());
        self.events.re_encoding.publish(job.clone());
    }
}

impl std::fmt::Debug for ReEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReEncoder")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// A running re-encoding job.
pub struct ReEncodingHandle {
    progress: watch::Receiver<ReEncodingJob>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<ReEncodingResult>>,
}

impl ReEncodingHandle {
    pub fn progress(&self) -> watch::Receiver<ReEncodingJob> {
        self.progress.clone()
    }

    /// The latest published progress.
    pub fn job(&self) -> ReEncodingJob {
        self.progress.borrow().clone()
    }

    /// Ask the job to stop before its next batch.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn wait(self) -> Result<ReEncodingResult> {
        self.task
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("re-encoding task failed: {e}")))?
    }
}

impl std::fmt::Debug for ReEncodingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReEncodingHandle")
            .field("job", &*self.progress.borrow())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Barrier,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::{
        document::DocumentContent,
        embedding::{DeviceKind, Embedder, hashed::HashedEmbedder},
        extract::ExtractorRegistry,
        indexer::Indexer,
        testing::{TestCorpus, doc, hashed_service},
    };

    struct Fixture {
        corpus: TestCorpus,
        registry: Arc<ModelRegistry>,
        events: Arc<EventBus>,
        encoder: Arc<ReEncoder>,
    }

    fn fixture_with(embeddings: Arc<EmbeddingService>, batch_size: usize) -> Fixture {
        let records = vec![
            doc("a", "Trees", "binary search trees"),
            doc("b", "Graphs", "graph traversal algorithms"),
            doc("c", "Poison", "this page cannot be embedded"),
        ];
        let corpus = TestCorpus::with_vectors(&records, &hashed_service(), "m1");
        let registry = Arc::new(ModelRegistry::new("m1"));
        let events = Arc::new(EventBus::default());
        let encoder = Arc::new(ReEncoder::new(
            corpus.store(),
            embeddings,
            Arc::clone(&registry),
            Arc::new(ResultCache::new(8, Duration::from_secs(60))),
            Arc::clone(&events),
            IndexingSettings {
                batch_size,
                ..IndexingSettings::default()
            },
        ));
        Fixture {
            corpus,
            registry,
            events,
            encoder,
        }
    }

    /// Hashed embeddings that refuse any text containing "poison".
    struct Picky(HashedEmbedder);

    impl Embedder for Picky {
        fn model_id(&self) -> &str {
            self.0.model_id()
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.to_lowercase().contains("poison")) {
                return Err(Error::ServiceUnavailable("cannot embed".into()));
            }
            self.0.embed(texts)
        }
    }

    fn picky_service() -> Arc<EmbeddingService> {
        Arc::new(EmbeddingService::new(Arc::new(
            |model: &str| -> Result<Arc<dyn Embedder>> {
                Ok(Arc::new(Picky(HashedEmbedder::new(model, 64))))
            },
        )))
    }

    /// Hashed embeddings whose next `m1` call stops at a checkpoint.
    struct Checkpoint {
        entered: Barrier,
        release: Barrier,
        armed: AtomicBool,
    }

    impl Checkpoint {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                entered: Barrier::new(2),
                release: Barrier::new(2),
                armed: AtomicBool::new(false),
            })
        }
    }

    struct Held {
        inner: HashedEmbedder,
        checkpoint: Option<Arc<Checkpoint>>,
    }

    impl Embedder for Held {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if let Some(checkpoint) = &self.checkpoint
                && checkpoint.armed.swap(false, Ordering::SeqCst)
            {
                checkpoint.entered.wait();
                checkpoint.release.wait();
            }
            self.inner.embed(texts)
        }
    }

    struct Race {
        f: Fixture,
        indexer: Indexer,
        checkpoint: Arc<Checkpoint>,
    }

    fn race() -> Race {
        let checkpoint = Checkpoint::new();
        let shared = Arc::clone(&checkpoint);
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(
            move |model: &str| -> Result<Arc<dyn Embedder>> {
                Ok(Arc::new(Held {
                    inner: HashedEmbedder::new(model, 64),
                    checkpoint: (model == "m1").then(|| Arc::clone(&shared)),
                }))
            },
        )));
        let f = fixture_with(Arc::clone(&embeddings), 2);
        let indexer = Indexer::new(
            f.corpus.store(),
            embeddings,
            Arc::clone(&f.registry),
            Arc::new(ResultCache::new(8, Duration::from_secs(60))),
            Arc::clone(&f.events),
            ExtractorRegistry::new(),
            IndexingSettings {
                retry_backoff_ms: 1,
                ..IndexingSettings::default()
            },
            true,
        );
        Race {
            f,
            indexer,
            checkpoint,
        }
    }

    fn draft(text: &str) -> DocumentContent {
        DocumentContent::from_text("/nonexistent/plan.txt", "Plan", text)
    }

    #[test]
    fn rewrite_racing_a_flip_gets_the_new_model() {
        let r = race();
        r.indexer.index_document(&draft("first draft of the plan")).unwrap();
        let rewrite = draft("second draft of the plan");
        let id = Indexer::document_id(&rewrite.path);

        r.checkpoint.armed.store(true, Ordering::SeqCst);
        std::thread::scope(|scope| {
            let writer = scope.spawn(|| r.indexer.index_document(&rewrite));
            r.checkpoint.entered.wait();
            let result = r.f.encoder.re_encode("m2").unwrap();
            assert!(result.flipped);
            r.checkpoint.release.wait();
            assert!(writer.join().unwrap().unwrap());
        });

        let state = r.f.registry.snapshot();
        assert_eq!(state.current, "m2");
        assert!(state.legacy.is_empty());
        let store = r.f.corpus.store();
        assert!(store.has_vector(&id, "m2").unwrap());
        assert!(!store.has_vector(&id, "m1").unwrap());
        assert_eq!(
            store.page_text(&id, 0).unwrap().unwrap(),
            "second draft of the plan"
        );
    }

    #[test]
    fn rewrite_during_a_job_is_dual_written() {
        let r = race();
        r.indexer.index_document(&draft("first draft of the plan")).unwrap();
        let rewrite = draft("second draft of the plan");
        let id = Indexer::document_id(&rewrite.path);

        r.checkpoint.armed.store(true, Ordering::SeqCst);
        let job = std::thread::scope(|scope| {
            let writer = scope.spawn(|| r.indexer.index_document(&rewrite));
            r.checkpoint.entered.wait();
            let job = r.f.encoder.begin("m2").unwrap();
            r.checkpoint.release.wait();
            assert!(writer.join().unwrap().unwrap());
            job
        });

        let store = r.f.corpus.store();
        assert!(store.has_vector(&id, "m1").unwrap());
        assert!(store.has_vector(&id, "m2").unwrap());

        let (progress, _) = watch::channel(job.clone());
        let (_cancel, cancelled) = watch::channel(false);
        let result = r.f.encoder.run(job, &progress, &cancelled).unwrap();
        assert!(result.flipped);
        assert_eq!(result.skipped, 1);
        assert!(store.has_vector(&id, "m2").unwrap());
    }

    #[test]
    fn flips_and_removes_old_vectors() {
        let f = fixture_with(hashed_service(), 2);
        let mut progress = f.events.re_encoding.subscribe();
        let result = f.encoder.re_encode("m2").unwrap();

        assert!(result.flipped);
        assert_eq!(result.migrated, 3);
        assert!(result.failed_documents.is_empty());

        let state = f.registry.snapshot();
        assert_eq!(state.current, "m2");
        assert_eq!(state.pending, None);

        let store = f.corpus.store();
        for id in ["a", "b", "c"] {
            assert!(store.has_vector(id, "m2").unwrap());
            assert!(!store.has_vector(id, "m1").unwrap());
        }

        let mut last = None;
        while let Some(job) = progress.try_recv() {
            last = Some(job);
        }
        let last = last.unwrap();
        assert!(last.completed);
        assert_eq!(last.processed, 3);
    }

    #[test]
    fn failures_become_legacy() {
        let f = fixture_with(picky_service(), 3);
        let result = f.encoder.re_encode("m2").unwrap();

        assert_eq!(result.migrated, 2);
        assert_eq!(result.failed_documents, vec!["c".to_string()]);

        let state = f.registry.snapshot();
        assert_eq!(state.current, "m2");
        assert_eq!(state.legacy.get("c").map(String::as_str), Some("m1"));

        let store = f.corpus.store();
        assert!(store.has_vector("c", "m1").unwrap());
        assert!(!store.has_vector("a", "m1").unwrap());
    }

    #[test]
    fn legacy_retry_migrates_documents() {
        let f = fixture_with(picky_service(), 3);
        f.encoder.re_encode("m2").unwrap();

        let store = f.corpus.store();
        let mut record = doc("c", "Poison", "now perfectly fine text");
        record.retain_models = f.registry.snapshot().served_models("c");
        store.upsert(&[record]).unwrap();

        let result = f.encoder.retry_legacy().unwrap();
        assert_eq!(result.migrated, vec!["c".to_string()]);
        assert!(f.registry.snapshot().legacy.is_empty());
        assert!(store.has_vector("c", "m2").unwrap());
        assert!(!store.has_vector("c", "m1").unwrap());
    }

    #[test]
    fn second_job_is_rejected() {
        let f = fixture_with(hashed_service(), 2);
        f.encoder.begin("m2").unwrap();
        assert!(matches!(
            f.encoder.begin("m3"),
            Err(Error::ReEncodingInProgress { .. })
        ));
    }

    #[test]
    fn unavailable_model_aborts_before_writing() {
        let down = Arc::new(EmbeddingService::new(Arc::new(
            |_: &str| -> Result<Arc<dyn Embedder>> {
                Err(Error::ServiceUnavailable("no weights".into()))
            },
        )));
        let f = fixture_with(down, 2);
        assert!(matches!(
            f.encoder.re_encode("m2"),
            Err(Error::ServiceUnavailable(_))
        ));
        let state = f.registry.snapshot();
        assert_eq!(state.current, "m1");
        assert_eq!(state.pending, None);
    }

    #[test]
    fn cancellation_keeps_the_pointer() {
        let f = fixture_with(hashed_service(), 1);
        let job = f.encoder.begin("m2").unwrap();
        let (progress, _) = watch::channel(job.clone());
        let (cancel, cancelled) = watch::channel(true);

        let result = f.encoder.run(job, &progress, &cancelled).unwrap();
        drop(cancel);
        assert!(result.cancelled);
        assert!(!result.flipped);

        let state = f.registry.snapshot();
        assert_eq!(state.current, "m1");
        assert_eq!(state.pending, None);

        // a later run can start again
        let rerun = f.encoder.re_encode("m2").unwrap();
        assert!(rerun.flipped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handle_reports_completion() {
        let f = fixture_with(hashed_service(), 1);
        let job = f.encoder.begin("m2").unwrap();
        let handle = f.encoder.spawn(job);
        let mut progress = handle.progress();
        let result = handle.wait().await.unwrap();

        assert!(result.flipped);
        assert!(progress.borrow_and_update().completed);
    }

    #[test]
    fn estimate_is_linear() {
        let mut job = ReEncodingJob::new("m1", "m2", 10);
        job.estimate(Duration::from_secs(5));
        assert_eq!(job.estimated_remaining, None);
        job.processed = 5;
        job.estimate(Duration::from_secs(5));
        assert_eq!(job.estimated_remaining, Some(Duration::from_secs(5)));
    }
}
