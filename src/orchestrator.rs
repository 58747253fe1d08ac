//! The search and index orchestrator.
//!
//! [`SearchOrchestrator`] is the single entry point of the crate: it plans
//! queries, fans them out to the strategy executors, merges and caches the
//! answers, and funnels every index mutation through the writer so the
//! cache, topics and events stay consistent.

use std::{
    collections::{BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde::Serialize;
use tokio::{sync::watch, task::JoinSet};

use crate::{
    cache::{CachedQuery, ResultCache},
    config::Config,
    config_db::ConfigDb,
    data_dir::DataDir,
    document::{ChangeEvent, DocumentContent, FileType},
    embedding::EmbeddingService,
    error::{Error, Result},
    events::{
        EventBus,
        IndexingProgress,
        QueryCompleted,
        Subscription,
        TopicTreeUpdated,
    },
    extract::ExtractorRegistry,
    indexer::{ChangeOutcome, Indexer, IndexingResult},
    merge::{self, MergedCandidate},
    model::{
        Candidate,
        MatchType,
        SearchOptions,
        SearchResult,
        SearchResults,
        SpellingSuggestion,
        StrategyReport,
        StrategyStatus,
        Suggestion,
    },
    model_registry::{ModelRegistry, ModelState},
    query::NormalizedQuery,
    reencode::{
        LegacyRetryResult,
        ReEncoder,
        ReEncodingHandle,
        ReEncodingJob,
        ReEncodingResult,
    },
    runtime::bounded,
    store::{IndexStore, LocalStore},
    strategy::{ExactExecutor, FuzzyExecutor, SemanticExecutor, StrategyExecutor},
    sync::plan_directory,
    topics::{TopicService, TopicTree, is_within},
    walker::discover_files,
};

/// A snapshot of the index for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStatus {
    pub documents: usize,
    pub current_model: String,
    pub pending_model: Option<String>,
    pub legacy_documents: usize,
    pub topic_generation: u64,
    pub total_topics: usize,
    pub cache_entries: usize,
}

/// What a directory sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub modified: usize,
    pub removed: usize,
    pub indexing: IndexingResult,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.modified == 0 && self.removed == 0
    }
}

pub struct SearchOrchestrator {
    config: Config,
    store: Arc<dyn IndexStore>,
    registry: Arc<ModelRegistry>,
    cache: Arc<ResultCache>,
    events: Arc<EventBus>,
    exact: Arc<StrategyExecutor>,
    fuzzy: Arc<StrategyExecutor>,
    semantic: Arc<StrategyExecutor>,
    suggester: Arc<FuzzyExecutor>,
    indexer: Arc<Indexer>,
    reencoder: Arc<ReEncoder>,
    topics: Arc<TopicService>,
    config_db: Option<Arc<ConfigDb>>,
    shutdown: watch::Sender<bool>,
}

impl SearchOrchestrator {
    /// Wire an orchestrator over existing components.
    ///
    /// `config_db`, when given, receives the topic tree snapshot.
    pub fn new(
        config: Config,
        store: Arc<dyn IndexStore>,
        embeddings: Arc<EmbeddingService>,
        registry: Arc<ModelRegistry>,
        extractors: ExtractorRegistry,
        config_db: Option<Arc<ConfigDb>>,
    ) -> Result<Self> {
        config.validate()?;
        let search = &config.search;
        let cache = Arc::new(ResultCache::from_settings(&config.cache));
        let events = Arc::new(EventBus::default());

        let exact = StrategyExecutor::Exact(ExactExecutor::new(
            Arc::clone(&store),
            search.candidate_limit,
            search.snippet_chars,
        ));
        let fuzzy =
            StrategyExecutor::Fuzzy(FuzzyExecutor::new(Arc::clone(&store), search));
        let semantic = StrategyExecutor::Semantic(SemanticExecutor::new(
            Arc::clone(&store),
            Arc::clone(&embeddings),
            Arc::clone(&registry),
            search,
        ));

        let indexer = Indexer::new(
            Arc::clone(&store),
            Arc::clone(&embeddings),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&events),
            extractors,
            config.indexing.clone(),
            search.enable_semantic,
        );
        let reencoder = ReEncoder::new(
            Arc::clone(&store),
            Arc::clone(&embeddings),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&events),
            config.indexing.clone(),
        );
        let topics = TopicService::new(
            config.topics.clone(),
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&events),
            config_db.clone(),
        )?;

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            suggester: Arc::new(FuzzyExecutor::new(Arc::clone(&store), search)),
            exact: Arc::new(exact),
            fuzzy: Arc::new(fuzzy),
            semantic: Arc::new(semantic),
            indexer: Arc::new(indexer),
            reencoder: Arc::new(reencoder),
            topics: Arc::new(topics),
            config,
            store,
            registry,
            cache,
            events,
            config_db,
            shutdown,
        })
    }

    /// Open the stores under `data_dir` with the persisted configuration.
    pub fn open(data_dir: &DataDir) -> Result<Self> {
        let config_db = Arc::new(ConfigDb::open(&data_dir.config_db())?);
        let config = Config::load(&config_db)?;
        let store: Arc<dyn IndexStore> = Arc::new(LocalStore::open(&data_dir.store_dir()?)?);
        let embeddings = Arc::new(EmbeddingService::from_settings(&config.embedding));
        let registry = Arc::new(ModelRegistry::load(
            Arc::clone(&config_db),
            &config.embedding.model,
        )?);
        tracing::debug!(
            data_dir = %data_dir.root().display(),
            model = %registry.current(),
            "orchestrator opened"
        );
        Self::new(
            config,
            store,
            embeddings,
            registry,
            ExtractorRegistry::new(),
            Some(config_db),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The settings database, when the orchestrator was opened from disk.
    pub fn config_db(&self) -> Option<&Arc<ConfigDb>> {
        self.config_db.as_ref()
    }

    /// Search options seeded from the configured defaults.
    pub fn default_options(&self) -> SearchOptions {
        SearchOptions {
            enable_exact: self.config.search.enable_exact,
            enable_fuzzy: self.config.search.enable_fuzzy,
            enable_semantic: self.config.search.enable_semantic,
            page_size: self.config.search.default_page_size,
            ..SearchOptions::default()
        }
    }

    /// Run `query` through every enabled strategy and rank the merged answer.
    ///
    /// Only invalid options, an unknown topic path or an unreachable store
    /// are errors. Failing strategies degrade the answer instead and are
    /// listed in [`SearchResults::strategies`].
    pub async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let started = Instant::now();
        options.validate(self.config.search.max_page_size)?;
        let topic = self.resolve_topic(options.topic_path.as_deref())?;

        let Some((query, syntax_error)) = NormalizedQuery::new(query) else {
            return Ok(SearchResults::empty(query, options));
        };
        // Only the exact strategy depends on the parse succeeding.
        let syntax_error = syntax_error.filter(|_| options.enable_exact);

        let key = ResultCache::key(&query.normalized, options);
        if let Some(cached) = self.cache.get(&key) {
            let results = page_of(&query.original, options, &cached, true);
            self.completed(&results, started);
            return Ok(results);
        }

        let generation = self.cache.generation();
        let state = self.registry.snapshot();
        let query = Arc::new(query);
        let (batches, reports) = self.dispatch(&query, options, &state).await;

        let dispatched: Vec<&StrategyReport> = reports
            .iter()
            .filter(|r| !matches!(r.status, StrategyStatus::Skipped(_)))
            .collect();
        if !dispatched.is_empty() && dispatched.iter().all(|r| r.is_failure()) {
            tracing::warn!(query = %query.original, "every strategy failed");
            let mut results = SearchResults::empty(&query.original, options);
            results.strategies = reports;
            results.syntax_error = syntax_error;
            results.unavailable = true;
            self.completed(&results, started);
            return Ok(results);
        }

        let semantic_model = reports
            .iter()
            .any(|r| {
                r.strategy == MatchType::Semantic
                    && r.status == StrategyStatus::Completed
            })
            .then(|| state.current.clone());

        let mut merged = merge::merge_candidates(batches);
        let lexical_hits = merged
            .iter()
            .filter(|m| {
                m.match_types.contains(&MatchType::Exact)
                    || m.match_types.contains(&MatchType::Fuzzy)
            })
            .count();

        if !query.excluded.is_empty() {
            let store = Arc::clone(&self.store);
            let excluded_terms = query.excluded.clone();
            let excluded = bounded("exclusion", self.store_timeout(), move || {
                store.documents_containing(&excluded_terms)
            })
            .await?;
            merged.retain(|m| !excluded.contains(&m.document_id));
        }

        let mut results = self.enrich(merged).await?;
        if let Some(topic) = &topic {
            results.retain(|r| {
                r.topic_path.as_deref().is_some_and(|p| is_within(p, topic))
            });
        }
        let filters = &options.filters;
        results.retain(|r| {
            filters.admits(r.file_type, r.modified)
                && filters.min_relevance.is_none_or(|min| r.relevance_score >= min)
        });
        merge::sort_results(&mut results, options.sort);

        let spelling_suggestions = if options.enable_fuzzy && lexical_hits == 0 {
            self.spelling_for(&query.terms).await
        } else {
            Vec::new()
        };

        let answer = CachedQuery {
            results,
            strategies: reports,
            syntax_error,
            spelling_suggestions,
            semantic_model,
        };
        let degraded = answer.strategies.iter().any(StrategyReport::is_failure);
        let page = page_of(&query.original, options, &answer, false);
        if !degraded {
            self.cache.put(key, answer, generation);
        }

        self.completed(&page, started);
        Ok(page)
    }

    /// [`search`](Self::search) restricted to a topic subtree.
    pub async fn search_hierarchical_topics(
        &self,
        topic_path: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<SearchResults> {
        let options = SearchOptions {
            topic_path: Some(topic_path.to_string()),
            ..options.clone()
        };
        self.search(query, &options).await
    }

    /// Vocabulary completions for the last word of `partial_query`.
    pub async fn get_suggestions(&self, partial_query: &str) -> Result<Vec<Suggestion>> {
        let Some(prefix) = partial_query
            .split_whitespace()
            .last()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
            .filter(|w| !w.is_empty())
        else {
            return Ok(Vec::new());
        };
        let store = Arc::clone(&self.store);
        let limit = self.config.search.max_suggestions;
        let terms = bounded("suggestions", self.store_timeout(), move || {
            store.vocabulary(&prefix, limit)
        })
        .await?;
        Ok(terms
            .into_iter()
            .map(|(term, frequency)| Suggestion { term, frequency })
            .collect())
    }

    /// Close vocabulary terms for each word of `query`.
    pub async fn get_spelling_suggestions(
        &self,
        query: &str,
    ) -> Result<Vec<SpellingSuggestion>> {
        let Some((query, _)) = NormalizedQuery::new(query) else {
            return Ok(Vec::new());
        };
        let suggester = Arc::clone(&self.suggester);
        bounded("spelling", self.store_timeout(), move || {
            suggester.suggest(&query.terms)
        })
        .await
    }

    pub fn get_topic_tree(&self) -> Arc<TopicTree> {
        self.topics.tree()
    }

    /// Rebuild the topic tree from the current model's vectors.
    pub async fn generate_topic_hierarchy(&self) -> Result<Arc<TopicTree>> {
        let topics = Arc::clone(&self.topics);
        let cancel = self.shutdown.subscribe();
        tokio::task::spawn_blocking(move || topics.regenerate(&cancel))
            .await
            .map_err(|e| Error::ServiceUnavailable(format!("topic generation failed: {e}")))?
    }

    /// Start migrating every document to `model` in the background.
    pub async fn start_re_encoding(&self, model: &str) -> Result<ReEncodingHandle> {
        let reencoder = Arc::clone(&self.reencoder);
        let model = model.to_string();
        let job = bounded("re-encoding setup", self.write_timeout(), move || {
            reencoder.begin(&model)
        })
        .await?;
        Ok(self.reencoder.spawn(job))
    }

    /// Migrate every document to `model` and wait for the flip.
    pub async fn re_encode_documents(&self, model: &str) -> Result<ReEncodingResult> {
        let handle = self.start_re_encoding(model).await?;
        let result = handle.wait().await?;
        if result.flipped && self.topics.enabled() {
            self.regenerate_quietly().await;
        }
        Ok(result)
    }

    /// Retry documents still served by an older model.
    pub async fn retry_legacy_documents(&self) -> Result<LegacyRetryResult> {
        let reencoder = Arc::clone(&self.reencoder);
        bounded("legacy retry", self.write_timeout(), move || {
            reencoder.retry_legacy()
        })
        .await
    }

    pub async fn index_document(&self, content: DocumentContent) -> Result<bool> {
        let indexer = Arc::clone(&self.indexer);
        bounded("index document", self.write_timeout(), move || {
            indexer.index_document(&content)
        })
        .await
    }

    /// Index many documents; topics are rebuilt afterwards when configured.
    pub async fn bulk_index(&self, documents: Vec<DocumentContent>) -> Result<IndexingResult> {
        let indexer = Arc::clone(&self.indexer);
        let result = bounded("bulk index", self.write_timeout(), move || {
            Ok(indexer.bulk_index(&documents))
        })
        .await?;
        if result.indexed > 0 {
            self.after_bulk().await;
        }
        Ok(result)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let indexer = Arc::clone(&self.indexer);
        let id = document_id.to_string();
        bounded("delete document", self.write_timeout(), move || {
            indexer.delete_document(&id)
        })
        .await
    }

    pub async fn apply_change(&self, event: ChangeEvent) -> Result<ChangeOutcome> {
        let indexer = Arc::clone(&self.indexer);
        bounded("apply change", self.write_timeout(), move || {
            indexer.apply_change(&event)
        })
        .await
    }

    /// Bring the index in line with the files under `root`.
    pub async fn sync_directory(&self, root: &Path) -> Result<SyncReport> {
        let indexer = Arc::clone(&self.indexer);
        let store = Arc::clone(&self.store);
        let root = root.to_path_buf();
        let file_types = self.supported_file_types();
        let report = bounded("sync", self.write_timeout(), move || {
            let discovered = discover_files(&root, &file_types)?;
            let known = store.list_documents()?;
            let events = plan_directory(&root, &discovered, &known);

            let mut report = SyncReport::default();
            let mut changed: Vec<PathBuf> = Vec::new();
            for event in &events {
                match event {
                    ChangeEvent::Created(path) => {
                        report.created += 1;
                        changed.push(path.clone());
                    }
                    ChangeEvent::Modified(path) => {
                        report.modified += 1;
                        changed.push(path.clone());
                    }
                    ChangeEvent::Removed(_) => {
                        report.removed += 1;
                        if let Err(e) = indexer.apply_change(event) {
                            tracing::warn!(
                                path = %event.path().display(),
                                error = %e,
                                "failed to remove document"
                            );
                        }
                    }
                }
            }
            report.indexing = indexer.index_paths(&changed);
            Ok(report)
        })
        .await?;

        tracing::info!(
            created = report.created,
            modified = report.modified,
            removed = report.removed,
            failed = report.indexing.failed,
            "directory synced"
        );
        if report.indexing.indexed > 0 || report.removed > 0 {
            self.after_bulk().await;
        }
        Ok(report)
    }

    /// Drop every indexed document stored under `root`.
    pub async fn forget_directory(&self, root: &Path) -> Result<usize> {
        let indexer = Arc::clone(&self.indexer);
        let store = Arc::clone(&self.store);
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let removed = bounded("forget directory", self.write_timeout(), move || {
            let mut removed = 0;
            for info in store.list_documents()? {
                if Path::new(&info.path).starts_with(&root)
                    && indexer.delete_document(&info.id)?
                {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?;
        if removed > 0 {
            self.after_bulk().await;
        }
        Ok(removed)
    }

    pub async fn status(&self) -> Result<IndexStatus> {
        let store = Arc::clone(&self.store);
        let documents =
            bounded("status", self.store_timeout(), move || store.document_count()).await?;
        let state = self.registry.snapshot();
        let tree = self.topics.tree();
        Ok(IndexStatus {
            documents,
            current_model: state.current.clone(),
            pending_model: state.pending.clone(),
            legacy_documents: state.legacy.len(),
            topic_generation: tree.generation,
            total_topics: tree.total_topics,
            cache_entries: self.cache.len(),
        })
    }

    pub fn subscribe_indexing(&self) -> Subscription<IndexingProgress> {
        self.events.indexing.subscribe()
    }

    pub fn subscribe_re_encoding(&self) -> Subscription<ReEncodingJob> {
        self.events.re_encoding.subscribe()
    }

    pub fn subscribe_topics(&self) -> Subscription<TopicTreeUpdated> {
        self.events.topics.subscribe()
    }

    pub fn subscribe_queries(&self) -> Subscription<QueryCompleted> {
        self.events.queries.subscribe()
    }

    /// Ask background topic builds to stop at their next checkpoint.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// The writer, for feeding an [`crate::worker::IndexWorker`].
    pub fn indexer(&self) -> Arc<Indexer> {
        Arc::clone(&self.indexer)
    }

    fn resolve_topic(&self, topic_path: Option<&str>) -> Result<Option<String>> {
        let Some(path) = topic_path else {
            return Ok(None);
        };
        let path = path.trim_matches('/');
        if !self.topics.tree().contains(path) {
            return Err(Error::NotFound {
                kind: "topic",
                name: path.to_string(),
            });
        }
        Ok(Some(path.to_string()))
    }

    /// Run every enabled strategy concurrently, each under its own timeout.
    async fn dispatch(
        &self,
        query: &Arc<NormalizedQuery>,
        options: &SearchOptions,
        state: &Arc<ModelState>,
    ) -> (Vec<(MatchType, Vec<Candidate>)>, Vec<StrategyReport>) {
        let timeout_ms = self.config.search.strategy_timeout_ms;
        let filters = Arc::new(options.filters.clone());
        let mut reports = Vec::new();
        let mut tasks = JoinSet::new();

        for kind in MatchType::ALL {
            if let Some(reason) = self.skip_reason(kind, query, options) {
                reports.push(StrategyReport {
                    strategy: kind,
                    status: StrategyStatus::Skipped(reason.into()),
                    latency_ms: 0,
                    candidates: 0,
                });
                continue;
            }
            let executor = Arc::clone(self.executor(kind));
            let query = Arc::clone(query);
            let filters = Arc::clone(&filters);
            let state = Arc::clone(state);
            tasks.spawn(async move {
                let started = Instant::now();
                let outcome = bounded(kind.as_str(), timeout_ms, move || {
                    executor.execute_at(&state, &query, &filters)
                })
                .await;
                (kind, outcome, started.elapsed())
            });
        }

        let mut batches = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok((kind, outcome, elapsed)) = joined else {
                continue;
            };
            let latency_ms = elapsed.as_millis() as u64;
            match outcome {
                Ok(candidates) => {
                    reports.push(StrategyReport {
                        strategy: kind,
                        status: StrategyStatus::Completed,
                        latency_ms,
                        candidates: candidates.len(),
                    });
                    batches.push((kind, candidates));
                }
                Err(Error::Timeout { .. }) => {
                    let e = Error::StrategyTimeout {
                        strategy: kind,
                        timeout_ms,
                    };
                    tracing::warn!(error = %e, "strategy dropped");
                    reports.push(StrategyReport {
                        strategy: kind,
                        status: StrategyStatus::TimedOut,
                        latency_ms,
                        candidates: 0,
                    });
                }
                Err(e) => {
                    tracing::warn!(strategy = %kind, error = %e, "strategy failed");
                    reports.push(StrategyReport {
                        strategy: kind,
                        status: StrategyStatus::Failed(e.to_string()),
                        latency_ms,
                        candidates: 0,
                    });
                }
            }
        }

        // a panicked strategy never reported back
        let reported: BTreeSet<MatchType> = reports.iter().map(|r| r.strategy).collect();
        for kind in MatchType::ALL {
            if !reported.contains(&kind) {
                reports.push(StrategyReport {
                    strategy: kind,
                    status: StrategyStatus::Failed("strategy task panicked".into()),
                    latency_ms: 0,
                    candidates: 0,
                });
            }
        }
        batches.sort_by_key(|(kind, _)| *kind);
        reports.sort_by_key(|r| r.strategy);
        (batches, reports)
    }

    fn skip_reason(
        &self,
        kind: MatchType,
        query: &NormalizedQuery,
        options: &SearchOptions,
    ) -> Option<&'static str> {
        if !options.is_enabled(kind) {
            return Some("disabled for this query");
        }
        match kind {
            MatchType::Exact if query.expression.is_none() => Some("query syntax error"),
            MatchType::Semantic if !self.config.search.enable_semantic => {
                Some("disabled in configuration")
            }
            _ => None,
        }
    }

    fn executor(&self, kind: MatchType) -> &Arc<StrategyExecutor> {
        match kind {
            MatchType::Exact => &self.exact,
            MatchType::Fuzzy => &self.fuzzy,
            MatchType::Semantic => &self.semantic,
        }
    }

    /// Attach document metadata; candidates whose record is gone are dropped.
    async fn enrich(&self, merged: Vec<MergedCandidate>) -> Result<Vec<SearchResult>> {
        if merged.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = merged
            .iter()
            .map(|m| m.document_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let store = Arc::clone(&self.store);
        let infos = bounded("enrichment", self.store_timeout(), move || {
            store.documents(&ids)
        })
        .await?;

        Ok(merged
            .into_iter()
            .filter_map(|m| {
                let info = infos.get(&m.document_id)?;
                Some(SearchResult {
                    document_id: m.document_id,
                    title: info.title.clone(),
                    path: info.path.clone(),
                    file_type: info.file_type,
                    modified: info.modified,
                    page_number: m.page,
                    snippet: m.snippet,
                    relevance_score: m.score,
                    match_types: m.match_types,
                    topic_path: info.topic_path.clone(),
                })
            })
            .collect())
    }

    async fn spelling_for(&self, terms: &[String]) -> Vec<SpellingSuggestion> {
        let suggester = Arc::clone(&self.suggester);
        let terms = terms.to_vec();
        match bounded("spelling", self.store_timeout(), move || {
            suggester.suggest(&terms)
        })
        .await
        {
            Ok(suggestions) => suggestions,
            Err(e) => {
                tracing::warn!(error = %e, "spelling suggestions unavailable");
                Vec::new()
            }
        }
    }

    async fn after_bulk(&self) {
        if self.config.topics.enabled && self.config.topics.regenerate_after_bulk {
            self.regenerate_quietly().await;
        }
    }

    async fn regenerate_quietly(&self) {
        if let Err(e) = self.generate_topic_hierarchy().await {
            tracing::warn!(error = %e, "topic regeneration failed");
        }
    }

    fn completed(&self, results: &SearchResults, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            query = %results.query,
            results = results.total,
            from_cache = results.from_cache,
            unavailable = results.unavailable,
            elapsed_ms,
            "query completed"
        );
        self.events.queries.publish(QueryCompleted {
            query: results.query.clone(),
            results: results.total,
            strategies: results.strategies.clone(),
            from_cache: results.from_cache,
            elapsed_ms,
        });
    }

    fn supported_file_types(&self) -> Vec<FileType> {
        self.config.indexing.supported_file_types.clone()
    }

    fn store_timeout(&self) -> u64 {
        self.config.search.strategy_timeout_ms
    }

    fn write_timeout(&self) -> u64 {
        self.config.indexing.operation_timeout_ms
    }
}

impl std::fmt::Debug for SearchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOrchestrator")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

fn page_of(
    query: &str,
    options: &SearchOptions,
    answer: &CachedQuery,
    from_cache: bool,
) -> SearchResults {
    SearchResults {
        query: query.to_string(),
        results: merge::paginate(&answer.results, options.page, options.page_size),
        total: answer.results.len(),
        page: options.page,
        page_size: options.page_size,
        strategies: answer.strategies.clone(),
        syntax_error: answer.syntax_error.clone(),
        spelling_suggestions: answer.spelling_suggestions.clone(),
        unavailable: false,
        from_cache,
        semantic_model: answer.semantic_model.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::{
        config::{SearchSettings, TopicSettings},
        embedding::{DeviceKind, Embedder},
        testing::{TestCorpus, doc, hashed_service},
    };

    /// Answers document batches at once and queries far too late.
    struct SlowQueries;

    impl Embedder for SlowQueries {
        fn model_id(&self) -> &str {
            "slow"
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }

        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }

        fn embed_query(&self, _text: &str) -> Result<Vec<f32>> {
            std::thread::sleep(Duration::from_millis(1_500));
            Ok(vec![1.0, 0.0])
        }
    }

    fn documents() -> Vec<DocumentContent> {
        [
            ("t1", "BST", "binary search trees balance rotation"),
            ("t2", "Red black", "red black trees balance rotation"),
            ("t3", "AVL", "avl trees balance rotation height"),
            ("t4", "Splay", "splay trees rotation balance"),
            ("c1", "Pasta", "pasta recipes tomato sauce cooking"),
            ("c2", "Pizza", "pizza recipes tomato cheese cooking"),
            ("c3", "Soup", "soup recipes cooking vegetables"),
            ("c4", "Bread", "bread recipes cooking flour"),
        ]
        .into_iter()
        .map(|(id, title, text)| {
            DocumentContent::from_text(format!("/corpus/{id}.md"), title, text)
        })
        .collect()
    }

    fn test_config() -> Config {
        Config {
            topics: TopicSettings {
                min_cluster_size: 2,
                branching_factor: 2,
                max_depth: 1,
                ..TopicSettings::default()
            },
            ..Config::default()
        }
    }

    async fn orchestrator(config: Config) -> (TestCorpus, SearchOrchestrator) {
        let corpus = TestCorpus::new();
        let orchestrator = SearchOrchestrator::new(
            config,
            corpus.store(),
            hashed_service(),
            Arc::new(ModelRegistry::new("m1")),
            ExtractorRegistry::new(),
            None,
        )
        .unwrap();
        let result = orchestrator.bulk_index(documents()).await.unwrap();
        assert_eq!(result.indexed, 8);
        (corpus, orchestrator)
    }

    fn status_of(results: &SearchResults, kind: MatchType) -> &StrategyStatus {
        &results
            .strategies
            .iter()
            .find(|r| r.strategy == kind)
            .unwrap()
            .status
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn later_pages_come_from_the_cache() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let options = SearchOptions {
            page_size: 2,
            ..o.default_options()
        };

        let first = o.search("trees", &options).await.unwrap();
        assert!(!first.from_cache);
        assert!(first.total >= 4);
        assert_eq!(first.results.len(), 2);
        assert_eq!(first.semantic_model.as_deref(), Some("m1"));

        let second = o
            .search("trees", &SearchOptions { page: 2, ..options })
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.total, first.total);
        assert_ne!(second.results[0].document_id, first.results[0].document_id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn syntax_errors_skip_only_the_exact_strategy() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let results = o.search("trees AND (", &o.default_options()).await.unwrap();

        assert!(results.syntax_error.is_some());
        assert!(matches!(
            status_of(&results, MatchType::Exact),
            StrategyStatus::Skipped(_)
        ));
        assert_eq!(status_of(&results, MatchType::Fuzzy), &StrategyStatus::Completed);
        assert_eq!(
            status_of(&results, MatchType::Semantic),
            &StrategyStatus::Completed
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn negated_terms_exclude_documents_from_every_strategy() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let results = o.search("trees NOT avl", &o.default_options()).await.unwrap();

        assert!(!results.results.is_empty());
        assert!(results.results.iter().all(|r| r.title != "AVL"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn negation_holds_without_the_exact_strategy() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let options = SearchOptions {
            enable_exact: false,
            ..o.default_options()
        };
        let results = o.search("trees AND NOT avl", &options).await.unwrap();

        assert!(results.syntax_error.is_none());
        assert!(!results.results.is_empty());
        assert!(results.results.iter().all(|r| r.title != "AVL"));
        assert!(matches!(
            status_of(&results, MatchType::Exact),
            StrategyStatus::Skipped(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_topics_and_bad_pages_are_rejected() {
        let (_corpus, o) = orchestrator(test_config()).await;

        let options = SearchOptions {
            topic_path: Some("no/such/topic".into()),
            ..o.default_options()
        };
        let err = o.search("trees", &options).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "topic", .. }));

        let options = SearchOptions {
            page: 0,
            ..o.default_options()
        };
        let err = o.search("trees", &options).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOptions(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn topic_search_stays_inside_the_subtree() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let tree = o.get_topic_tree();
        assert!(!tree.is_empty());

        let all = o.search("rotation", &o.default_options()).await.unwrap();
        let topic = all.results[0].topic_path.clone().unwrap();
        let scoped = o
            .search_hierarchical_topics(&topic, "rotation", &o.default_options())
            .await
            .unwrap();

        assert!(!scoped.results.is_empty());
        assert!(scoped.total <= all.total);
        for r in &scoped.results {
            assert!(is_within(r.topic_path.as_deref().unwrap(), &topic));
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spelling_suggestions_when_nothing_matches_lexically() {
        let config = Config {
            search: SearchSettings {
                fuzzy_confidence_floor: 0.95,
                spelling_similarity_floor: 0.5,
                ..SearchSettings::default()
            },
            ..test_config()
        };
        let (_corpus, o) = orchestrator(config).await;
        let results = o.search("rotatoin", &o.default_options()).await.unwrap();

        assert!(
            results
                .spelling_suggestions
                .iter()
                .any(|s| s.suggestion == "rotation")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_semantic_search_is_reported_as_skipped() {
        let config = Config {
            search: SearchSettings {
                enable_semantic: false,
                ..SearchSettings::default()
            },
            ..test_config()
        };
        let (_corpus, o) = orchestrator(config).await;
        let options = SearchOptions {
            enable_semantic: true,
            ..o.default_options()
        };
        let results = o.search("trees", &options).await.unwrap();

        assert!(matches!(
            status_of(&results, MatchType::Semantic),
            StrategyStatus::Skipped(_)
        ));
        assert!(results.semantic_model.is_none());
        assert!(results.results.iter().all(|r| !r.match_types.contains(&MatchType::Semantic)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completions_come_from_the_vocabulary() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let suggestions = o.get_suggestions("balanced tr").await.unwrap();
        assert!(suggestions.iter().any(|s| s.term == "trees"));
        assert!(o.get_suggestions("   ").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queries_publish_completion_events() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let mut queries = o.subscribe_queries();
        o.search("cooking", &o.default_options()).await.unwrap();

        let event = queries.try_recv().unwrap();
        assert_eq!(event.query, "cooking");
        assert!(!event.from_cache);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn re_encoding_flips_the_model_in_status() {
        let (_corpus, o) = orchestrator(test_config()).await;
        let result = o.re_encode_documents("m2").await.unwrap();
        assert!(result.flipped);
        assert_eq!(result.migrated, 8);

        let status = o.status().await.unwrap();
        assert_eq!(status.documents, 8);
        assert_eq!(status.current_model, "m2");
        assert_eq!(status.pending_model, None);
        assert_eq!(status.legacy_documents, 0);

        let results = o.search("cooking", &o.default_options()).await.unwrap();
        assert_eq!(results.semantic_model.as_deref(), Some("m2"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn a_slow_strategy_yields_partial_results() {
        let corpus = TestCorpus::with(&[
            doc("a", "Trees", "binary search trees"),
            doc("b", "Soup", "tomato soup"),
        ]);
        let embeddings = Arc::new(EmbeddingService::new(Arc::new(
            |_: &str| -> Result<Arc<dyn Embedder>> { Ok(Arc::new(SlowQueries)) },
        )));
        let config = Config {
            search: SearchSettings {
                strategy_timeout_ms: 300,
                ..SearchSettings::default()
            },
            ..Config::default()
        };
        let o = SearchOrchestrator::new(
            config,
            corpus.store(),
            embeddings,
            Arc::new(ModelRegistry::new("slow")),
            ExtractorRegistry::new(),
            None,
        )
        .unwrap();

        let results = o.search("trees", &o.default_options()).await.unwrap();
        assert_eq!(status_of(&results, MatchType::Semantic), &StrategyStatus::TimedOut);
        assert_eq!(status_of(&results, MatchType::Exact), &StrategyStatus::Completed);
        assert!(!results.unavailable);
        assert_eq!(results.results[0].document_id, "a");

        let again = o.search("trees", &o.default_options()).await.unwrap();
        assert!(!again.from_cache);
    }
}
