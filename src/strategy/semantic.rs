use std::{collections::HashSet, sync::Arc};

use crate::{
    embedding::EmbeddingService,
    error::Result,
    model::{Candidate, SearchFilters},
    model_registry::{ModelRegistry, ModelState},
    query::NormalizedQuery,
    store::{IndexStore, VectorHit},
    text_util,
};

/// Vector similarity search against the current embedding model.
///
/// An unavailable embedder degrades to no candidates rather than an error.
pub struct SemanticExecutor {
    store: Arc<dyn IndexStore>,
    embeddings: Arc<EmbeddingService>,
    registry: Arc<ModelRegistry>,
    enabled: bool,
    threshold: f32,
    limit: usize,
    snippet_chars: usize,
}

impl SemanticExecutor {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embeddings: Arc<EmbeddingService>,
        registry: Arc<ModelRegistry>,
        settings: &crate::config::SearchSettings,
    ) -> Self {
        Self {
            store,
            embeddings,
            registry,
            enabled: settings.enable_semantic,
            threshold: settings.semantic_similarity_threshold,
            limit: settings.candidate_limit,
            snippet_chars: settings.snippet_chars,
        }
    }

    pub fn execute(
        &self,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        self.execute_with(&self.registry.snapshot(), query, filters)
    }

    /// Run against a fixed model snapshot.
    ///
    /// Documents left on an older model are consulted only while no
    /// re-encoding is pending, so one answer never mixes two migrations.
    pub fn execute_with(
        &self,
        state: &ModelState,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let text = query.semantic_text();

        let mut hits = match self.embeddings.embed_query(&state.current, &text) {
            Ok(vector) => self.store.knn_query(
                &vector,
                self.limit,
                &state.current,
                filters,
                None,
            )?,
            Err(e) => {
                tracing::warn!(
                    model = %state.current,
                    error = %e,
                    "semantic search unavailable"
                );
                return Ok(Vec::new());
            }
        };

        if state.pending.is_none() {
            for (model, documents) in state.legacy_by_model() {
                let allowed: HashSet<String> = documents.into_iter().collect();
                match self.embeddings.embed_query(&model, &text) {
                    Ok(vector) => hits.extend(self.store.knn_query(
                        &vector,
                        self.limit,
                        &model,
                        filters,
                        Some(&allowed),
                    )?),
                    Err(e) => tracing::warn!(
                        model = %model,
                        error = %e,
                        "skipping legacy documents"
                    ),
                }
            }
        }

        let mut candidates: Vec<Candidate> = hits
            .into_iter()
            .filter(|hit| hit.similarity >= self.threshold)
            .map(|hit| self.candidate(hit, query))
            .collect();
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        candidates.truncate(self.limit);
        Ok(candidates)
    }

    fn candidate(&self, hit: VectorHit, query: &NormalizedQuery) -> Candidate {
        Candidate {
            score: hit.similarity.clamp(0.0, 1.0),
            snippet: text_util::build_snippet(
                &hit.text,
                &query.terms,
                self.snippet_chars,
            ),
            document_id: hit.document_id,
            page: hit.page,
        }
    }
}

impl std::fmt::Debug for SemanticExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticExecutor")
            .field("enabled", &self.enabled)
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::{
        config::SearchSettings,
        embedding::{Embedder, hashed::HashedFactory},
        error::Error,
        testing::{TestCorpus, doc},
    };

    fn hashed_service() -> Arc<EmbeddingService> {
        Arc::new(EmbeddingService::new(Arc::new(HashedFactory { dimension: 256 })))
    }

    fn corpus(embeddings: &EmbeddingService, model: &str) -> TestCorpus {
        let records = [
            doc("a", "Trees", "binary search trees"),
            doc("b", "Pasta", "boil pasta in salted water"),
        ];
        TestCorpus::with_vectors(&records, embeddings, model)
    }

    #[test]
    fn finds_similar_documents() {
        let embeddings = hashed_service();
        let corpus = corpus(&embeddings, "m1");
        let registry = Arc::new(ModelRegistry::new("m1"));
        let exec = SemanticExecutor::new(
            corpus.store(),
            Arc::clone(&embeddings),
            registry,
            &SearchSettings::default(),
        );

        let (query, _) = NormalizedQuery::new("binary search trees").unwrap();
        let candidates = exec.execute(&query, &SearchFilters::default()).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].document_id, "a");
        assert!(candidates[0].score > 0.99);
    }

    #[test]
    fn unavailable_embedder_yields_nothing() {
        let down = Arc::new(EmbeddingService::new(Arc::new(
            |_: &str| -> Result<Arc<dyn Embedder>> {
                Err(Error::ServiceUnavailable("offline".into()))
            },
        )));
        let corpus = corpus(&hashed_service(), "m1");
        let exec = SemanticExecutor::new(
            corpus.store(),
            down,
            Arc::new(ModelRegistry::new("m1")),
            &SearchSettings::default(),
        );
        let (query, _) = NormalizedQuery::new("trees").unwrap();
        assert!(exec.execute(&query, &SearchFilters::default()).unwrap().is_empty());
    }

    #[test]
    fn legacy_documents_are_served_by_their_model() {
        let embeddings = hashed_service();
        let corpus = corpus(&embeddings, "old");
        let registry = Arc::new(ModelRegistry::new("old"));
        registry.begin("new").unwrap();
        let failed: BTreeSet<String> = ["a".to_string(), "b".to_string()].into();
        registry.complete(&registry.lock_writes(), "new", &failed).unwrap();

        let exec = SemanticExecutor::new(
            corpus.store(),
            Arc::clone(&embeddings),
            Arc::clone(&registry),
            &SearchSettings::default(),
        );
        let (query, _) = NormalizedQuery::new("binary search trees").unwrap();
        let found = exec.execute(&query, &SearchFilters::default()).unwrap();
        assert_eq!(found.len(), 1);

        registry.begin("newer").unwrap();
        let found = exec.execute(&query, &SearchFilters::default()).unwrap();
        assert!(found.is_empty());
    }
}
