use std::sync::Arc;

use crate::{
    error::Result,
    model::{Candidate, SearchFilters},
    query::NormalizedQuery,
    store::IndexStore,
    text_util,
};

/// Boolean keyword matching ranked by BM25.
pub struct ExactExecutor {
    store: Arc<dyn IndexStore>,
    limit: usize,
    snippet_chars: usize,
}

impl ExactExecutor {
    pub fn new(store: Arc<dyn IndexStore>, limit: usize, snippet_chars: usize) -> Self {
        Self {
            store,
            limit,
            snippet_chars,
        }
    }

    /// Scores are divided by the best score of the batch.
    pub fn execute(
        &self,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        let Some(expr) = &query.expression else {
            return Ok(Vec::new());
        };

        let hits = self.store.boolean_query(expr, filters, self.limit)?;
        let top = hits.iter().map(|h| h.score).fold(0.0f32, f32::max);

        Ok(hits
            .into_iter()
            .map(|hit| Candidate {
                score: if top > 0.0 { hit.score / top } else { 0.0 },
                snippet: text_util::build_snippet(
                    &hit.text,
                    &query.terms,
                    self.snippet_chars,
                ),
                document_id: hit.document_id,
                page: hit.page,
            })
            .collect())
    }
}

impl std::fmt::Debug for ExactExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExactExecutor")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestCorpus, doc};

    #[test]
    fn scores_are_normalized_to_the_top_hit() {
        let corpus = TestCorpus::with(&[
            doc("a", "Trees", "trees trees trees and more trees"),
            doc("b", "Notes", "a page that mentions trees once"),
            doc("c", "Pasta", "boil the water"),
        ]);
        let exec = ExactExecutor::new(corpus.store(), 10, 120);
        let (query, _) = NormalizedQuery::new("trees").unwrap();

        let candidates = exec.execute(&query, &SearchFilters::default()).unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].document_id, "a");
        assert!((candidates[0].score - 1.0).abs() < 1e-6);
        assert!(candidates[1].score < 1.0 && candidates[1].score > 0.0);
        assert!(!candidates[1].snippet.highlights.is_empty());
    }

    #[test]
    fn unparsed_queries_produce_nothing() {
        let corpus = TestCorpus::with(&[doc("a", "Trees", "trees")]);
        let exec = ExactExecutor::new(corpus.store(), 10, 120);
        let (query, error) = NormalizedQuery::new("(trees").unwrap();
        assert!(error.is_some());
        assert!(exec.execute(&query, &SearchFilters::default()).unwrap().is_empty());
    }
}
