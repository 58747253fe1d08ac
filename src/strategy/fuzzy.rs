use std::sync::Arc;

use crate::{
    config::SearchSettings,
    error::Result,
    model::{Candidate, SearchFilters, SpellingSuggestion},
    query::NormalizedQuery,
    store::{IndexStore, text_index::MAX_FUZZY_DISTANCE},
    text_util,
};

/// Typo-tolerant matching scored by normalized Levenshtein similarity.
pub struct FuzzyExecutor {
    store: Arc<dyn IndexStore>,
    max_edit_distance: u8,
    confidence_floor: f32,
    spelling_floor: f32,
    limit: usize,
    max_suggestions: usize,
    snippet_chars: usize,
}

impl FuzzyExecutor {
    pub fn new(store: Arc<dyn IndexStore>, settings: &SearchSettings) -> Self {
        Self {
            store,
            max_edit_distance: settings
                .fuzzy_max_edit_distance
                .min(MAX_FUZZY_DISTANCE),
            confidence_floor: settings.fuzzy_confidence_floor,
            spelling_floor: settings.spelling_similarity_floor,
            limit: settings.candidate_limit,
            max_suggestions: settings.max_suggestions,
            snippet_chars: settings.snippet_chars,
        }
    }

    /// Pages whose words are close to every query term on average.
    pub fn execute(
        &self,
        query: &NormalizedQuery,
        filters: &SearchFilters,
    ) -> Result<Vec<Candidate>> {
        if query.terms.is_empty() {
            return Ok(Vec::new());
        }
        let hits = self.store.fuzzy_query(
            &query.terms,
            self.max_edit_distance,
            filters,
            self.limit,
        )?;

        let mut candidates = Vec::new();
        for hit in hits {
            let words = text_util::lowercase_words(&hit.text);
            let score = page_confidence(&query.terms, &words);
            if score < self.confidence_floor {
                continue;
            }
            let mut snippet =
                text_util::build_snippet_with(&hit.text, self.snippet_chars, |w| {
                    self.is_close(w, &query.terms)
                });
            snippet.confidence = Some(score);
            candidates.push(Candidate {
                document_id: hit.document_id,
                page: hit.page,
                score,
                snippet,
            });
        }
        candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(candidates)
    }

    /// Vocabulary words close to the query terms, best first.
    pub fn suggest(&self, terms: &[String]) -> Result<Vec<SpellingSuggestion>> {
        if terms.is_empty() || self.max_suggestions == 0 {
            return Ok(Vec::new());
        }
        let vocabulary = self.store.vocabulary("", usize::MAX)?;

        let mut suggestions: Vec<SpellingSuggestion> = Vec::new();
        for term in terms {
            let term = term.to_lowercase();
            for (word, frequency) in &vocabulary {
                if *word == term
                    || strsim::levenshtein(&term, word)
                        > usize::from(self.max_edit_distance)
                {
                    continue;
                }
                let similarity = strsim::normalized_levenshtein(&term, word) as f32;
                if similarity < self.spelling_floor {
                    continue;
                }
                suggestions.push(SpellingSuggestion {
                    original: term.clone(),
                    suggestion: word.clone(),
                    similarity,
                    frequency: *frequency,
                });
            }
        }

        suggestions.sort_by(|a, b| {
            b.similarity
                .total_cmp(&a.similarity)
                .then_with(|| b.frequency.cmp(&a.frequency))
                .then_with(|| a.suggestion.cmp(&b.suggestion))
        });
        suggestions.dedup_by(|a, b| a.suggestion == b.suggestion);
        suggestions.truncate(self.max_suggestions);
        Ok(suggestions)
    }

    fn is_close(&self, word: &str, terms: &[String]) -> bool {
        terms.iter().any(|t| {
            strsim::levenshtein(word, t) <= usize::from(self.max_edit_distance)
                && strsim::normalized_levenshtein(word, t) as f32
                    >= self.confidence_floor
        })
    }
}

/// Mean over `terms` of the best similarity to any of `words`.
fn page_confidence(terms: &[String], words: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let total: f64 = terms
        .iter()
        .map(|term| {
            words
                .iter()
                .map(|w| strsim::normalized_levenshtein(term, w))
                .fold(0.0f64, f64::max)
        })
        .sum();
    (total / terms.len() as f64) as f32
}

impl std::fmt::Debug for FuzzyExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuzzyExecutor")
            .field("max_edit_distance", &self.max_edit_distance)
            .field("confidence_floor", &self.confidence_floor)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestCorpus, doc};

    fn executor(corpus: &TestCorpus) -> FuzzyExecutor {
        FuzzyExecutor::new(corpus.store(), &SearchSettings::default())
    }

    #[test]
    fn typo_matches_with_confidence() {
        let corpus = TestCorpus::with(&[
            doc("a", "Sorting", "an algorithm for sorting"),
            doc("b", "Pasta", "boil the water"),
        ]);
        let (query, _) = NormalizedQuery::new("algoritm").unwrap();

        let candidates = executor(&corpus)
            .execute(&query, &SearchFilters::default())
            .unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.document_id, "a");
        assert!(c.score >= 0.8 && c.score < 1.0);
        assert_eq!(c.snippet.confidence, Some(c.score));
        let (start, end) = c.snippet.highlights[0];
        assert_eq!(&c.snippet.text[start..end], "algorithm");
    }

    #[test]
    fn distant_words_fall_below_the_floor() {
        let corpus = TestCorpus::with(&[doc("a", "Sorting", "an algebra primer")]);
        let (query, _) = NormalizedQuery::new("algoritm").unwrap();
        assert!(executor(&corpus)
            .execute(&query, &SearchFilters::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn confidence_is_the_mean_over_terms() {
        let words = vec!["binary".to_string(), "search".to_string()];
        let exact = page_confidence(&["binary".into(), "search".into()], &words);
        assert!((exact - 1.0).abs() < 1e-6);
        let typo = page_confidence(&["binary".into(), "serch".into()], &words);
        assert!(typo < 1.0 && typo > 0.9);
    }

    #[test]
    fn suggestions_rank_by_similarity_then_frequency() {
        let corpus = TestCorpus::with(&[
            doc("a", "One", "algorithm design"),
            doc("b", "Two", "algorithm analysis"),
            doc("c", "Three", "algorithms everywhere"),
        ]);
        let suggestions = executor(&corpus).suggest(&["algoritm".into()]).unwrap();

        let words: Vec<_> = suggestions.iter().map(|s| s.suggestion.as_str()).collect();
        assert_eq!(words, vec!["algorithm", "algorithms"]);
        assert_eq!(suggestions[0].frequency, 2);
        assert!(suggestions.iter().all(|s| s.similarity >= 0.8));
    }

    #[test]
    fn the_term_itself_is_not_a_suggestion() {
        let corpus = TestCorpus::with(&[doc("a", "One", "algorithm")]);
        assert!(executor(&corpus)
            .suggest(&["algorithm".into()])
            .unwrap()
            .is_empty());
    }
}
