//! Combining per-strategy candidates into one ranked list.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet},
};

use crate::model::{Candidate, MatchType, SearchResult, Snippet, SortKey};

/// A (document, page) after merging every strategy that found it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedCandidate {
    pub document_id: String,
    pub page: u32,
    pub score: f32,
    pub match_types: BTreeSet<MatchType>,
    pub snippet: Snippet,
}

/// Merge candidate batches keyed by (document, page).
///
/// The merged score is the best score any strategy gave, the snippet comes
/// from that strategy, and a fuzzy confidence survives even when another
/// strategy supplied the snippet. Output is ordered by key.
pub fn merge_candidates(
    batches: Vec<(MatchType, Vec<Candidate>)>,
) -> Vec<MergedCandidate> {
    let mut merged: BTreeMap<(String, u32), MergedCandidate> = BTreeMap::new();

    for (strategy, candidates) in batches {
        for candidate in candidates {
            let score = clamp_score(candidate.score);
            let confidence = candidate.snippet.confidence;
            let key = (candidate.document_id, candidate.page);

            match merged.get_mut(&key) {
                Some(existing) => {
                    existing.match_types.insert(strategy);
                    if score > existing.score {
                        let kept = existing.snippet.confidence;
                        existing.score = score;
                        existing.snippet = candidate.snippet;
                        if existing.snippet.confidence.is_none() {
                            existing.snippet.confidence = kept;
                        }
                    } else if existing.snippet.confidence.is_none() {
                        existing.snippet.confidence = confidence;
                    }
                }
                None => {
                    merged.insert(
                        key.clone(),
                        MergedCandidate {
                            document_id: key.0,
                            page: key.1,
                            score,
                            match_types: BTreeSet::from([strategy]),
                            snippet: candidate.snippet,
                        },
                    );
                }
            }
        }
    }

    merged.into_values().collect()
}

fn clamp_score(score: f32) -> f32 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

/// Order results by `key`, breaking ties by document id then page.
pub fn sort_results(results: &mut [SearchResult], key: SortKey) {
    results.sort_by(|a, b| {
        let primary = match key {
            SortKey::Relevance => b.relevance_score.total_cmp(&a.relevance_score),
            SortKey::Date => b.modified.cmp(&a.modified),
            SortKey::Name => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
        };
        primary.then_with(|| tie_break(a, b))
    });
}

fn tie_break(a: &SearchResult, b: &SearchResult) -> Ordering {
    a.document_id
        .cmp(&b.document_id)
        .then(a.page_number.cmp(&b.page_number))
}

/// The 1-based `page` of `items`. Pages past the end are empty.
pub fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> Vec<T> {
    let start = page.saturating_sub(1).saturating_mul(page_size);
    items.iter().skip(start).take(page_size).cloned().collect()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    use super::*;
    use crate::document::FileType;

    fn candidate(doc: &str, page: u32, score: f32, text: &str) -> Candidate {
        Candidate {
            document_id: doc.to_string(),
            page,
            score,
            snippet: Snippet {
                text: text.to_string(),
                ..Default::default()
            },
        }
    }

    fn result(doc: &str, title: &str, score: f32, day: u32) -> SearchResult {
        SearchResult {
            document_id: doc.to_string(),
            title: title.to_string(),
            path: format!("/{doc}"),
            file_type: FileType::Txt,
            modified: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            page_number: 0,
            snippet: Snippet::default(),
            relevance_score: score,
            match_types: BTreeSet::new(),
            topic_path: None,
        }
    }

    #[test]
    fn union_of_match_types_and_best_snippet() {
        let mut fuzzy = candidate("a", 0, 0.9, "fuzzy");
        fuzzy.snippet.confidence = Some(0.9);
        let merged = merge_candidates(vec![
            (MatchType::Exact, vec![candidate("a", 0, 0.5, "exact")]),
            (MatchType::Fuzzy, vec![fuzzy]),
            (MatchType::Semantic, vec![candidate("a", 0, 0.95, "semantic")]),
        ]);

        assert_eq!(merged.len(), 1);
        let m = &merged[0];
        assert_eq!(m.score, 0.95);
        assert_eq!(m.snippet.text, "semantic");
        assert_eq!(m.snippet.confidence, Some(0.9));
        assert_eq!(m.match_types.len(), 3);
    }

    #[test]
    fn pages_are_distinct_keys() {
        let merged = merge_candidates(vec![(
            MatchType::Exact,
            vec![candidate("a", 1, 0.5, ""), candidate("a", 2, 0.6, "")],
        )]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn sort_by_each_key_with_ties() {
        let mut results = vec![
            result("b", "beta", 0.5, 2),
            result("a", "Alpha", 0.5, 1),
            result("c", "gamma", 0.9, 3),
        ];

        sort_results(&mut results, SortKey::Relevance);
        let ids: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);

        sort_results(&mut results, SortKey::Date);
        let ids: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);

        sort_results(&mut results, SortKey::Name);
        let ids: Vec<_> = results.iter().map(|r| r.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn pagination() {
        let items: Vec<u32> = (0..5).collect();
        assert_eq!(paginate(&items, 1, 2), vec![0, 1]);
        assert_eq!(paginate(&items, 3, 2), vec![4]);
        assert!(paginate(&items, 4, 2).is_empty());
    }

    fn strategy() -> impl Strategy<Value = MatchType> {
        prop_oneof![
            Just(MatchType::Exact),
            Just(MatchType::Fuzzy),
            Just(MatchType::Semantic),
        ]
    }

    proptest! {
        #[test]
        fn merge_has_no_duplicates_and_keeps_max(
            raw in prop::collection::vec(
                (strategy(), 0u8..6, 0u32..3, 0.0f32..=1.0),
                0..40,
            )
        ) {
            let mut batches: BTreeMap<MatchType, Vec<Candidate>> = BTreeMap::new();
            for (s, doc, page, score) in &raw {
                batches
                    .entry(*s)
                    .or_default()
                    .push(candidate(&format!("d{doc}"), *page, *score, ""));
            }
            let merged = merge_candidates(batches.into_iter().collect());

            let keys: BTreeSet<_> = merged
                .iter()
                .map(|m| (m.document_id.clone(), m.page))
                .collect();
            prop_assert_eq!(keys.len(), merged.len());

            for m in &merged {
                let inputs: Vec<_> = raw
                    .iter()
                    .filter(|(_, d, p, _)| format!("d{d}") == m.document_id && *p == m.page)
                    .collect();
                let best = inputs.iter().map(|(_, _, _, s)| *s).fold(0.0f32, f32::max);
                prop_assert_eq!(m.score, best);
                let types: BTreeSet<_> = inputs.iter().map(|(s, ..)| *s).collect();
                prop_assert_eq!(&m.match_types, &types);
            }
        }
    }
}
