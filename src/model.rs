//! Plain data returned to callers of the orchestrator.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    document::FileType,
    error::{Error, Result},
    query::QuerySyntaxError,
};

/// The retrieval strategy that produced a match.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Semantic,
}

impl MatchType {
    pub const ALL: [MatchType; 3] =
        [MatchType::Exact, MatchType::Fuzzy, MatchType::Semantic];

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Fuzzy => "fuzzy",
            MatchType::Semantic => "semantic",
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A short excerpt of a page with highlighted byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    /// Byte ranges into `text`, sorted and non-overlapping.
    pub highlights: Vec<(usize, usize)>,
    /// Fuzzy match confidence, when the fuzzy strategy produced the snippet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

/// An unranked match produced by a single strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub document_id: String,
    pub page: u32,
    pub score: f32,
    pub snippet: Snippet,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub document_id: String,
    pub title: String,
    pub path: String,
    pub file_type: FileType,
    pub modified: DateTime<Utc>,
    pub page_number: u32,
    pub snippet: Snippet,
    pub relevance_score: f32,
    pub match_types: BTreeSet<MatchType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_path: Option<String>,
}

/// Inclusive range over document modification times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from)
            && self.to.is_none_or(|to| at <= to)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub date_range: Option<DateRange>,
    /// Allow-list; empty means every type.
    #[serde(default)]
    pub file_types: Vec<FileType>,
    #[serde(default)]
    pub min_relevance: Option<f32>,
}

impl SearchFilters {
    /// Whether a document passes the metadata-only filters.
    pub fn admits(&self, file_type: FileType, modified: DateTime<Utc>) -> bool {
        (self.file_types.is_empty() || self.file_types.contains(&file_type))
            && self.date_range.is_none_or(|r| r.contains(modified))
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Relevance,
    Date,
    Name,
}

impl std::str::FromStr for SortKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "relevance" => Ok(SortKey::Relevance),
            "date" => Ok(SortKey::Date),
            "name" => Ok(SortKey::Name),
            other => Err(Error::InvalidOptions(format!(
                "unknown sort key: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchOptions {
    pub enable_exact: bool,
    pub enable_fuzzy: bool,
    pub enable_semantic: bool,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub sort: SortKey,
    /// 1-based page index.
    pub page: usize,
    pub page_size: usize,
    #[serde(default)]
    pub topic_path: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            enable_exact: true,
            enable_fuzzy: true,
            enable_semantic: true,
            filters: SearchFilters::default(),
            sort: SortKey::Relevance,
            page: 1,
            page_size: 20,
            topic_path: None,
        }
    }
}

impl SearchOptions {
    pub fn enabled_strategies(&self) -> Vec<MatchType> {
        MatchType::ALL
            .into_iter()
            .filter(|s| self.is_enabled(*s))
            .collect()
    }

    pub fn is_enabled(&self, strategy: MatchType) -> bool {
        match strategy {
            MatchType::Exact => self.enable_exact,
            MatchType::Fuzzy => self.enable_fuzzy,
            MatchType::Semantic => self.enable_semantic,
        }
    }

    pub fn validate(&self, max_page_size: usize) -> Result<()> {
        if self.page == 0 {
            return Err(Error::InvalidOptions("page starts at 1".into()));
        }
        if self.page_size == 0 || self.page_size > max_page_size {
            return Err(Error::InvalidOptions(format!(
                "page_size must be between 1 and {max_page_size}"
            )));
        }
        if self.enabled_strategies().is_empty() {
            return Err(Error::InvalidOptions(
                "at least one strategy must be enabled".into(),
            ));
        }
        if let Some(min) = self.filters.min_relevance
            && !(0.0..=1.0).contains(&min)
        {
            return Err(Error::InvalidOptions(format!(
                "min_relevance must be within [0, 1], got {min}"
            )));
        }
        if let Some(range) = self.filters.date_range
            && let (Some(from), Some(to)) = (range.from, range.to)
            && from > to
        {
            return Err(Error::InvalidOptions(
                "date range starts after it ends".into(),
            ));
        }
        if let Some(path) = &self.topic_path
            && path.trim_matches('/').is_empty()
        {
            return Err(Error::InvalidOptions("empty topic path".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StrategyStatus {
    Completed,
    TimedOut,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy: MatchType,
    #[serde(flatten)]
    pub status: StrategyStatus,
    pub latency_ms: u64,
    pub candidates: usize,
}

impl StrategyReport {
    /// Whether the strategy was dispatched and did not come back.
    pub fn is_failure(&self) -> bool {
        matches!(
            self.status,
            StrategyStatus::TimedOut | StrategyStatus::Failed(_)
        )
    }
}

/// A vocabulary term proposed for a query term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpellingSuggestion {
    pub original: String,
    pub suggestion: String,
    pub similarity: f32,
    pub frequency: u64,
}

/// An autocomplete candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    pub term: String,
    pub frequency: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub query: String,
    pub results: Vec<SearchResult>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub strategies: Vec<StrategyReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syntax_error: Option<QuerySyntaxError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub spelling_suggestions: Vec<SpellingSuggestion>,
    pub unavailable: bool,
    pub from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_model: Option<String>,
}

impl SearchResults {
    pub fn empty(query: &str, options: &SearchOptions) -> Self {
        Self {
            query: query.to_string(),
            page: options.page,
            page_size: options.page_size,
            ..Self::default()
        }
    }

    pub fn total_pages(&self) -> usize {
        if self.page_size == 0 {
            0
        } else {
            self.total.div_ceil(self.page_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn default_options_are_valid() {
        SearchOptions::default().validate(200).unwrap();
    }

    #[test]
    fn rejects_zero_page_and_oversized_pages() {
        let mut opts = SearchOptions {
            page: 0,
            ..Default::default()
        };
        assert!(matches!(
            opts.validate(200),
            Err(Error::InvalidOptions(_))
        ));

        opts.page = 1;
        opts.page_size = 500;
        assert!(opts.validate(200).is_err());
    }

    #[test]
    fn rejects_all_strategies_disabled() {
        let opts = SearchOptions {
            enable_exact: false,
            enable_fuzzy: false,
            enable_semantic: false,
            ..Default::default()
        };
        assert!(opts.validate(200).is_err());
    }

    #[test]
    fn rejects_inverted_date_range() {
        let from = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let opts = SearchOptions {
            filters: SearchFilters {
                date_range: Some(DateRange {
                    from: Some(from),
                    to: Some(to),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(opts.validate(200).is_err());
    }

    #[test]
    fn date_range_is_inclusive() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let range = DateRange {
            from: Some(at),
            to: Some(at),
        };
        assert!(range.contains(at));
        assert!(!range.contains(at + chrono::Duration::seconds(1)));
    }

    #[test]
    fn filters_admit_by_type() {
        let now = Utc::now();
        let filters = SearchFilters {
            file_types: vec![FileType::Pdf],
            ..Default::default()
        };
        assert!(filters.admits(FileType::Pdf, now));
        assert!(!filters.admits(FileType::Txt, now));
        assert!(SearchFilters::default().admits(FileType::Txt, now));
    }

    #[test]
    fn total_pages_rounds_up() {
        let results = SearchResults {
            total: 41,
            page_size: 20,
            ..Default::default()
        };
        assert_eq!(results.total_pages(), 3);
    }

    #[test]
    fn sort_key_parses() {
        assert_eq!("Date".parse::<SortKey>().unwrap(), SortKey::Date);
        assert!("size".parse::<SortKey>().is_err());
    }
}
