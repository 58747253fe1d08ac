//! Validated runtime configuration.
//!
//! Every field has a default so an empty settings table yields a working
//! setup. Persisted overrides live in the `settings` table of [`ConfigDb`]
//! under `config.<section>.<field>` keys with JSON-encoded values.

use serde::{Deserialize, Serialize};

use crate::{
    config_db::ConfigDb,
    document::FileType,
    error::{Error, Result},
};

pub const MODEL_ENV_VAR: &str = "DOCSIFT_MODEL";

/// Settings key prefix for configuration overrides.
pub const SETTINGS_PREFIX: &str = "config.";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchSettings,
    pub indexing: IndexingSettings,
    pub cache: CacheSettings,
    pub topics: TopicSettings,
    pub embedding: EmbeddingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchSettings {
    pub enable_exact: bool,
    pub enable_fuzzy: bool,
    /// Global switch for embedding-based retrieval and indexing.
    pub enable_semantic: bool,
    pub fuzzy_max_edit_distance: u8,
    pub fuzzy_confidence_floor: f32,
    pub spelling_similarity_floor: f32,
    pub semantic_similarity_threshold: f32,
    pub strategy_timeout_ms: u64,
    /// Upper bound on candidates requested from the store per strategy.
    pub candidate_limit: usize,
    pub max_suggestions: usize,
    pub snippet_chars: usize,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            enable_exact: true,
            enable_fuzzy: true,
            enable_semantic: true,
            fuzzy_max_edit_distance: 2,
            fuzzy_confidence_floor: 0.8,
            spelling_similarity_floor: 0.8,
            semantic_similarity_threshold: 0.7,
            strategy_timeout_ms: 2_000,
            candidate_limit: 200,
            max_suggestions: 10,
            snippet_chars: crate::text_util::DEFAULT_SNIPPET_MAX_CHARS,
            default_page_size: 20,
            max_page_size: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingSettings {
    /// Number of texts per embedding request.
    pub batch_size: usize,
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Timeout for a single write issued through the orchestrator.
    pub operation_timeout_ms: u64,
    pub supported_file_types: Vec<FileType>,
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            chunk_size: crate::chunking::DEFAULT_CHUNK_SIZE,
            chunk_overlap: crate::chunking::DEFAULT_CHUNK_OVERLAP,
            max_retries: 3,
            retry_backoff_ms: 100,
            operation_timeout_ms: 120_000,
            supported_file_types: FileType::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub ttl_secs: u64,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicSettings {
    pub enabled: bool,
    pub max_depth: usize,
    pub branching_factor: usize,
    pub min_cluster_size: usize,
    pub max_iterations: usize,
    /// Corpora larger than this are clustered in parallel partitions.
    pub partition_size: usize,
    pub label_terms: usize,
    pub regenerate_after_bulk: bool,
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 3,
            branching_factor: 4,
            min_cluster_size: 2,
            max_iterations: 25,
            partition_size: 2_000,
            label_terms: 2,
            regenerate_after_bulk: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// ColBERT checkpoints through pylate-rs, mean-pooled to one vector.
    Colbert,
    /// Deterministic feature hashing; no model download.
    Hashed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    /// Model used when the registry has no persisted current model.
    pub model: String,
    /// Output dimension of the hashed backend.
    pub hashed_dimension: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Colbert,
            model: crate::embedding::colbert::DEFAULT_MODEL_ID.to_string(),
            hashed_dimension: crate::embedding::hashed::DEFAULT_DIMENSION,
        }
    }
}

impl Config {
    /// Defaults overlaid with persisted overrides and `DOCSIFT_MODEL`.
    pub fn load(config_db: &ConfigDb) -> Result<Self> {
        let mut value = serde_json::to_value(Config::default())?;

        for (key, raw) in config_db.list_settings()? {
            let Some(path) = key.strip_prefix(SETTINGS_PREFIX) else {
                continue;
            };
            set_path(&mut value, path, parse_value(&raw))?;
        }

        let mut config: Config = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid settings: {e}")))?;

        if let Ok(model) = std::env::var(MODEL_ENV_VAR)
            && !model.trim().is_empty()
        {
            config.embedding.model = model;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate and persist a single override such as `search.enable_fuzzy`.
    pub fn set(config_db: &ConfigDb, key: &str, raw: &str) -> Result<Config> {
        let mut value = serde_json::to_value(Config::load(config_db)?)?;
        set_path(&mut value, key, parse_value(raw))?;
        let config: Config = serde_json::from_value(value)
            .map_err(|e| Error::Config(format!("invalid value for {key}: {e}")))?;
        config.validate()?;

        config_db.set_setting(&format!("{SETTINGS_PREFIX}{key}"), raw)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.search;
        check_unit("search.fuzzy_confidence_floor", s.fuzzy_confidence_floor)?;
        check_unit(
            "search.spelling_similarity_floor",
            s.spelling_similarity_floor,
        )?;
        check_unit(
            "search.semantic_similarity_threshold",
            s.semantic_similarity_threshold,
        )?;
        if s.strategy_timeout_ms == 0 {
            return Err(Error::Config(
                "search.strategy_timeout_ms must be positive".into(),
            ));
        }
        if s.candidate_limit == 0 || s.max_page_size == 0 {
            return Err(Error::Config(
                "search limits must be positive".into(),
            ));
        }
        if s.default_page_size == 0 || s.default_page_size > s.max_page_size {
            return Err(Error::Config(format!(
                "search.default_page_size must be between 1 and {}",
                s.max_page_size
            )));
        }

        let i = &self.indexing;
        if i.batch_size == 0 || i.chunk_size == 0 {
            return Err(Error::Config(
                "indexing.batch_size and indexing.chunk_size must be positive"
                    .into(),
            ));
        }
        if i.chunk_overlap >= i.chunk_size {
            return Err(Error::Config(
                "indexing.chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if i.max_retries == 0 {
            return Err(Error::Config(
                "indexing.max_retries must be at least 1".into(),
            ));
        }

        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be positive".into()));
        }

        let t = &self.topics;
        if !(1..=8).contains(&t.max_depth) {
            return Err(Error::Config(
                "topics.max_depth must be between 1 and 8".into(),
            ));
        }
        if t.branching_factor < 2 || t.min_cluster_size == 0 {
            return Err(Error::Config(
                "topics.branching_factor must be >= 2 and min_cluster_size >= 1"
                    .into(),
            ));
        }
        if t.max_iterations == 0 || t.partition_size < t.branching_factor {
            return Err(Error::Config(
                "topics.max_iterations and topics.partition_size are too small"
                    .into(),
            ));
        }

        if self.embedding.model.trim().is_empty() {
            return Err(Error::Config("embedding.model is empty".into()));
        }
        if self.embedding.hashed_dimension == 0 {
            return Err(Error::Config(
                "embedding.hashed_dimension must be positive".into(),
            ));
        }

        Ok(())
    }
}

fn check_unit(name: &str, value: f32) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!("{name} must be within [0, 1], got {value}")))
    }
}

/// Interpret a raw setting as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn set_path(
    root: &mut serde_json::Value,
    path: &str,
    value: serde_json::Value,
) -> Result<()> {
    let mut current = root;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let object = current.as_object_mut().ok_or_else(|| {
            Error::Config(format!("unknown setting: {path}"))
        })?;
        let slot = object
            .get_mut(segment)
            .ok_or_else(|| Error::Config(format!("unknown setting: {path}")))?;
        if segments.peek().is_none() {
            *slot = value;
            return Ok(());
        }
        current = slot;
    }
    Err(Error::Config(format!("unknown setting: {path}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.search.fuzzy_max_edit_distance, 2);
        assert_eq!(config.search.fuzzy_confidence_floor, 0.8);
        assert_eq!(config.search.semantic_similarity_threshold, 0.7);
        assert_eq!(config.indexing.batch_size, 100);
        assert_eq!(config.topics.max_depth, 3);
    }

    #[test]
    fn overrides_are_applied() {
        let (_tmp, db) = test_db();
        db.set_setting("config.search.enable_fuzzy", "false").unwrap();
        db.set_setting("config.cache.ttl_secs", "60").unwrap();
        db.set_setting("unrelated", "ignored").unwrap();

        let config = Config::load(&db).unwrap();
        assert!(!config.search.enable_fuzzy);
        assert_eq!(config.cache.ttl_secs, 60);
    }

    #[test]
    fn set_validates_before_persisting() {
        let (_tmp, db) = test_db();
        let err = Config::set(&db, "search.fuzzy_confidence_floor", "1.5");
        assert!(matches!(err, Err(Error::Config(_))));
        assert!(
            db.get_setting("config.search.fuzzy_confidence_floor")
                .unwrap()
                .is_none()
        );

        let config = Config::set(&db, "topics.max_depth", "2").unwrap();
        assert_eq!(config.topics.max_depth, 2);
        assert_eq!(Config::load(&db).unwrap().topics.max_depth, 2);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_tmp, db) = test_db();
        assert!(Config::set(&db, "search.nope", "1").is_err());
        assert!(Config::set(&db, "search.enable_fuzzy.deeper", "1").is_err());
    }

    #[test]
    fn string_values_do_not_need_quotes() {
        let (_tmp, db) = test_db();
        let config = Config::set(&db, "embedding.backend", "hashed").unwrap();
        assert_eq!(config.embedding.backend, EmbeddingBackend::Hashed);
    }

    #[test]
    fn rejects_bad_topic_depth() {
        let mut config = Config::default();
        config.topics.max_depth = 0;
        assert!(config.validate().is_err());
    }
}
