//! Turning files into [`DocumentContent`].
//!
//! Plain text and Markdown are read directly. Other formats need an
//! [`Extractor`] registered for them; without one their files fail with
//! [`Error::DocumentProcessing`].

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
};

use chrono::{DateTime, Utc};

use crate::{
    document::{DocumentContent, FileType, PageContent},
    error::{Error, Result},
};

pub trait Extractor: Send + Sync {
    fn extract(&self, path: &Path, file_type: FileType) -> Result<DocumentContent>;
}

/// Reads UTF-8 text files as a single page numbered 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, path: &Path, file_type: FileType) -> Result<DocumentContent> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::DocumentProcessing {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
        })?;
        let metadata = std::fs::metadata(path)?;
        let modified: DateTime<Utc> = metadata
            .modified()
            .map(DateTime::from)
            .unwrap_or_else(|_| Utc::now());
        let created: DateTime<Utc> =
            metadata.created().map(DateTime::from).unwrap_or(modified);

        Ok(DocumentContent {
            path: path.to_path_buf(),
            title: extract_title(&text, path),
            file_type,
            pages: vec![PageContent::new(0, text)],
            metadata: BTreeMap::new(),
            size: metadata.len(),
            created: created.min(modified),
            modified,
        })
    }
}

/// Dispatches extraction by file type.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<FileType, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    /// Plain text and Markdown only.
    pub fn new() -> Self {
        let plain: Arc<dyn Extractor> = Arc::new(PlainTextExtractor);
        let mut extractors = HashMap::new();
        extractors.insert(FileType::Txt, Arc::clone(&plain));
        extractors.insert(FileType::Markdown, plain);
        Self { extractors }
    }

    pub fn register(&mut self, file_type: FileType, extractor: Arc<dyn Extractor>) {
        self.extractors.insert(file_type, extractor);
    }

    pub fn supports(&self, file_type: FileType) -> bool {
        self.extractors.contains_key(&file_type)
    }

    pub fn extract(&self, path: &Path) -> Result<DocumentContent> {
        let file_type =
            FileType::from_path(path).ok_or_else(|| Error::DocumentProcessing {
                path: path.display().to_string(),
                reason: "unsupported file type".into(),
            })?;
        let extractor =
            self.extractors
                .get(&file_type)
                .ok_or_else(|| Error::DocumentProcessing {
                    path: path.display().to_string(),
                    reason: format!("no extractor registered for {file_type}"),
                })?;
        extractor.extract(path, file_type)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExtractorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.extractors.keys().collect();
        types.sort();
        f.debug_struct("ExtractorRegistry")
            .field("types", &types)
            .finish()
    }
}

/// Extract a title from file content.
///
/// Looks for the first markdown heading (line starting with `# `).
/// Falls back to the filename without extension.
fn extract_title(content: &str, file_path: &Path) -> String {
    content
        .lines()
        .filter_map(|line| line.trim().strip_prefix("# "))
        .map(str::trim)
        .find(|heading| !heading.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            file_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("untitled")
                .to_string()
        })
}
