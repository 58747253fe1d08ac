//! Document shapes exchanged with extraction and persisted by the store.

use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Document formats the indexer knows how to route.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Pdf,
    Docx,
    Txt,
    Markdown,
}

impl FileType {
    pub const ALL: [FileType; 4] =
        [FileType::Pdf, FileType::Docx, FileType::Txt, FileType::Markdown];

    /// Resolve a file type from an extension, ignoring case and a leading dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pdf" => Some(FileType::Pdf),
            "docx" => Some(FileType::Docx),
            "txt" | "text" => Some(FileType::Txt),
            "md" | "markdown" => Some(FileType::Markdown),
            _ => None,
        }
    }

    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::Txt => "txt",
            FileType::Markdown => "markdown",
        }
    }

    /// Whether the format has real page boundaries.
    pub fn is_paginated(&self) -> bool {
        matches!(self, FileType::Pdf | FileType::Docx)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileType {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| {
            crate::error::Error::InvalidOptions(format!(
                "unknown file type: {s}"
            ))
        })
    }
}

/// One page of extracted text. Non-paginated formats use page 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageContent {
    pub page_number: u32,
    pub text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PageContent {
    pub fn new(page_number: u32, text: impl Into<String>) -> Self {
        Self {
            page_number,
            text: text.into(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Normalized output of document extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentContent {
    pub path: PathBuf,
    pub title: String,
    pub file_type: FileType,
    pub pages: Vec<PageContent>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DocumentContent {
    /// Build a single-page document, mostly useful for plain text sources.
    pub fn from_text(
        path: impl Into<PathBuf>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let text = text.into();
        let file_type = FileType::from_path(&path).unwrap_or(FileType::Txt);
        let now = Utc::now();
        Self {
            size: text.len() as u64,
            path,
            title: title.into(),
            file_type,
            pages: vec![PageContent::new(0, text)],
            metadata: BTreeMap::new(),
            created: now,
            modified: now,
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn full_text(&self) -> String {
        join_pages(&self.pages)
    }

    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.text.trim().is_empty())
    }

    /// Modification time, never earlier than creation time.
    pub fn effective_modified(&self) -> DateTime<Utc> {
        self.modified.max(self.created)
    }

    /// Hash over the title and every page, used to skip no-op re-indexing.
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.title.as_bytes());
        for page in &self.pages {
            hasher.update(&page.page_number.to_le_bytes());
            hasher.update(page.text.as_bytes());
        }
        hasher.finalize().to_hex().to_string()
    }
}

pub(crate) fn join_pages(pages: &[PageContent]) -> String {
    pages
        .iter()
        .map(|p| p.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Persisted metadata for an indexed document, without its text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub id: String,
    pub path: String,
    pub title: String,
    pub file_type: FileType,
    pub page_count: u32,
    pub first_page: u32,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub content_hash: String,
    #[serde(default)]
    pub topic_path: Option<String>,
}

/// A stored document together with its full text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    #[serde(flatten)]
    pub info: DocumentInfo,
    pub text: String,
}

/// A file-system change observed by some watcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum ChangeEvent {
    Created(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

impl ChangeEvent {
    pub fn path(&self) -> &std::path::Path {
        match self {
            ChangeEvent::Created(p)
            | ChangeEvent::Modified(p)
            | ChangeEvent::Removed(p) => p,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_type_from_extension() {
        assert_eq!(FileType::from_extension("PDF"), Some(FileType::Pdf));
        assert_eq!(FileType::from_extension(".md"), Some(FileType::Markdown));
        assert_eq!(
            FileType::from_extension("markdown"),
            Some(FileType::Markdown)
        );
        assert_eq!(FileType::from_extension("docx"), Some(FileType::Docx));
        assert_eq!(FileType::from_extension("png"), None);
    }

    #[test]
    fn content_hash_tracks_text_and_title() {
        let a = DocumentContent::from_text("a.txt", "A", "hello world");
        let mut b = a.clone();
        assert_eq!(a.content_hash(), b.content_hash());

        b.pages[0].text.push('!');
        assert_ne!(a.content_hash(), b.content_hash());

        let mut c = a.clone();
        c.title = "Other".into();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn hash_ignores_timestamps() {
        let a = DocumentContent::from_text("a.txt", "A", "hello");
        let mut b = a.clone();
        b.modified += chrono::Duration::days(1);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn modified_is_clamped_to_created() {
        let mut doc = DocumentContent::from_text("a.txt", "A", "text");
        doc.modified = doc.created - chrono::Duration::hours(1);
        assert_eq!(doc.effective_modified(), doc.created);
    }

    #[test]
    fn full_text_joins_pages() {
        let mut doc = DocumentContent::from_text("a.pdf", "A", "one");
        doc.pages.push(PageContent::new(2, "two"));
        assert_eq!(doc.full_text(), "one\n\ntwo");
        assert_eq!(doc.page_count(), 2);
        assert_eq!(doc.file_type, FileType::Pdf);
    }

    #[test]
    fn blank_document_has_no_text() {
        let doc = DocumentContent::from_text("a.txt", "A", "   \n ");
        assert!(!doc.has_text());
    }

    #[test]
    fn change_event_json_shape() {
        let ev = ChangeEvent::Removed(PathBuf::from("/tmp/a.md"));
        let json = serde_json::to_string(&ev).unwrap();
        assert_eq!(json, r#"{"kind":"removed","path":"/tmp/a.md"}"#);
    }
}
