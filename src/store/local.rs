use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use super::{
    IndexRecord,
    IndexStore,
    ModelVector,
    TextHit,
    VectorHit,
    record_db::RecordDb,
    text_index::TextIndex,
};
use crate::{
    document::{Document, DocumentInfo, PageContent, join_pages},
    embedding,
    error::Result,
    model::SearchFilters,
    query::BoolExpr,
};

/// Extra hits fetched from the text index when filters may discard some.
const FILTER_OVERFETCH: usize = 4;

/// On-disk [`IndexStore`]: redb for records and vectors, tantivy for text.
///
/// Upserts land in redb before the tantivy commit and deletes leave
/// tantivy first, so a text hit without a record is a write in flight
/// and is skipped.
pub struct LocalStore {
    records: RecordDb,
    text: TextIndex,
}

impl LocalStore {
    /// Open or create a store under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let records = RecordDb::open(&dir.join("records.redb"))?;
        let text = TextIndex::open(&dir.join("text"))?;
        Ok(Self { records, text })
    }

    /// Keep hits whose record exists and passes the filters.
    fn admit_hits(
        &self,
        hits: Vec<TextHit>,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let ids: Vec<String> =
            hits.iter().map(|h| h.document_id.clone()).collect();
        let infos = self.records.get_many(&ids)?;
        Ok(hits
            .into_iter()
            .filter(|hit| {
                infos
                    .get(&hit.document_id)
                    .is_some_and(|info| filters.admits(info.file_type, info.modified))
            })
            .take(limit)
            .collect())
    }
}

fn fetch_limit(filters: &SearchFilters, limit: usize) -> usize {
    if filters.file_types.is_empty() && filters.date_range.is_none() {
        limit
    } else {
        limit.saturating_mul(FILTER_OVERFETCH)
    }
}

impl IndexStore for LocalStore {
    fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        self.records.put_records(records)?;
        self.text.upsert(records)
    }

    fn delete(&self, document_id: &str) -> Result<bool> {
        self.text.delete(document_id)?;
        self.records.remove(document_id)
    }

    fn document(&self, document_id: &str) -> Result<Option<DocumentInfo>> {
        self.records.get(document_id)
    }

    fn documents(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, DocumentInfo>> {
        self.records.get_many(document_ids)
    }

    fn list_documents(&self) -> Result<Vec<DocumentInfo>> {
        self.records.list()
    }

    fn load_document(&self, document_id: &str) -> Result<Option<Document>> {
        let Some(info) = self.records.get(document_id)? else {
            return Ok(None);
        };
        let pages = self.records.pages(document_id)?;
        Ok(Some(Document {
            info,
            text: join_pages(&pages),
        }))
    }

    fn pages(&self, document_id: &str) -> Result<Vec<PageContent>> {
        self.records.pages(document_id)
    }

    fn page_text(&self, document_id: &str, page: u32) -> Result<Option<String>> {
        self.records.page(document_id, page)
    }

    fn document_count(&self) -> Result<usize> {
        self.records.count()
    }

    fn boolean_query(
        &self,
        expr: &BoolExpr,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let hits = self.text.boolean_query(expr, fetch_limit(filters, limit))?;
        self.admit_hits(hits, filters, limit)
    }

    fn fuzzy_query(
        &self,
        terms: &[String],
        max_edit_distance: u8,
        filters: &SearchFilters,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let hits = self.text.fuzzy_query(
            terms,
            max_edit_distance,
            fetch_limit(filters, limit),
        )?;
        self.admit_hits(hits, filters, limit)
    }

    fn knn_query(
        &self,
        vector: &[f32],
        k: usize,
        model: &str,
        filters: &SearchFilters,
        restrict_to: Option<&HashSet<String>>,
    ) -> Result<Vec<VectorHit>> {
        let mut scored: Vec<(String, f32)> = self
            .records
            .vectors_for_model(model)?
            .into_iter()
            .filter(|(id, _)| restrict_to.is_none_or(|allowed| allowed.contains(id)))
            .map(|(id, candidate)| {
                let similarity = embedding::cosine(vector, &candidate);
                (id, similarity)
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let ids: Vec<String> = scored.iter().map(|(id, _)| id.clone()).collect();
        let infos = self.records.get_many(&ids)?;

        let mut hits = Vec::new();
        for (id, similarity) in scored {
            if hits.len() >= k {
                break;
            }
            let Some(info) = infos.get(&id) else {
                continue;
            };
            if !filters.admits(info.file_type, info.modified) {
                continue;
            }
            let text = self
                .records
                .page(&id, info.first_page)?
                .unwrap_or_default();
            hits.push(VectorHit {
                document_id: id,
                page: info.first_page,
                similarity,
                text,
            });
        }
        Ok(hits)
    }

    fn documents_containing(&self, terms: &[String]) -> Result<HashSet<String>> {
        self.text.documents_containing(terms)
    }

    fn vocabulary(&self, prefix: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        self.text.vocabulary(prefix, limit)
    }

    fn put_vectors(&self, entries: &[(String, ModelVector)]) -> Result<()> {
        self.records.put_vectors(entries)
    }

    fn has_vector(&self, document_id: &str, model: &str) -> Result<bool> {
        self.records.has_vector(document_id, model)
    }

    fn vector(&self, document_id: &str, model: &str) -> Result<Option<Vec<f32>>> {
        self.records.vector(document_id, model)
    }

    fn vectors_for_model(&self, model: &str) -> Result<Vec<(String, Vec<f32>)>> {
        self.records.vectors_for_model(model)
    }

    fn remove_model_vectors(
        &self,
        model: &str,
        keep: &HashSet<String>,
    ) -> Result<usize> {
        self.records.remove_model_vectors(model, keep)
    }

    fn set_topic_paths(&self, assignments: &BTreeMap<String, String>) -> Result<()> {
        self.records.set_topic_paths(assignments)
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::{
        document::FileType,
        model::DateRange,
        query,
    };

    fn record(id: &str, file_type: FileType, text: &str, vector: Vec<f32>) -> IndexRecord {
        let now = Utc::now();
        IndexRecord {
            info: DocumentInfo {
                id: id.to_string(),
                path: format!("/docs/{id}"),
                title: id.to_string(),
                file_type,
                page_count: 1,
                first_page: 0,
                size: text.len() as u64,
                created: now,
                modified: now,
                indexed_at: now,
                metadata: Default::default(),
                content_hash: String::new(),
                topic_path: None,
            },
            pages: vec![PageContent::new(0, text)],
            vectors: vec![ModelVector {
                model: "m".into(),
                vector,
            }],
            retain_models: Vec::new(),
        }
    }

    fn store() -> (tempfile::TempDir, LocalStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = LocalStore::open(&tmp.path().join("store")).unwrap();
        store
            .upsert(&[
                record("a", FileType::Txt, "rust ownership rules", vec![1.0, 0.0]),
                record("b", FileType::Markdown, "rust async runtimes", vec![0.8, 0.6]),
                record("c", FileType::Pdf, "baking bread", vec![0.0, 1.0]),
            ])
            .unwrap();
        (tmp, store)
    }

    #[test]
    fn filters_apply_to_text_hits() {
        let (_tmp, store) = store();
        let expr = query::parse("rust").unwrap();

        let all = store
            .boolean_query(&expr, &SearchFilters::default(), 10)
            .unwrap();
        assert_eq!(all.len(), 2);

        let filters = SearchFilters {
            file_types: vec![FileType::Markdown],
            ..Default::default()
        };
        let md = store.boolean_query(&expr, &filters, 10).unwrap();
        assert_eq!(md.len(), 1);
        assert_eq!(md[0].document_id, "b");
    }

    #[test]
    fn knn_orders_by_similarity() {
        let (_tmp, store) = store();
        let hits = store
            .knn_query(&[1.0, 0.0], 2, "m", &SearchFilters::default(), None)
            .unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(hits[0].text, "rust ownership rules");
        assert!((hits[0].similarity - 1.0).abs() < 1e-5);

        let only_c: HashSet<String> = ["c".to_string()].into();
        let hits = store
            .knn_query(&[1.0, 0.0], 5, "m", &SearchFilters::default(), Some(&only_c))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "c");

        assert!(store
            .knn_query(&[1.0, 0.0], 5, "other", &SearchFilters::default(), None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn knn_respects_date_filters() {
        let (_tmp, store) = store();
        let filters = SearchFilters {
            date_range: Some(DateRange {
                from: Some(Utc::now() + Duration::days(1)),
                to: None,
            }),
            ..Default::default()
        };
        assert!(store
            .knn_query(&[1.0, 0.0], 5, "m", &filters, None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_removes_text_and_record() {
        let (_tmp, store) = store();
        assert!(store.delete("a").unwrap());
        assert!(store.document("a").unwrap().is_none());
        assert!(!store.has_vector("a", "m").unwrap());
        assert_eq!(
            store.documents_containing(&["ownership".into()]).unwrap().len(),
            0
        );
        assert_eq!(store.document_count().unwrap(), 2);
    }

    #[test]
    fn load_document_joins_pages() {
        let (_tmp, store) = store();
        let doc = store.load_document("c").unwrap().unwrap();
        assert_eq!(doc.text, "baking bread");
        assert_eq!(doc.info.file_type, FileType::Pdf);
        assert!(store.load_document("zzz").unwrap().is_none());
    }
}
