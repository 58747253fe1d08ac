use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use super::{IndexRecord, ModelVector};
use crate::{
    document::{DocumentInfo, PageContent},
    error::Result,
};

/// Document metadata as JSON, keyed by document id.
const DOCUMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("documents");

/// Page text keyed by (document id, page number).
const PAGES: TableDefinition<(&str, u32), &str> = TableDefinition::new("pages");

/// Document vectors keyed by (document id, model tag).
const VECTORS: TableDefinition<(&str, &str), &[u8]> =
    TableDefinition::new("vectors");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Durable records, pages and vectors for every indexed document.
///
/// Binary format per vector entry:
/// - 4 bytes: dimension D (u32 LE)
/// - D * 4 bytes: f32 values
pub struct RecordDb {
    db: Database,
}

impl RecordDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(PAGES)?;
        txn.open_table(VECTORS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Replace records, pages and vectors in one transaction.
    ///
    /// Vectors under tags neither carried by the record nor listed in
    /// `retain_models` are dropped.
    pub fn put_records(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut pages = txn.open_table(PAGES)?;
            let mut vectors = txn.open_table(VECTORS)?;

            for record in records {
                let id = record.info.id.as_str();
                let json = serde_json::to_vec(&record.info)?;
                documents.insert(id, json.as_slice())?;

                let old_pages: Vec<u32> = pages
                    .range((id, 0u32)..=(id, u32::MAX))?
                    .map(|entry| entry.map(|(k, _)| k.value().1))
                    .collect::<std::result::Result<_, _>>()?;
                for page in old_pages {
                    pages.remove((id, page))?;
                }
                for page in &record.pages {
                    pages.insert((id, page.page_number), page.text.as_str())?;
                }

                let stale: Vec<String> = models_of(&vectors, id)?
                    .into_iter()
                    .filter(|model| {
                        !record.vectors.iter().any(|v| &v.model == model)
                            && !record.retain_models.contains(model)
                    })
                    .collect();
                for model in &stale {
                    vectors.remove((id, model.as_str()))?;
                }
                for entry in &record.vectors {
                    write_vector(
                        &mut vectors,
                        id,
                        &entry.model,
                        &entry.vector,
                    )?;
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove a document with its pages and vectors.
    pub fn remove(&self, document_id: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut pages = txn.open_table(PAGES)?;
            let mut vectors = txn.open_table(VECTORS)?;

            let removed = documents.remove(document_id)?.is_some();

            let old_pages: Vec<u32> = pages
                .range((document_id, 0u32)..=(document_id, u32::MAX))?
                .map(|entry| entry.map(|(k, _)| k.value().1))
                .collect::<std::result::Result<_, _>>()?;
            for page in old_pages {
                pages.remove((document_id, page))?;
            }
            for model in models_of(&vectors, document_id)? {
                vectors.remove((document_id, model.as_str()))?;
            }
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn get(&self, document_id: &str) -> Result<Option<DocumentInfo>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(document_id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Load several records in one read transaction. Missing ids are absent.
    pub fn get_many(
        &self,
        document_ids: &[String],
    ) -> Result<HashMap<String, DocumentInfo>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut out = HashMap::with_capacity(document_ids.len());
        for id in document_ids {
            if out.contains_key(id) {
                continue;
            }
            if let Some(guard) = table.get(id.as_str())? {
                let info: DocumentInfo = serde_json::from_slice(guard.value())?;
                out.insert(id.clone(), info);
            }
        }
        Ok(out)
    }

    pub fn list(&self) -> Result<Vec<DocumentInfo>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        Ok(result)
    }

    pub fn count(&self) -> Result<usize> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.len()? as usize)
    }

    pub fn pages(&self, document_id: &str) -> Result<Vec<PageContent>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGES)?;
        let mut result = Vec::new();
        for entry in table.range((document_id, 0u32)..=(document_id, u32::MAX))? {
            let (k, v) = entry?;
            result.push(PageContent::new(k.value().1, v.value()));
        }
        Ok(result)
    }

    pub fn page(&self, document_id: &str, page: u32) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(PAGES)?;
        Ok(table.get((document_id, page))?.map(|v| v.value().to_string()))
    }

    /// Write vectors without touching other tags of the same documents.
    pub fn put_vectors(&self, entries: &[(String, ModelVector)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VECTORS)?;
            for (id, entry) in entries {
                write_vector(&mut table, id, &entry.model, &entry.vector)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn vector(
        &self,
        document_id: &str,
        model: &str,
    ) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        Ok(table
            .get((document_id, model))?
            .and_then(|guard| decode_vector(guard.value())))
    }

    pub fn has_vector(&self, document_id: &str, model: &str) -> Result<bool> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        Ok(table.get((document_id, model))?.is_some())
    }

    /// Every vector stored under `model`, by document id.
    pub fn vectors_for_model(
        &self,
        model: &str,
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VECTORS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (id, tag) = k.value();
            if tag != model {
                continue;
            }
            if let Some(vector) = decode_vector(v.value()) {
                result.push((id.to_string(), vector));
            }
        }
        Ok(result)
    }

    /// Remove vectors under `model` for every document not in `keep`.
    pub fn remove_model_vectors(
        &self,
        model: &str,
        keep: &HashSet<String>,
    ) -> Result<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(VECTORS)?;
            let mut doomed = Vec::new();
            for entry in table.iter()? {
                let (k, _) = entry?;
                let (id, tag) = k.value();
                if tag == model && !keep.contains(id) {
                    doomed.push(id.to_string());
                }
            }
            for id in &doomed {
                table.remove((id.as_str(), model))?;
            }
            doomed.len()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Rewrite the topic path of every record in one transaction.
    pub fn set_topic_paths(
        &self,
        assignments: &BTreeMap<String, String>,
    ) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            let mut updated = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                let mut info: DocumentInfo = serde_json::from_slice(v.value())?;
                let topic = assignments.get(k.value()).cloned();
                if info.topic_path != topic {
                    info.topic_path = topic;
                    updated.push(info);
                }
            }
            for info in updated {
                let json = serde_json::to_vec(&info)?;
                table.insert(info.id.as_str(), json.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }
}

impl std::fmt::Debug for RecordDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordDb").finish_non_exhaustive()
    }
}

fn models_of<T>(table: &T, document_id: &str) -> Result<Vec<String>>
where
    T: ReadableTable<(&'static str, &'static str), &'static [u8]>,
{
    let mut models = Vec::new();
    for entry in table.range((document_id, "")..)? {
        let (k, _) = entry?;
        let (id, model) = k.value();
        if id != document_id {
            break;
        }
        models.push(model.to_string());
    }
    Ok(models)
}

fn write_vector(
    table: &mut redb::Table<'_, (&'static str, &'static str), &'static [u8]>,
    document_id: &str,
    model: &str,
    vector: &[f32],
) -> Result<()> {
    let byte_len = HEADER_SIZE + std::mem::size_of_val(vector);
    let mut guard = table.insert_reserve((document_id, model), byte_len)?;
    let dest = guard.as_mut();
    dest[0..HEADER_SIZE].copy_from_slice(&(vector.len() as u32).to_le_bytes());
    dest[HEADER_SIZE..].copy_from_slice(bytemuck::cast_slice(vector));
    Ok(())
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let data = &bytes[HEADER_SIZE..];
    if data.len() != dimension * 4 {
        return None;
    }
    // redb gives no alignment guarantee for values
    Some(match bytemuck::try_cast_slice::<u8, f32>(data) {
        Ok(floats) => floats.to_vec(),
        Err(_) => data
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    })
}
