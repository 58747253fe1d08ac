use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
    sync::{Mutex, PoisonError},
};

use tantivy::{
    Index,
    IndexReader,
    IndexWriter,
    ReloadPolicy,
    TantivyDocument,
    Term,
    collector::{DocSetCollector, TopDocs},
    doc,
    query::{
        AllQuery,
        BooleanQuery,
        BoostQuery,
        EmptyQuery,
        FuzzyTermQuery,
        Occur,
        PhraseQuery,
        Query,
        TermQuery,
    },
    schema::*,
    tokenizer::{
        LowerCaser,
        RemoveLongFilter,
        SimpleTokenizer,
        Stemmer,
        TextAnalyzer,
        TokenStream,
    },
};

use super::{IndexRecord, TextHit};
use crate::{error::Result, query::BoolExpr};

/// Field names used in the schema.
pub mod fields {
    pub const DOC_ID: &str = "doc_id";
    pub const PAGE: &str = "page";
    pub const TITLE: &str = "title";
    pub const BODY: &str = "body";
    pub const RAW: &str = "raw";
}

const STEM_TOKENIZER: &str = "en_stem";
const RAW_TOKENIZER: &str = "raw_lower";
const TITLE_BOOST: f32 = 2.0;
const WRITER_MEMORY: usize = 50_000_000;

/// Levenshtein automata are only built up to this distance.
pub const MAX_FUZZY_DISTANCE: u8 = 2;

/// Resolved field handles for the schema.
#[derive(Clone, Copy)]
pub struct SchemaFields {
    pub doc_id: Field,
    pub page: Field,
    pub title: Field,
    pub body: Field,
    pub raw: Field,
}

/// Full-text index with one tantivy document per page.
///
/// `title` and `body` go through the stemming analyzer for boolean
/// queries; `raw` keeps lower-cased unstemmed words for fuzzy matching
/// and the suggestion vocabulary. The title is indexed on the first page
/// only so a title match yields one hit per document.
pub struct TextIndex {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SchemaFields,
}

fn build_schema() -> (Schema, SchemaFields) {
    let mut builder = Schema::builder();

    let doc_id = builder.add_text_field(fields::DOC_ID, STRING | STORED);
    let page = builder.add_u64_field(fields::PAGE, STORED);

    let stemmed = TextFieldIndexing::default()
        .set_tokenizer(STEM_TOKENIZER)
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let title = builder.add_text_field(
        fields::TITLE,
        TextOptions::default().set_indexing_options(stemmed.clone()),
    );
    let body = builder.add_text_field(
        fields::BODY,
        TextOptions::default()
            .set_indexing_options(stemmed)
            .set_stored(),
    );

    let raw = builder.add_text_field(
        fields::RAW,
        TextOptions::default().set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer(RAW_TOKENIZER)
                .set_index_option(IndexRecordOption::WithFreqs),
        ),
    );

    let schema = builder.build();
    let fields = SchemaFields {
        doc_id,
        page,
        title,
        body,
        raw,
    };
    (schema, fields)
}

fn stem_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .filter(Stemmer::new(tantivy::tokenizer::Language::English))
        .build()
}

fn raw_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(RemoveLongFilter::limit(40))
        .filter(LowerCaser)
        .build()
}

fn register_tokenizers(index: &Index) {
    index.tokenizers().register(STEM_TOKENIZER, stem_analyzer());
    index.tokenizers().register(RAW_TOKENIZER, raw_analyzer());
}

impl TextIndex {
    /// Open or create the index at the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();

        let mmap_dir = tantivy::directory::MmapDirectory::open(dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?;
        let index = if Index::exists(&mmap_dir)
            .map_err(|e| tantivy::TantivyError::SystemError(e.to_string()))?
        {
            Index::open(mmap_dir)?
        } else {
            Index::create(mmap_dir, schema, tantivy::IndexSettings::default())?
        };
        Self::from_index(index, fields)
    }

    /// Create an in-memory index (for testing).
    pub fn open_in_ram() -> Result<Self> {
        let (schema, fields) = build_schema();
        Self::from_index(Index::create_in_ram(schema), fields)
    }

    fn from_index(index: Index, fields: SchemaFields) -> Result<Self> {
        register_tokenizers(&index);
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let writer = index.writer(WRITER_MEMORY)?;
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    pub fn fields(&self) -> SchemaFields {
        self.fields
    }

    /// Replace every page of the given records and commit.
    pub fn upsert(&self, records: &[IndexRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let f = self.fields;
        let mut writer =
            self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        for record in records {
            let id = record.info.id.as_str();
            writer.delete_term(Term::from_field_text(f.doc_id, id));

            for page in &record.pages {
                let mut document = doc!(
                    f.doc_id => id,
                    f.page => u64::from(page.page_number),
                    f.body => page.text.as_str(),
                    f.raw => page.text.as_str(),
                );
                if page.page_number == record.info.first_page {
                    document.add_text(f.title, &record.info.title);
                    document.add_text(f.raw, &record.info.title);
                }
                writer.add_document(document)?;
            }
        }

        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Delete every page of a document and commit.
    pub fn delete(&self, document_id: &str) -> Result<()> {
        let mut writer =
            self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.delete_term(Term::from_field_text(self.fields.doc_id, document_id));
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// BM25 search for a boolean expression. The title is boosted 2x.
    pub fn boolean_query(
        &self,
        expr: &BoolExpr,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let query = self.translate(expr);
        self.top_hits(query.as_ref(), limit)
    }

    /// Pages with a word within `max_distance` edits of any term.
    pub fn fuzzy_query(
        &self,
        terms: &[String],
        max_distance: u8,
        limit: usize,
    ) -> Result<Vec<TextHit>> {
        let distance = max_distance.min(MAX_FUZZY_DISTANCE);
        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .flat_map(|t| self.analyze(RAW_TOKENIZER, t))
            .map(|token| {
                let term = Term::from_field_text(self.fields.raw, &token);
                let fuzzy: Box<dyn Query> =
                    Box::new(FuzzyTermQuery::new(term, distance, true));
                (Occur::Should, fuzzy)
            })
            .collect();
        if clauses.is_empty() {
            return Ok(Vec::new());
        }
        self.top_hits(&BooleanQuery::new(clauses), limit)
    }

    /// Ids of documents with a page containing any of `terms`.
    pub fn documents_containing(
        &self,
        terms: &[String],
    ) -> Result<HashSet<String>> {
        let clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|t| (Occur::Should, self.term_query(t)))
            .collect();
        if clauses.is_empty() {
            return Ok(HashSet::new());
        }

        let searcher = self.reader.searcher();
        let addresses =
            searcher.search(&BooleanQuery::new(clauses), &DocSetCollector)?;

        let mut ids = HashSet::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            ids.insert(extract_text(&doc, self.fields.doc_id));
        }
        Ok(ids)
    }

    /// Indexed words starting with `prefix`, by descending page frequency.
    pub fn vocabulary(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<(String, u64)>> {
        let prefix = prefix.to_lowercase();
        let searcher = self.reader.searcher();

        let mut frequencies: BTreeMap<String, u64> = BTreeMap::new();
        for segment in searcher.segment_readers() {
            let inverted = segment.inverted_index(self.fields.raw)?;
            let mut stream =
                inverted.terms().range().ge(prefix.as_bytes()).into_stream()?;
            while stream.advance() {
                let key = stream.key();
                if !key.starts_with(prefix.as_bytes()) {
                    break;
                }
                let Ok(word) = std::str::from_utf8(key) else {
                    continue;
                };
                *frequencies.entry(word.to_string()).or_default() +=
                    u64::from(stream.value().doc_freq);
            }
        }

        let mut words: Vec<(String, u64)> = frequencies.into_iter().collect();
        words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        words.truncate(limit);
        Ok(words)
    }

    fn top_hits(&self, query: &dyn Query, limit: usize) -> Result<Vec<TextHit>> {
        let f = self.fields;
        let searcher = self.reader.searcher();
        let top_docs = searcher.search(query, &TopDocs::with_limit(limit.max(1)))?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            hits.push(TextHit {
                document_id: extract_text(&doc, f.doc_id),
                page: u32::try_from(extract_u64(&doc, f.page)).unwrap_or(0),
                score,
                text: extract_text(&doc, f.body),
            });
        }
        Ok(hits)
    }

    fn translate(&self, expr: &BoolExpr) -> Box<dyn Query> {
        match expr {
            BoolExpr::Term(term) => self.term_query(term),
            BoolExpr::Phrase(words) => self.phrase_query(words),
            BoolExpr::And(children) => {
                let mut clauses: Vec<(Occur, Box<dyn Query>)> = children
                    .iter()
                    .map(|child| match child {
                        BoolExpr::Not(inner) => {
                            (Occur::MustNot, self.translate(inner))
                        }
                        other => (Occur::Must, self.translate(other)),
                    })
                    .collect();
                if clauses.iter().all(|(occur, _)| *occur == Occur::MustNot) {
                    clauses.push((Occur::Must, Box::new(AllQuery)));
                }
                Box::new(BooleanQuery::new(clauses))
            }
            BoolExpr::Or(children) => Box::new(BooleanQuery::new(
                children
                    .iter()
                    .map(|child| (Occur::Should, self.translate(child)))
                    .collect(),
            )),
            BoolExpr::Not(inner) => Box::new(BooleanQuery::new(vec![
                (Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
                (Occur::MustNot, self.translate(inner)),
            ])),
        }
    }

    /// Title (boosted) or body match for every stemmed token of `text`.
    fn term_query(&self, text: &str) -> Box<dyn Query> {
        let f = self.fields;
        let tokens = self.analyze(STEM_TOKENIZER, text);
        let mut per_token: Vec<(Occur, Box<dyn Query>)> = tokens
            .iter()
            .map(|token| {
                let title: Box<dyn Query> = Box::new(BoostQuery::new(
                    Box::new(TermQuery::new(
                        Term::from_field_text(f.title, token),
                        IndexRecordOption::WithFreqs,
                    )),
                    TITLE_BOOST,
                ));
                let body: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(f.body, token),
                    IndexRecordOption::WithFreqs,
                ));
                let either: Box<dyn Query> = Box::new(BooleanQuery::new(vec![
                    (Occur::Should, title),
                    (Occur::Should, body),
                ]));
                (Occur::Must, either)
            })
            .collect();

        match per_token.len() {
            0 => Box::new(EmptyQuery),
            1 => per_token.remove(0).1,
            _ => Box::new(BooleanQuery::new(per_token)),
        }
    }

    fn phrase_query(&self, words: &[String]) -> Box<dyn Query> {
        let f = self.fields;
        let tokens = self.analyze(STEM_TOKENIZER, &words.join(" "));
        match tokens.len() {
            0 => Box::new(EmptyQuery),
            1 => self.term_query(&tokens[0]),
            _ => {
                let phrase = |field: Field| -> Box<dyn Query> {
                    Box::new(PhraseQuery::new(
                        tokens
                            .iter()
                            .map(|t| Term::from_field_text(field, t))
                            .collect(),
                    ))
                };
                let title: Box<dyn Query> =
                    Box::new(BoostQuery::new(phrase(f.title), TITLE_BOOST));
                Box::new(BooleanQuery::new(vec![
                    (Occur::Should, title),
                    (Occur::Should, phrase(f.body)),
                ]))
            }
        }
    }

    fn analyze(&self, tokenizer: &str, text: &str) -> Vec<String> {
        let mut analyzer = match tokenizer {
            STEM_TOKENIZER => stem_analyzer(),
            _ => raw_analyzer(),
        };
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        tokens
    }
}

impl std::fmt::Debug for TextIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextIndex").finish_non_exhaustive()
    }
}

fn extract_text(doc: &TantivyDocument, field: Field) -> String {
    doc.get_first(field)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_u64(doc: &TantivyDocument, field: Field) -> u64 {
    doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or(0)
}
