//! docsift - a local document search and indexing engine.
//!
//! docsift answers queries by running three retrieval strategies side by
//! side and merging what they find: boolean keyword matching over a
//! [Tantivy](https://github.com/quickwit-oss/tantivy) index, typo-tolerant
//! fuzzy matching, and embedding similarity. Documents can additionally be
//! grouped into a hierarchy of topics, and the embedding model can be
//! swapped through a background re-encoding job without downtime.
//!
//! # Quick start
//!
//! ```no_run
//! use docsift::{DataDir, SearchOrchestrator};
//!
//! # async fn run() -> docsift::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let orchestrator = SearchOrchestrator::open(&data_dir)?;
//!
//! orchestrator.sync_directory("notes".as_ref()).await?;
//!
//! let options = orchestrator.default_options();
//! let results = orchestrator.search("rust AND async", &options).await?;
//! for r in &results.results {
//!     println!("{} p{} ({:.3})", r.path, r.page_number, r.relevance_score);
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod chunking;
pub mod config;
pub mod config_db;
pub mod data_dir;
pub mod doc_id;
pub mod document;
pub mod embedding;
pub mod error;
pub mod events;
pub mod extract;
pub mod indexer;
pub mod merge;
pub mod model;
pub mod model_registry;
pub mod orchestrator;
pub mod query;
pub mod reencode;
pub mod runtime;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod text_util;
pub mod topics;
pub mod walker;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use doc_id::DocumentId;
pub use document::{ChangeEvent, DocumentContent, FileType};
pub use error::{Error, Result};
pub use model::{MatchType, SearchOptions, SearchResult, SearchResults};
pub use orchestrator::{IndexStatus, SearchOrchestrator, SyncReport};
pub use store::{IndexStore, LocalStore};
pub use topics::TopicTree;
