use std::path::PathBuf;

use crate::{model::MatchType, query::QuerySyntaxError};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("database storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("database transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("database table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("database commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("database open error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("text index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("query syntax error: {0}")]
    QuerySyntax(#[from] QuerySyntaxError),

    #[error("{strategy} strategy timed out after {timeout_ms}ms")]
    StrategyTimeout {
        strategy: MatchType,
        timeout_ms: u64,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("failed to process document {path}: {reason}")]
    DocumentProcessing { path: String, reason: String },

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("re-encoding failed for document {document_id}: {reason}")]
    ReEncoding { document_id: String, reason: String },

    #[error("re-encoding to '{pending}' is already in progress")]
    ReEncodingInProgress { pending: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("data directory does not exist and could not be created: {0}")]
    DataDir(PathBuf),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ServiceUnavailable(_) | Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(Error::ServiceUnavailable("down".into()).is_transient());
        assert!(
            Error::Timeout {
                operation: "embed",
                timeout_ms: 10
            }
            .is_transient()
        );
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Config("bad".into()).is_transient());
    }

    #[test]
    fn messages_name_the_strategy() {
        let err = Error::StrategyTimeout {
            strategy: MatchType::Fuzzy,
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "fuzzy strategy timed out after 500ms");
    }
}
