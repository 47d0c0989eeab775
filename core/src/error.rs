use crate::index::DocId;
use thiserror::Error;

pub type BoxedSourceError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the persisted store itself.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),

    #[error("encoding: {0}")]
    Codec(#[from] bincode::Error),

    #[error("manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("corrupt index: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    /// The document source failed before reaching its end.
    #[error("document source failed after {documents} documents: {source}")]
    SourceExhaustion {
        documents: u64,
        #[source]
        source: BoxedSourceError,
    },

    #[error("duplicate document id {0}")]
    DuplicateDocument(DocId),

    #[error("another build is already in progress")]
    BuildInProgress,

    #[error("build aborted after {documents} documents")]
    Aborted { documents: u64 },

    #[error("storage write failed: {0}")]
    StorageWrite(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid parameter {name}: {message}")]
    InvalidParameter { name: &'static str, message: String },

    #[error("no index has been built yet")]
    EmptyIndex,

    #[error("index was built without full text")]
    FullTextUnavailable,

    #[error("document {0} not found")]
    DocumentNotFound(DocId),

    #[error("storage read failed: {0}")]
    Storage(#[from] StorageError),
}

impl From<sled::Error> for BuildError {
    fn from(err: sled::Error) -> Self {
        BuildError::StorageWrite(err.into())
    }
}

impl From<bincode::Error> for BuildError {
    fn from(err: bincode::Error) -> Self {
        BuildError::StorageWrite(err.into())
    }
}

impl From<sled::Error> for QueryError {
    fn from(err: sled::Error) -> Self {
        QueryError::Storage(err.into())
    }
}

impl From<bincode::Error> for QueryError {
    fn from(err: bincode::Error) -> Self {
        QueryError::Storage(err.into())
    }
}
