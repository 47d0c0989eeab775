pub mod builder;
pub mod error;
pub mod index;
pub mod query;
pub mod store;
pub mod tokenizer;

pub use builder::{build_index, BuildOptions, IndexBuilder};
pub use error::{BuildError, QueryError, StorageError};
pub use index::{DocId, DocMeta, Document, Posting, TermEntry, TermStats};
pub use query::{QueryOptions, QueryProcessor, ResultItem};
pub use store::{IndexInfo, IndexPaths, IndexReader, Manifest, PostingsStore};
pub use tokenizer::{Analyzer, AnalyzerConfig, Normalizer};
