//! Persistent postings store backed by sled.
//!
//! Every build writes into a fresh generation of trees (`postings.<gen>`,
//! `docs.<gen>`, plus a `staging.<gen>` scratch tree). The build becomes
//! visible only when the manifest in the default tree is overwritten with the
//! new generation number, which is a single-key atomic write. Trees that do
//! not belong to the current generation are left over from replaced or failed
//! builds and get dropped on open and when the next build starts, except for
//! replaced generations that an `IndexReader` still pins.

use crate::error::{BuildError, QueryError, StorageError};
use crate::index::{DocId, DocMeta, Posting, TermEntry, TermStats};
use crate::tokenizer::AnalyzerConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use time::format_description::well_known::Rfc3339;

const MANIFEST_KEY: &[u8] = b"manifest";
const FORMAT_VERSION: u32 = 1;

const POSTINGS_PREFIX: &str = "postings.";
const DOCS_PREFIX: &str = "docs.";
const STAGING_PREFIX: &str = "staging.";

/// Describes the committed index. Stored as JSON under the `manifest` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub frequency_threshold: u32,
    pub fulltext: bool,
    pub analyzer: AnalyzerConfig,
    pub term_count: u64,
    pub document_count: u64,
    pub created_at: String,
    pub version: u32,
}

/// Build-time settings recorded in the manifest on commit.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexInfo {
    pub frequency_threshold: u32,
    pub fulltext: bool,
    pub analyzer: AnalyzerConfig,
}

/// Layout of an index data directory.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }
    pub fn store(&self) -> PathBuf { self.root.join("index.sled") }
    /// Default location of the comment archives fed to the builder.
    pub fn archives(&self) -> PathBuf { self.root.join("monthly_data") }
}

struct Snapshot {
    manifest: Manifest,
    postings: sled::Tree,
    docs: sled::Tree,
}

struct Inner {
    db: sled::Db,
    current: RwLock<Option<Arc<Snapshot>>>,
    /// Replaced snapshots; their trees stay until the last reader lets go.
    retired: Mutex<Vec<Weak<Snapshot>>>,
    writing: AtomicBool,
}

/// Handle to an index on disk. Cheap to clone; clones share the same
/// database, snapshot and writer flag.
#[derive(Clone)]
pub struct PostingsStore {
    inner: Arc<Inner>,
}

impl PostingsStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// An in-memory store that is deleted on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let manifest = match db.get(MANIFEST_KEY)? {
            Some(bytes) => Some(serde_json::from_slice::<Manifest>(&bytes)?),
            None => None,
        };
        let current = match manifest {
            Some(manifest) => {
                if manifest.version != FORMAT_VERSION {
                    return Err(StorageError::Corrupt(format!(
                        "unsupported format version {}",
                        manifest.version
                    )));
                }
                Some(Arc::new(open_snapshot(&db, manifest)?))
            }
            None => None,
        };
        let store = Self {
            inner: Arc::new(Inner {
                db,
                current: RwLock::new(current),
                retired: Mutex::new(Vec::new()),
                writing: AtomicBool::new(false),
            }),
        };
        store.collect_stale_generations()?;
        Ok(store)
    }

    pub fn manifest(&self) -> Option<Manifest> {
        self.inner.current.read().as_ref().map(|s| s.manifest.clone())
    }

    /// Pins the currently committed index for a series of consistent reads.
    pub fn reader(&self) -> Result<IndexReader, QueryError> {
        let snapshot = self.inner.current.read().clone();
        snapshot.map(|snapshot| IndexReader { snapshot }).ok_or(QueryError::EmptyIndex)
    }

    pub fn get_postings(&self, term: &str) -> Result<Vec<Posting>, QueryError> {
        self.reader()?.get_postings(term)
    }

    pub fn term_stats(&self, term: &str) -> Result<Option<TermStats>, QueryError> {
        self.reader()?.term_stats(term)
    }

    pub fn get_document_metadata(&self, doc_id: DocId) -> Result<DocMeta, QueryError> {
        self.reader()?.get_document_metadata(doc_id)
    }

    pub fn term_count(&self) -> u64 {
        self.manifest().map_or(0, |m| m.term_count)
    }

    pub fn document_count(&self) -> u64 {
        self.manifest().map_or(0, |m| m.document_count)
    }

    /// Replaces the committed index with the given terms and documents.
    /// Either the whole new index becomes visible or the previous one stays.
    pub fn put_index<T, D>(&self, terms: T, documents: D, info: IndexInfo) -> Result<Manifest, BuildError>
    where
        T: IntoIterator<Item = (String, TermEntry)>,
        D: IntoIterator<Item = (DocId, DocMeta)>,
    {
        let mut txn = self.begin_write()?;
        for (doc_id, meta) in documents {
            txn.insert_document(doc_id, &meta)?;
        }
        for (term, entry) in terms {
            txn.insert_term(&term, &entry)?;
        }
        txn.commit(info)
    }

    /// Starts writing a new generation. Only one writer may exist at a time.
    pub fn begin_write(&self) -> Result<WriteTxn, BuildError> {
        if self
            .inner
            .writing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BuildError::BuildInProgress);
        }
        let opened = (|| -> Result<_, BuildError> {
            self.collect_stale_generations()?;
            let db = &self.inner.db;
            let generation = db.generate_id()? + 1;
            let postings = db.open_tree(tree_name(POSTINGS_PREFIX, generation))?;
            let docs = db.open_tree(tree_name(DOCS_PREFIX, generation))?;
            let staging = db.open_tree(tree_name(STAGING_PREFIX, generation))?;
            Ok((generation, postings, docs, staging))
        })();
        match opened {
            Ok((generation, postings, docs, staging)) => {
                tracing::debug!(generation, "started index generation");
                Ok(WriteTxn {
                    store: self.clone(),
                    generation,
                    postings,
                    docs,
                    staging,
                    terms: 0,
                    documents: 0,
                    committed: false,
                })
            }
            Err(err) => {
                self.inner.writing.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.inner.current.read().as_ref().map(|s| s.manifest.generation)
    }

    fn is_writing(&self) -> bool {
        self.inner.writing.load(Ordering::Acquire)
    }

    /// Generations of replaced snapshots that readers still hold.
    fn pinned_generations(&self) -> HashSet<u64> {
        let mut retired = self.inner.retired.lock();
        retired.retain(|snapshot| snapshot.strong_count() > 0);
        retired.iter().filter_map(Weak::upgrade).map(|s| s.manifest.generation).collect()
    }

    /// Drops every generation tree that is neither committed nor pinned.
    fn collect_stale_generations(&self) -> Result<(), StorageError> {
        let current = self.current_generation();
        let pinned = self.pinned_generations();
        for name in self.inner.db.tree_names() {
            let Ok(name) = std::str::from_utf8(&name) else { continue };
            let Some(generation) = parse_generation(name) else { continue };
            if Some(generation) == current || pinned.contains(&generation) {
                continue;
            }
            tracing::debug!(tree = name, "dropping stale generation tree");
            self.inner.db.drop_tree(name)?;
        }
        Ok(())
    }

    fn drop_generation(&self, generation: u64) {
        for prefix in [POSTINGS_PREFIX, DOCS_PREFIX, STAGING_PREFIX] {
            if let Err(err) = self.inner.db.drop_tree(tree_name(prefix, generation)) {
                tracing::warn!(generation, %err, "failed to drop generation tree");
            }
        }
    }
}

impl std::fmt::Debug for PostingsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostingsStore")
            .field("generation", &self.current_generation())
            .field("writing", &self.is_writing())
            .finish()
    }
}

/// Read-only view of one committed generation.
#[derive(Clone)]
pub struct IndexReader {
    snapshot: Arc<Snapshot>,
}

impl IndexReader {
    pub fn manifest(&self) -> &Manifest {
        &self.snapshot.manifest
    }

    pub fn term_entry(&self, term: &str) -> Result<Option<TermEntry>, QueryError> {
        match self.snapshot.postings.get(term.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Postings for an exact term; empty when the term is not indexed.
    pub fn get_postings(&self, term: &str) -> Result<Vec<Posting>, QueryError> {
        Ok(self.term_entry(term)?.map(|e| e.postings).unwrap_or_default())
    }

    pub fn term_stats(&self, term: &str) -> Result<Option<TermStats>, QueryError> {
        Ok(self.term_entry(term)?.map(|e| e.stats))
    }

    pub fn get_document_metadata(&self, doc_id: DocId) -> Result<DocMeta, QueryError> {
        match self.snapshot.docs.get(doc_id.to_be_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(QueryError::DocumentNotFound(doc_id)),
        }
    }
}

/// An uncommitted generation. Dropping it without `commit` discards
/// everything written so far and leaves the previous index in place.
pub struct WriteTxn {
    store: PostingsStore,
    generation: u64,
    postings: sled::Tree,
    docs: sled::Tree,
    staging: sled::Tree,
    terms: u64,
    documents: u64,
    committed: bool,
}

impl WriteTxn {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Scratch space for spilled build state; dropped on commit.
    pub(crate) fn staging(&self) -> &sled::Tree {
        &self.staging
    }

    /// Fails with `DuplicateDocument` when the id was already written.
    pub fn insert_document(&mut self, doc_id: DocId, meta: &DocMeta) -> Result<(), BuildError> {
        let bytes = bincode::serialize(meta)?;
        if self.docs.insert(doc_id.to_be_bytes(), bytes)?.is_some() {
            return Err(BuildError::DuplicateDocument(doc_id));
        }
        self.documents += 1;
        Ok(())
    }

    pub fn insert_term(&mut self, term: &str, entry: &TermEntry) -> Result<(), BuildError> {
        let bytes = bincode::serialize(entry)?;
        if self.postings.insert(term.as_bytes(), bytes)?.is_none() {
            self.terms += 1;
        }
        Ok(())
    }

    /// Removes documents rejected by `keep`.
    pub fn retain_documents<F>(&mut self, mut keep: F) -> Result<u64, BuildError>
    where
        F: FnMut(DocId) -> bool,
    {
        let mut removed = 0u64;
        let mut batch = sled::Batch::default();
        for key in self.docs.iter().keys() {
            let key = key?;
            if !keep(decode_doc_id(&key)?) {
                batch.remove(key);
                removed += 1;
            }
        }
        self.docs.apply_batch(batch)?;
        self.documents -= removed;
        Ok(removed)
    }

    /// Makes this generation the visible index.
    pub fn commit(mut self, info: IndexInfo) -> Result<Manifest, BuildError> {
        let db = &self.store.inner.db;
        db.drop_tree(tree_name(STAGING_PREFIX, self.generation))?;
        db.flush()?;

        let manifest = Manifest {
            generation: self.generation,
            frequency_threshold: info.frequency_threshold,
            fulltext: info.fulltext,
            analyzer: info.analyzer,
            term_count: self.terms,
            document_count: self.documents,
            created_at: time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
            version: FORMAT_VERSION,
        };
        let encoded = serde_json::to_vec(&manifest).map_err(StorageError::from)?;
        if let Err(err) = publish_manifest(db, encoded, |db| db.flush().map(drop)) {
            // the manifest may still name this generation, so its trees must survive
            if matches!(err, Publish::Dangling(_)) {
                self.committed = true;
            }
            return Err(StorageError::from(err.into_inner()).into());
        }

        let snapshot = Snapshot { manifest: manifest.clone(), postings: self.postings.clone(), docs: self.docs.clone() };
        let previous = self.store.inner.current.write().replace(Arc::new(snapshot));
        if let Some(previous) = previous {
            self.store.inner.retired.lock().push(Arc::downgrade(&previous));
        }
        self.committed = true;
        tracing::info!(
            generation = manifest.generation,
            terms = manifest.term_count,
            documents = manifest.document_count,
            "committed index"
        );
        Ok(manifest)
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if !self.committed {
            tracing::warn!(generation = self.generation, "discarding uncommitted index generation");
            self.store.drop_generation(self.generation);
        }
        self.store.inner.writing.store(false, Ordering::Release);
    }
}

enum Publish {
    /// The manifest is unchanged or was put back to its previous value.
    Unpublished(sled::Error),
    /// The manifest may still name the new generation.
    Dangling(sled::Error),
}

impl Publish {
    fn into_inner(self) -> sled::Error {
        match self {
            Publish::Unpublished(err) | Publish::Dangling(err) => err,
        }
    }
}

/// Writes the manifest and makes it durable. If `flush` fails the previous
/// manifest is restored so the caller can discard the new generation.
fn publish_manifest<F>(db: &sled::Db, encoded: Vec<u8>, flush: F) -> Result<(), Publish>
where
    F: Fn(&sled::Db) -> sled::Result<()>,
{
    let previous = db.insert(MANIFEST_KEY, encoded).map_err(Publish::Unpublished)?;
    let Err(err) = flush(db) else { return Ok(()) };
    let restored = match previous {
        Some(bytes) => db.insert(MANIFEST_KEY, bytes).map(drop),
        None => db.remove(MANIFEST_KEY).map(drop),
    };
    match restored {
        Ok(()) => {
            tracing::warn!(%err, "manifest flush failed, previous index restored");
            Err(Publish::Unpublished(err))
        }
        Err(restore) => {
            tracing::error!(%err, %restore, "manifest flush failed and could not be rolled back");
            Err(Publish::Dangling(err))
        }
    }
}

fn open_snapshot(db: &sled::Db, manifest: Manifest) -> Result<Snapshot, StorageError> {
    let names = db.tree_names();
    for prefix in [POSTINGS_PREFIX, DOCS_PREFIX] {
        let name = tree_name(prefix, manifest.generation);
        if !names.iter().any(|n| n.as_ref() == name.as_bytes()) {
            return Err(StorageError::Corrupt(format!("manifest names missing tree {name}")));
        }
    }
    let postings = db.open_tree(tree_name(POSTINGS_PREFIX, manifest.generation))?;
    let docs = db.open_tree(tree_name(DOCS_PREFIX, manifest.generation))?;
    Ok(Snapshot { manifest, postings, docs })
}

fn tree_name(prefix: &str, generation: u64) -> String {
    format!("{prefix}{generation}")
}

fn parse_generation(name: &str) -> Option<u64> {
    [POSTINGS_PREFIX, DOCS_PREFIX, STAGING_PREFIX]
        .iter()
        .find_map(|prefix| name.strip_prefix(prefix))
        .and_then(|rest| rest.parse().ok())
}

fn decode_doc_id(key: &[u8]) -> Result<DocId, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("document key of length {}", key.len())))?;
    Ok(DocId::from_be_bytes(bytes))
}
