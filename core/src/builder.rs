//! One-pass index construction.
//!
//! Only per-term statistics are required to fit in memory. Postings are
//! buffered per term and spilled to the generation's staging tree once the
//! buffer exceeds `BuildOptions::spill_postings`; staged keys are
//! `len(term) | term | doc_id` (big-endian) so a prefix scan returns one
//! term's postings in doc id order.

use crate::error::{BoxedSourceError, BuildError, StorageError};
use crate::index::{DocId, DocMeta, Document, Posting, TermEntry, TermStats};
use crate::store::{IndexInfo, Manifest, PostingsStore, WriteTxn};
use crate::tokenizer::AnalyzerConfig;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const DEFAULT_FREQUENCY_THRESHOLD: u32 = 5;
pub const DEFAULT_SPILL_POSTINGS: usize = 1 << 22;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Minimum document frequency for a term to be kept.
    pub frequency_threshold: u32,
    /// Persist each document's raw text.
    pub fulltext: bool,
    /// Normalization used by the document source, recorded for query time.
    pub analyzer: AnalyzerConfig,
    pub spill_postings: usize,
    /// Log progress every N documents; 0 disables it.
    pub progress_every: u64,
    pub abort: Option<Arc<AtomicBool>>,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            frequency_threshold: DEFAULT_FREQUENCY_THRESHOLD,
            fulltext: false,
            analyzer: AnalyzerConfig::default(),
            spill_postings: DEFAULT_SPILL_POSTINGS,
            progress_every: 0,
            abort: None,
        }
    }
}

impl BuildOptions {
    pub fn with_threshold(frequency_threshold: u32) -> Self {
        Self { frequency_threshold, ..Self::default() }
    }
}

#[derive(Debug, Default)]
struct TermAccumulator {
    stats: TermStats,
    last_doc: Option<DocId>,
    buffered: Vec<Posting>,
    spilled: bool,
}

/// Builds an index with default options and the given threshold.
pub fn build_index<I, E>(store: &PostingsStore, documents: I, frequency_threshold: u32) -> Result<Manifest, BuildError>
where
    I: IntoIterator<Item = Result<Document, E>>,
    E: Into<BoxedSourceError>,
{
    IndexBuilder::new(store, BuildOptions::with_threshold(frequency_threshold)).build(documents)
}

pub struct IndexBuilder<'a> {
    store: &'a PostingsStore,
    options: BuildOptions,
    terms: HashMap<String, TermAccumulator>,
    buffered: usize,
    documents: u64,
}

impl<'a> IndexBuilder<'a> {
    pub fn new(store: &'a PostingsStore, options: BuildOptions) -> Self {
        Self { store, options, terms: HashMap::new(), buffered: 0, documents: 0 }
    }

    /// Consumes the document stream and commits the pruned index. On any
    /// error the store keeps serving whatever index it had before.
    pub fn build<I, E>(mut self, documents: I) -> Result<Manifest, BuildError>
    where
        I: IntoIterator<Item = Result<Document, E>>,
        E: Into<BoxedSourceError>,
    {
        let mut txn = self.store.begin_write()?;
        tracing::info!(
            threshold = self.options.frequency_threshold,
            fulltext = self.options.fulltext,
            generation = txn.generation(),
            "building index"
        );

        for item in documents {
            if self.aborted() {
                return Err(BuildError::Aborted { documents: self.documents });
            }
            let document = item
                .map_err(|e| BuildError::SourceExhaustion { documents: self.documents, source: e.into() })?;
            self.add_document(&mut txn, document)?;
            if self.buffered >= self.options.spill_postings {
                self.spill(&txn)?;
            }
        }
        if self.aborted() {
            return Err(BuildError::Aborted { documents: self.documents });
        }

        self.finish(txn)
    }

    fn aborted(&self) -> bool {
        self.options.abort.as_ref().is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn add_document(&mut self, txn: &mut WriteTxn, document: Document) -> Result<(), BuildError> {
        let Document { id, name, tokens, raw_text } = document;
        let text = if self.options.fulltext { raw_text } else { None };
        txn.insert_document(id, &DocMeta { name, text })?;

        for token in tokens {
            let acc = self.terms.entry(token).or_default();
            acc.stats.collection_frequency += 1;
            if acc.last_doc != Some(id) {
                acc.last_doc = Some(id);
                acc.stats.document_frequency += 1;
                acc.buffered.push(Posting { doc_id: id, term_frequency: 0 });
                self.buffered += 1;
            }
            // the posting for this document is always the last buffered one
            if let Some(posting) = acc.buffered.last_mut() {
                posting.term_frequency += 1;
            }
        }

        self.documents += 1;
        if self.options.progress_every > 0 && self.documents % self.options.progress_every == 0 {
            tracing::info!(documents = self.documents, terms = self.terms.len(), "indexing progress");
        }
        Ok(())
    }

    fn spill(&mut self, txn: &WriteTxn) -> Result<(), BuildError> {
        let mut batch = sled::Batch::default();
        let mut spilled = 0usize;
        for (term, acc) in self.terms.iter_mut() {
            if acc.buffered.is_empty() {
                continue;
            }
            for posting in acc.buffered.drain(..) {
                batch.insert(staging_key(term, posting.doc_id), posting.term_frequency.to_be_bytes().to_vec());
                spilled += 1;
            }
            acc.spilled = true;
        }
        txn.staging().apply_batch(batch)?;
        self.buffered = 0;
        tracing::debug!(postings = spilled, "spilled postings to staging");
        Ok(())
    }

    fn finish(self, mut txn: WriteTxn) -> Result<Manifest, BuildError> {
        let threshold = self.options.frequency_threshold;
        let mut terms: Vec<(String, TermAccumulator)> = self.terms.into_iter().collect();
        terms.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut reachable: HashSet<DocId> = HashSet::new();
        let mut pruned = 0u64;
        for (term, acc) in terms {
            if acc.stats.document_frequency < threshold {
                pruned += 1;
                continue;
            }
            let mut postings = if acc.spilled { read_staged(&txn, &term)? } else { Vec::new() };
            postings.extend(acc.buffered);
            postings.sort_unstable_by_key(|p| p.doc_id);
            reachable.extend(postings.iter().map(|p| p.doc_id));
            txn.insert_term(&term, &TermEntry { stats: acc.stats, postings })?;
        }

        // a document without surviving terms can never be returned
        let unreachable = txn.retain_documents(|doc_id| reachable.contains(&doc_id))?;
        tracing::info!(
            documents = self.documents,
            pruned_terms = pruned,
            unreachable_documents = unreachable,
            "pruned index"
        );

        txn.commit(IndexInfo {
            frequency_threshold: threshold,
            fulltext: self.options.fulltext,
            analyzer: self.options.analyzer,
        })
    }
}

fn staging_prefix(term: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + term.len() + 8);
    key.extend_from_slice(&(term.len() as u32).to_be_bytes());
    key.extend_from_slice(term.as_bytes());
    key
}

fn staging_key(term: &str, doc_id: DocId) -> Vec<u8> {
    let mut key = staging_prefix(term);
    key.extend_from_slice(&doc_id.to_be_bytes());
    key
}

fn read_staged(txn: &WriteTxn, term: &str) -> Result<Vec<Posting>, BuildError> {
    let prefix = staging_prefix(term);
    let mut postings = Vec::new();
    for item in txn.staging().scan_prefix(&prefix) {
        let (key, value) = item?;
        let (Ok(doc), Ok(tf)) = (<[u8; 8]>::try_from(&key[prefix.len()..]), <[u8; 4]>::try_from(&value[..])) else {
            return Err(StorageError::Corrupt(format!("staged posting for {term:?}")).into());
        };
        postings.push(Posting { doc_id: DocId::from_be_bytes(doc), term_frequency: u32::from_be_bytes(tf) });
    }
    Ok(postings)
}
