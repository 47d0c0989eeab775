use crate::error::QueryError;
use crate::index::{DocId, Posting};
use crate::store::{IndexReader, PostingsStore};
use crate::tokenizer::Normalizer;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

pub const DEFAULT_NUM_RESULTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub num_results: usize,
    /// AND instead of OR across query terms.
    pub conjunctive: bool,
    /// Return raw text with every hit.
    pub fulltext: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self { num_results: DEFAULT_NUM_RESULTS, conjunctive: false, fulltext: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultItem {
    pub document_id: DocId,
    pub name: String,
    /// Sum of the term frequencies of the matched query terms.
    pub score: u64,
    pub text: Option<String>,
}

/// Evaluates queries against the committed index of a store. Holds no
/// mutable state, so one processor can serve concurrent queries.
#[derive(Clone)]
pub struct QueryProcessor<N> {
    store: PostingsStore,
    normalizer: N,
}

impl<N: Normalizer> QueryProcessor<N> {
    pub fn new(store: PostingsStore, normalizer: N) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &PostingsStore {
        &self.store
    }

    /// Normalized, de-duplicated query terms in first-seen order.
    pub fn query_terms(&self, text: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        self.normalizer.normalize(text).into_iter().filter(|t| seen.insert(t.clone())).collect()
    }

    pub fn query(&self, text: &str, options: &QueryOptions) -> Result<Vec<ResultItem>, QueryError> {
        if options.num_results == 0 {
            return Err(QueryError::InvalidParameter {
                name: "num_results",
                message: "must be positive".into(),
            });
        }
        let reader = self.store.reader()?;
        if options.fulltext && !reader.manifest().fulltext {
            return Err(QueryError::FullTextUnavailable);
        }

        let terms = self.query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let lists = terms.iter().map(|t| reader.get_postings(t)).collect::<Result<Vec<_>, _>>()?;

        let candidates = if options.conjunctive { intersect(&lists) } else { union(&lists) };
        tracing::debug!(terms = terms.len(), candidates = candidates.len(), "merged postings");
        let ranked = rank(candidates, options.num_results);
        materialize(&reader, ranked, options.fulltext)
    }
}

/// Every document in any list, scored by the sum of its term frequencies.
pub(crate) fn union(lists: &[Vec<Posting>]) -> Vec<(DocId, u64)> {
    let mut scores: HashMap<DocId, u64> = HashMap::new();
    for list in lists {
        for p in list {
            *scores.entry(p.doc_id).or_insert(0) += p.term_frequency as u64;
        }
    }
    scores.into_iter().collect()
}

/// Documents present in every list. Lists must be sorted by doc_id.
pub(crate) fn intersect(lists: &[Vec<Posting>]) -> Vec<(DocId, u64)> {
    if lists.is_empty() || lists.iter().any(|l| l.is_empty()) {
        return Vec::new();
    }
    let mut order: Vec<&Vec<Posting>> = lists.iter().collect();
    order.sort_by_key(|l| l.len());

    let mut acc: Vec<(DocId, u64)> = order[0].iter().map(|p| (p.doc_id, p.term_frequency as u64)).collect();
    for list in &order[1..] {
        let mut next = Vec::with_capacity(acc.len().min(list.len()));
        let mut j = 0;
        for &(doc_id, score) in &acc {
            while j < list.len() && list[j].doc_id < doc_id {
                j += 1;
            }
            if j == list.len() {
                break;
            }
            if list[j].doc_id == doc_id {
                next.push((doc_id, score + list[j].term_frequency as u64));
            }
        }
        acc = next;
        if acc.is_empty() {
            break;
        }
    }
    acc
}

fn by_rank(a: &(DocId, u64), b: &(DocId, u64)) -> Ordering {
    b.1.cmp(&a.1).then(a.0.cmp(&b.0))
}

/// Top `n` by score descending, ties by ascending doc id.
pub(crate) fn rank(mut candidates: Vec<(DocId, u64)>, n: usize) -> Vec<(DocId, u64)> {
    if candidates.len() > n {
        candidates.select_nth_unstable_by(n - 1, by_rank);
        candidates.truncate(n);
    }
    candidates.sort_unstable_by(by_rank);
    candidates
}

fn materialize(reader: &IndexReader, ranked: Vec<(DocId, u64)>, fulltext: bool) -> Result<Vec<ResultItem>, QueryError> {
    ranked
        .into_iter()
        .map(|(document_id, score)| {
            let meta = reader.get_document_metadata(document_id)?;
            Ok(ResultItem {
                document_id,
                name: meta.name,
                score,
                text: if fulltext { meta.text } else { None },
            })
        })
        .collect()
}
