use rq_core::tokenizer::WhitespaceNormalizer;
use rq_core::{
    build_index, BuildError, BuildOptions, DocId, Document, IndexBuilder, Posting, PostingsStore, QueryError,
    QueryOptions, QueryProcessor, ResultItem,
};
use std::convert::Infallible;
use std::io;

fn doc(id: DocId, tokens: &[&str]) -> Result<Document, Infallible> {
    Ok(Document::new(id, tokens.iter().map(|t| t.to_string()).collect()))
}

fn sample() -> Vec<Result<Document, Infallible>> {
    vec![doc(1, &["a", "b", "a"]), doc(2, &["b", "c"]), doc(3, &["a"])]
}

fn processor(store: &PostingsStore) -> QueryProcessor<WhitespaceNormalizer> {
    QueryProcessor::new(store.clone(), WhitespaceNormalizer)
}

fn ids(results: &[ResultItem]) -> Vec<(DocId, u64)> {
    results.iter().map(|r| (r.document_id, r.score)).collect()
}

fn or(n: usize) -> QueryOptions {
    QueryOptions { num_results: n, ..Default::default() }
}

fn and(n: usize) -> QueryOptions {
    QueryOptions { num_results: n, conjunctive: true, ..Default::default() }
}

#[test]
fn prunes_terms_below_threshold() {
    let store = PostingsStore::temporary().unwrap();
    let manifest = build_index(&store, sample(), 2).unwrap();
    assert_eq!(manifest.term_count, 2);
    assert_eq!(
        store.get_postings("a").unwrap(),
        vec![Posting { doc_id: 1, term_frequency: 2 }, Posting { doc_id: 3, term_frequency: 1 }]
    );
    assert_eq!(store.get_postings("b").unwrap().len(), 2);
    assert!(store.get_postings("c").unwrap().is_empty());
}

#[test]
fn disjunctive_query_sums_term_frequencies() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    let results = processor(&store).query("a b", &or(10)).unwrap();
    assert_eq!(ids(&results), vec![(1, 3), (2, 1), (3, 1)]);
    assert!(results.iter().all(|r| r.text.is_none()));
}

#[test]
fn conjunctive_query_with_pruned_term_is_empty() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    assert!(processor(&store).query("a c", &and(10)).unwrap().is_empty());
}

#[test]
fn conjunctive_results_are_subset_of_disjunctive() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 0).unwrap();
    let qp = processor(&store);
    for query in ["a b", "b c", "a b c", "a", "c zzz"] {
        let all = ids(&qp.query(query, &or(100)).unwrap());
        for hit in ids(&qp.query(query, &and(100)).unwrap()) {
            assert!(all.contains(&hit), "{query}: {hit:?} missing from {all:?}");
        }
    }
    assert_eq!(ids(&qp.query("a b", &and(10)).unwrap()), vec![(1, 3)]);
}

#[test]
fn threshold_zero_keeps_singletons() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 0).unwrap();
    assert_eq!(store.term_count(), 3);
    assert_eq!(store.get_postings("c").unwrap(), vec![Posting { doc_id: 2, term_frequency: 1 }]);
}

#[test]
fn single_term_round_trip() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, vec![doc(10, &["x", "y", "x", "x"]), doc(11, &["y"])], 1).unwrap();
    assert_eq!(ids(&processor(&store).query("x", &or(10)).unwrap()), vec![(10, 3)]);
}

#[test]
fn empty_stream_builds_empty_index() {
    let store = PostingsStore::temporary().unwrap();
    let manifest = build_index(&store, Vec::<Result<Document, Infallible>>::new(), 5).unwrap();
    assert_eq!(manifest.term_count, 0);
    assert_eq!(manifest.document_count, 0);
    assert!(processor(&store).query("anything", &or(10)).unwrap().is_empty());
}

#[test]
fn query_before_build_fails() {
    let store = PostingsStore::temporary().unwrap();
    assert!(matches!(processor(&store).query("a", &or(10)), Err(QueryError::EmptyIndex)));
}

#[test]
fn fulltext_requires_fulltext_index() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    let options = QueryOptions { fulltext: true, ..Default::default() };
    assert!(matches!(processor(&store).query("a", &options), Err(QueryError::FullTextUnavailable)));
}

#[test]
fn fulltext_index_returns_text() {
    let store = PostingsStore::temporary().unwrap();
    let docs = vec![
        Ok::<_, Infallible>(Document::new(1, vec!["cat".into()]).with_name("c1").with_text("Cat!")),
        Ok(Document::new(2, vec!["cat".into(), "cat".into()]).with_name("c2").with_text("cat, cat")),
    ];
    let options = BuildOptions { frequency_threshold: 1, fulltext: true, ..Default::default() };
    IndexBuilder::new(&store, options).build(docs).unwrap();

    let query = QueryOptions { fulltext: true, ..Default::default() };
    let results = processor(&store).query("cat", &query).unwrap();
    assert_eq!(results[0].name, "c2");
    assert_eq!(results[0].text.as_deref(), Some("cat, cat"));
    assert_eq!(results[1].text.as_deref(), Some("Cat!"));
}

#[test]
fn non_positive_num_results_is_rejected() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    let err = processor(&store).query("a", &or(0)).unwrap_err();
    assert!(matches!(err, QueryError::InvalidParameter { name: "num_results", .. }));
}

#[test]
fn results_are_truncated_and_stable() {
    let store = PostingsStore::temporary().unwrap();
    let docs: Vec<_> = (0..20u64).map(|i| doc(i, &["w"])).collect();
    build_index(&store, docs, 1).unwrap();
    let qp = processor(&store);
    let first = qp.query("w", &or(5)).unwrap();
    assert_eq!(first.iter().map(|r| r.document_id).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);
    assert_eq!(first, qp.query("w", &or(5)).unwrap());
}

#[test]
fn repeated_query_terms_count_once() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    assert_eq!(ids(&processor(&store).query("a a a", &or(10)).unwrap()), vec![(1, 2), (3, 1)]);
}

#[test]
fn builds_are_deterministic() {
    let a = PostingsStore::temporary().unwrap();
    let b = PostingsStore::temporary().unwrap();
    build_index(&a, sample(), 1).unwrap();
    build_index(&b, sample(), 1).unwrap();
    for term in ["a", "b", "c"] {
        assert_eq!(a.get_postings(term).unwrap(), b.get_postings(term).unwrap());
        assert_eq!(a.term_stats(term).unwrap(), b.term_stats(term).unwrap());
    }
}

#[test]
fn duplicate_document_aborts_build() {
    let store = PostingsStore::temporary().unwrap();
    let err = build_index(&store, vec![doc(1, &["a"]), doc(1, &["b"])], 0).unwrap_err();
    assert!(matches!(err, BuildError::DuplicateDocument(1)));
    assert!(store.manifest().is_none());
}

#[test]
fn source_failure_keeps_previous_index() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();

    let failing = vec![
        Ok(Document::new(7, vec!["z".into()])),
        Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated archive")),
    ];
    let err = build_index(&store, failing, 0).unwrap_err();
    assert!(matches!(err, BuildError::SourceExhaustion { documents: 1, .. }));

    assert_eq!(store.term_count(), 2);
    assert!(store.get_postings("z").unwrap().is_empty());
    assert_eq!(ids(&processor(&store).query("a", &or(10)).unwrap()), vec![(1, 2), (3, 1)]);
}

#[test]
fn rebuild_replaces_index() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    build_index(&store, vec![doc(9, &["fresh"])], 1).unwrap();
    assert!(store.get_postings("a").unwrap().is_empty());
    assert_eq!(ids(&processor(&store).query("fresh a", &or(10)).unwrap()), vec![(9, 1)]);
    assert_eq!(store.document_count(), 1);
}

#[test]
fn index_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.sled");
    {
        let store = PostingsStore::open(&path).unwrap();
        build_index(&store, sample(), 2).unwrap();
    }
    let store = PostingsStore::open(&path).unwrap();
    assert_eq!(store.manifest().unwrap().frequency_threshold, 2);
    assert_eq!(ids(&processor(&store).query("b", &or(10)).unwrap()), vec![(1, 1), (2, 1)]);
}

#[test]
fn readers_run_concurrently() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    let qp = processor(&store);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..4).map(|_| s.spawn(|| qp.query("a b", &or(10)).unwrap())).collect();
        for h in handles {
            assert_eq!(ids(&h.join().unwrap()), vec![(1, 3), (2, 1), (3, 1)]);
        }
    });
}

#[test]
fn pinned_reader_outlives_two_rebuilds() {
    let store = PostingsStore::temporary().unwrap();
    build_index(&store, sample(), 2).unwrap();
    let pinned = store.reader().unwrap();
    build_index(&store, vec![doc(9, &["fresh"])], 1).unwrap();
    build_index(&store, vec![doc(10, &["newer"])], 1).unwrap();

    assert_eq!(
        pinned.get_postings("a").unwrap(),
        vec![Posting { doc_id: 1, term_frequency: 2 }, Posting { doc_id: 3, term_frequency: 1 }]
    );
    assert!(pinned.get_document_metadata(1).is_ok());
    assert!(store.get_postings("a").unwrap().is_empty());
    assert_eq!(store.get_postings("newer").unwrap().len(), 1);
}
