use criterion::{criterion_group, criterion_main, Criterion};
use rq_core::tokenizer::{Analyzer, AnalyzerConfig, Normalizer};
use rq_core::{build_index, Document, PostingsStore};
use std::convert::Infallible;

const COMMENT: &str = "Honestly the borrow checker stopped bothering me after a few weeks. \
    Running benchmarks on the new allocator showed the runners were mostly idle, \
    so we're rewriting the scheduler again. Anyone else seeing this?";

/// Fixed-seed synthetic corpus: `num_docs` documents of `num_words` three-letter words.
fn synthetic(num_docs: u64, num_words: usize) -> Vec<Result<Document, Infallible>> {
    let mut state: u64 = 0x2545_f491_4f6c_dd1d;
    let mut next = move || {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };
    (0..num_docs)
        .map(|id| {
            let tokens = (0..num_words)
                .map(|_| (0..3).map(|_| (b'a' + (next() % 26) as u8) as char).collect())
                .collect();
            Ok(Document::new(id, tokens))
        })
        .collect()
}

fn bench_tokenize(c: &mut Criterion) {
    let analyzer = Analyzer::new(AnalyzerConfig { lemmatize: true, stopwords: false });
    c.bench_function("normalize_comment", |b| b.iter(|| analyzer.normalize(COMMENT)));
}

fn bench_build(c: &mut Criterion) {
    c.bench_function("build_5000_docs", |b| {
        b.iter_batched(
            || (PostingsStore::temporary().unwrap(), synthetic(5_000, 20)),
            |(store, docs)| build_index(&store, docs, 5).unwrap(),
            criterion::BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_tokenize, bench_build);
criterion_main!(benches);
