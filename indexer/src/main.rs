use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use rq_core::{
    Analyzer, AnalyzerConfig, BuildOptions, IndexBuilder, IndexPaths, PostingsStore, QueryOptions, QueryProcessor,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing_subscriber::{fmt, EnvFilter};

mod source;

use source::{archive_files, CommentSource};

const PROGRESS_EVERY: u64 = 10_000;

#[derive(Parser)]
#[command(name = "rq-indexer")]
#[command(about = "Build and query an inverted index over comment archives", long_about = None)]
struct Cli {
    /// Directory holding the index (and, by default, the archives)
    #[arg(long, short, global = true, default_value = "./data")]
    dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index from JSON/JSONL comment archives
    Build(BuildArgs),
    /// Answer queries read line by line from stdin
    Query {
        #[command(flatten)]
        query: QueryArgs,
        /// Print the full text of every hit
        #[arg(long, short, default_value_t = false)]
        fulltext: bool,
    },
    /// Build, then answer queries from stdin
    Run {
        #[command(flatten)]
        build: BuildArgs,
        #[command(flatten)]
        query: QueryArgs,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Archive file or directory (defaults to <dir>/monthly_data)
    #[arg(long)]
    input: Option<PathBuf>,
    /// Minimum number of documents a term must appear in
    #[arg(long, short, default_value_t = 5)]
    minfreq: u32,
    /// Store comment text so queries can return it
    #[arg(long, short, default_value_t = false)]
    fulltext: bool,
    /// Stem terms in comments and queries
    #[arg(long, short, default_value_t = false)]
    lemma: bool,
    /// Drop English stop words
    #[arg(long, default_value_t = false)]
    stopwords: bool,
    /// Log progress while indexing
    #[arg(long, short, default_value_t = false)]
    progress: bool,
}

#[derive(Args)]
struct QueryArgs {
    /// Number of results per query
    #[arg(long, short, default_value_t = 10)]
    num: usize,
    /// Require every query term to match
    #[arg(long = "and", short = 'a', default_value_t = false)]
    conjunctive: bool,
}

fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).with_writer(io::stderr).init();
    let cli = Cli::parse();
    let paths = IndexPaths::new(&cli.dir);

    match cli.command {
        Commands::Build(args) => {
            let store = PostingsStore::open(paths.store())?;
            build(&store, &paths, &args)
        }
        Commands::Query { query, fulltext } => {
            let store = PostingsStore::open(paths.store())?;
            answer_stdin(store, &query, fulltext)
        }
        Commands::Run { build: args, query } => {
            let store = PostingsStore::open(paths.store())?;
            build(&store, &paths, &args)?;
            answer_stdin(store, &query, args.fulltext)
        }
    }
}

fn build(store: &PostingsStore, paths: &IndexPaths, args: &BuildArgs) -> Result<()> {
    let input = args.input.clone().unwrap_or_else(|| paths.archives());
    let files = archive_files(&input);
    if files.is_empty() {
        tracing::warn!(input = %input.display(), "no archive files found, building an empty index");
    }
    let analyzer = AnalyzerConfig { lemmatize: args.lemma, stopwords: args.stopwords };
    let options = BuildOptions {
        frequency_threshold: args.minfreq,
        fulltext: args.fulltext,
        analyzer,
        progress_every: if args.progress { PROGRESS_EVERY } else { 0 },
        abort: Some(abort_on_interrupt()),
        ..BuildOptions::default()
    };
    let documents = CommentSource::new(files, Analyzer::new(analyzer), args.fulltext);
    let manifest = IndexBuilder::new(store, options).build(documents)?;
    tracing::info!(
        dir = %paths.root.display(),
        terms = manifest.term_count,
        documents = manifest.document_count,
        "index build complete"
    );
    Ok(())
}

/// Ctrl-C stops a running build cleanly through the returned flag. Once the
/// build is over (the flag is dropped) or on a second Ctrl-C, it exits.
fn abort_on_interrupt() -> Arc<AtomicBool> {
    let abort = Arc::new(AtomicBool::new(false));
    let watched = Arc::downgrade(&abort);
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!(%err, "failed to start interrupt handler");
                return;
            }
        };
        runtime.block_on(async {
            loop {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    tracing::error!(%err, "failed to install Ctrl-C handler");
                    return;
                }
                if !absorb_interrupt(&watched) {
                    std::process::exit(130);
                }
            }
        });
    });
    abort
}

/// Raises the abort flag; false when there is no build left to abort.
fn absorb_interrupt(abort: &Weak<AtomicBool>) -> bool {
    match abort.upgrade() {
        Some(flag) if !flag.swap(true, Ordering::Relaxed) => {
            tracing::warn!("interrupt received, aborting build (Ctrl-C again to exit)");
            true
        }
        _ => false,
    }
}

fn answer_stdin(store: PostingsStore, args: &QueryArgs, fulltext: bool) -> Result<()> {
    let Some(manifest) = store.manifest() else {
        bail!("no index found, run `rq-indexer build` first");
    };
    // Normalize queries exactly the way the index was built.
    let processor = QueryProcessor::new(store, Analyzer::new(manifest.analyzer));
    let options = QueryOptions { num_results: args.num, conjunctive: args.conjunctive, fulltext };

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let results = processor.query(&line, &options)?;
        for term in processor.query_terms(&line) {
            let df = processor.store().term_stats(&term)?.map_or(0, |s| s.document_frequency);
            writeln!(out, "df({term}): {df}")?;
        }
        for hit in &results {
            writeln!(out, "{} ({}): {}", hit.document_id, hit.score, hit.name)?;
            if let Some(text) = &hit.text {
                writeln!(out, "    {}", text.replace('\n', "\n    "))?;
            }
        }
        writeln!(out)?;
        out.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_interrupt_aborts_running_build() {
        let abort = Arc::new(AtomicBool::new(false));
        let watched = Arc::downgrade(&abort);
        assert!(absorb_interrupt(&watched));
        assert!(abort.load(Ordering::Relaxed));
        assert!(!absorb_interrupt(&watched));
    }

    #[test]
    fn interrupt_after_build_is_not_absorbed() {
        let watched = Arc::downgrade(&Arc::new(AtomicBool::new(false)));
        assert!(!absorb_interrupt(&watched));
    }
}
