use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rq_core::{Analyzer, DocId, IndexPaths, PostingsStore, QueryError, QueryOptions, QueryProcessor};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

const MAX_K: usize = 100;
const SNIPPET_BEFORE: usize = 100;
const SNIPPET_AFTER: usize = 200;

#[derive(Deserialize)]
pub struct SearchParams {
    pub q: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub conjunctive: bool,
    #[serde(default)]
    pub fulltext: bool,
}
fn default_k() -> usize { rq_core::query::DEFAULT_NUM_RESULTS }

#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub terms: Vec<String>,
    pub conjunctive: bool,
    pub took_s: f64,
    pub results: Vec<SearchHit>,
}

#[derive(Serialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub name: String,
    pub score: u64,
    pub snippet: Option<String>,
}

#[derive(Serialize)]
pub struct DocResponse {
    pub doc_id: DocId,
    pub name: String,
    pub text: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub processor: QueryProcessor<Analyzer>,
}

pub struct ApiError(QueryError);

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueryError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            QueryError::FullTextUnavailable => StatusCode::CONFLICT,
            QueryError::EmptyIndex => StatusCode::SERVICE_UNAVAILABLE,
            QueryError::DocumentNotFound(_) => StatusCode::NOT_FOUND,
            QueryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "query failed");
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Opens the index under `index_dir` and builds the router over it.
pub fn build_app<P: AsRef<std::path::Path>>(index_dir: P) -> Result<Router> {
    let paths = IndexPaths::new(index_dir);
    let store = PostingsStore::open(paths.store())?;
    match store.manifest() {
        Some(m) => tracing::info!(terms = m.term_count, documents = m.document_count, fulltext = m.fulltext, "loaded index"),
        None => tracing::warn!(dir = %paths.root.display(), "no index built yet, searches will fail"),
    }
    Ok(router(store))
}

pub fn router(store: PostingsStore) -> Router {
    // Queries must be normalized the way the index was built.
    let analyzer = Analyzer::new(store.manifest().map(|m| m.analyzer).unwrap_or_default());
    let app_state = AppState { processor: QueryProcessor::new(store, analyzer) };

    // CORS: read CORS_ALLOW_ORIGIN (comma-separated) or allow Any by default
    let cors = match std::env::var("CORS_ALLOW_ORIGIN") {
        Ok(val) => {
            let origins: Vec<_> = val
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
            } else {
                CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(Any).allow_headers(Any)
            }
        }
        Err(_) => CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any),
    };

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/search", get(search_handler))
        .route("/doc/:doc_id", get(doc_handler))
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn search_handler(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ApiError> {
    let start = std::time::Instant::now();
    let options = QueryOptions {
        num_results: params.k.min(MAX_K),
        conjunctive: params.conjunctive,
        fulltext: params.fulltext,
    };
    let hits = state.processor.query(&params.q, &options)?;

    // Highlight what the user typed, not the normalized terms
    let raw_terms: Vec<String> = params.q.split_whitespace().map(|s| s.to_string()).collect();
    let results = hits
        .into_iter()
        .map(|hit| SearchHit {
            doc_id: hit.document_id,
            name: hit.name,
            score: hit.score,
            snippet: hit.text.as_deref().and_then(|text| snippet(text, &raw_terms)),
        })
        .collect();

    Ok(Json(SearchResponse {
        terms: state.processor.query_terms(&params.q),
        query: params.q,
        conjunctive: params.conjunctive,
        took_s: start.elapsed().as_secs_f64(),
        results,
    }))
}

pub async fn doc_handler(State(state): State<AppState>, Path(doc_id): Path<DocId>) -> Result<Json<DocResponse>, ApiError> {
    let meta = state.processor.store().get_document_metadata(doc_id)?;
    Ok(Json(DocResponse { doc_id, name: meta.name, text: meta.text }))
}

fn snippet(text: &str, raw_terms: &[String]) -> Option<String> {
    if text.is_empty() { return None; }
    // find first match (case-insensitive) of any raw term
    let first_idx = raw_terms
        .iter()
        .filter(|t| !t.trim().is_empty())
        .find_map(|t| find_case_insensitive(text, t));
    let snippet = match first_idx {
        Some(idx) => {
            let start = floor_char_boundary(text, idx.saturating_sub(SNIPPET_BEFORE));
            let end = floor_char_boundary(text, (idx + SNIPPET_AFTER).min(text.len()));
            text[start..end].to_string()
        }
        None => text.chars().take(SNIPPET_AFTER).collect(),
    };
    Some(highlight_terms(&snippet, raw_terms))
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let pat = regex::RegexBuilder::new(&regex::escape(needle)).case_insensitive(true).build().ok()?;
    pat.find(haystack).map(|m| m.start())
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn highlight_terms(snippet: &str, terms: &[String]) -> String {
    let alternation: Vec<String> = terms.iter().filter(|t| !t.trim().is_empty()).map(|t| regex::escape(t)).collect();
    if alternation.is_empty() {
        return snippet.to_string();
    }
    // one pass, so inserted tags are never matched again
    let Ok(pat) = regex::RegexBuilder::new(&alternation.join("|")).case_insensitive(true).build() else {
        return snippet.to_string();
    };
    pat.replace_all(snippet, |caps: &regex::Captures| format!("<em>{}</em>", &caps[0])).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_highlights_and_respects_char_boundaries() {
        let text = format!("{}ünïcode Rust here", "é".repeat(120));
        let s = snippet(&text, &["rust".to_string()]).unwrap();
        assert!(s.contains("<em>Rust</em>"));
    }

    #[test]
    fn highlighting_does_not_touch_inserted_tags() {
        let s = highlight_terms("them and em", &["em".to_string(), "and".to_string()]);
        assert_eq!(s, "th<em>em</em> <em>and</em> <em>em</em>");
    }

    #[test]
    fn snippet_without_match_takes_prefix() {
        let s = snippet("short comment", &["absent".to_string()]).unwrap();
        assert_eq!(s, "short comment");
        assert!(snippet("", &[]).is_none());
    }
}
