use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::embed::Embedder;
use crate::error::{EmberError, Result};
use crate::scanner::compile_path_glob;
use crate::storage::{ChunkRecord, RankedHit, SearchFilters, Store};

/// Reciprocal Rank Fusion constant; the conventional k = 60.
const K_RRF: f64 = 60.0;

/// Candidate pool floor: each ranker is asked for max(2·topk, 100).
const MIN_CANDIDATES: usize = 100;

/// Preview length attached to the stable result shape.
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub topk: usize,
    pub path_filter: Option<String>,
    pub lang_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: ChunkRecord,
    pub fused_score: f64,
    /// Negated BM25 from the lexical ranker, when it returned this chunk.
    pub lexical_score: Option<f64>,
    /// Cosine similarity from the vector ranker, when it returned this chunk.
    pub vector_score: Option<f64>,
    /// 1-based position in the final ordering.
    pub rank: usize,
}

/// Stable wire shape for consumers outside the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub rank: usize,
    pub score: f64,
    pub path: String,
    pub symbol: String,
    pub lang: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f64>,
}

impl From<&SearchResult> for SearchHit {
    fn from(r: &SearchResult) -> Self {
        let preview: String = r.chunk.content.chars().take(PREVIEW_CHARS).collect();
        SearchHit {
            rank: r.rank,
            score: r.fused_score,
            path: r.chunk.path.clone(),
            symbol: r.chunk.symbol.clone(),
            lang: r.chunk.lang.clone(),
            start_line: r.chunk.start_line,
            end_line: r.chunk.end_line,
            content_hash: r.chunk.content_hash.clone(),
            preview: (!preview.is_empty()).then_some(preview),
            lexical_score: r.lexical_score,
            vector_score: r.vector_score,
        }
    }
}

#[derive(Debug, Clone)]
struct FusedCandidate {
    content_hash: String,
    fused: f64,
    lexical: Option<f64>,
    vector: Option<f64>,
}

/// Hybrid retrieval: embed the query once, ask the lexical and vector
/// indexes in parallel, fuse the two rankings, hydrate, order, truncate.
pub struct Searcher {
    store: Arc<Store>,
    embedder: Arc<dyn Embedder>,
}

impl Searcher {
    pub fn new(store: Arc<Store>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    pub fn search(&self, query: &Query) -> Result<Vec<SearchResult>> {
        // 1. Validate.
        if query.topk == 0 {
            return Err(EmberError::InvalidQuery {
                reason: "topk must be positive".into(),
            });
        }
        if query.text.trim().is_empty() {
            return Err(EmberError::InvalidQuery {
                reason: "query text is empty; type something to search for".into(),
            });
        }
        if let Some(pattern) = &query.path_filter {
            compile_path_glob(pattern)?;
        }

        let filters = SearchFilters {
            lang: query.lang_filter.clone(),
            path_glob: query.path_filter.clone(),
        };

        // 2. Embed the query into the same unit space as the index.
        let query_vec = self
            .embedder
            .embed(&[query.text.clone()])?
            .pop()
            .ok_or_else(|| EmberError::EmbedderFailure("no vector for query".into()))?;

        // 3. Candidate pools, in parallel, filters applied in-query.
        let k_cand = (2 * query.topk).max(MIN_CANDIDATES);
        let (lexical, vector) = rayon::join(
            || self.store.lexical_search(&query.text, k_cand, &filters),
            || self.store.vector_search(&query_vec, k_cand, &filters),
        );
        let lexical = lexical?;
        let vector = vector?;

        // 4. Fuse.
        let fused = rrf_fuse(&lexical, &vector);

        // 5. Hydrate the top topk; dangling index entries are logged with a
        // small sample and omitted, so fewer than topk results can come back.
        let mut results: Vec<SearchResult> = Vec::with_capacity(query.topk);
        let mut missing: Vec<String> = Vec::new();
        for cand in fused.iter().take(query.topk) {
            match self.store.get_chunk(&cand.content_hash)? {
                Some(chunk) => results.push(SearchResult {
                    chunk,
                    fused_score: cand.fused,
                    lexical_score: cand.lexical,
                    vector_score: cand.vector,
                    rank: 0,
                }),
                None => missing.push(cand.content_hash.clone()),
            }
        }
        if !missing.is_empty() {
            let sample: Vec<&str> = missing.iter().take(5).map(|s| &s[..12]).collect();
            tracing::warn!(
                "{} candidate(s) had no chunk row (concurrent mutation?); sample: {:?}",
                missing.len(),
                sample
            );
        }

        // 6. Order: fused score descending, ties by path then start line.
        results.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.path.cmp(&b.chunk.path))
                .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
        });
        for (i, r) in results.iter_mut().enumerate() {
            r.rank = i + 1;
        }

        Ok(results)
    }
}

/// Sum `1 / (k + rank)` over the rankers that returned each candidate;
/// rankers that missed it contribute zero. Input slices are already in rank
/// order (best first, 1-based ranks).
fn rrf_fuse(lexical: &[RankedHit], vector: &[RankedHit]) -> Vec<FusedCandidate> {
    let mut by_hash: std::collections::HashMap<&str, FusedCandidate> =
        std::collections::HashMap::new();

    for (i, hit) in lexical.iter().enumerate() {
        let rank = (i + 1) as f64;
        let entry = by_hash
            .entry(&hit.content_hash)
            .or_insert_with(|| FusedCandidate {
                content_hash: hit.content_hash.clone(),
                fused: 0.0,
                lexical: None,
                vector: None,
            });
        entry.fused += 1.0 / (K_RRF + rank);
        entry.lexical = Some(hit.score);
    }

    for (i, hit) in vector.iter().enumerate() {
        let rank = (i + 1) as f64;
        let entry = by_hash
            .entry(&hit.content_hash)
            .or_insert_with(|| FusedCandidate {
                content_hash: hit.content_hash.clone(),
                fused: 0.0,
                lexical: None,
                vector: None,
            });
        entry.fused += 1.0 / (K_RRF + rank);
        entry.vector = Some(hit.score);
    }

    let mut fused: Vec<FusedCandidate> = by_hash.into_values().collect();
    // Deterministic pre-hydration order; the final tie-break on path and
    // line happens after hydration.
    fused.sort_by(|a, b| {
        b.fused
            .partial_cmp(&a.fused)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.content_hash.cmp(&b.content_hash))
    });
    fused
}
