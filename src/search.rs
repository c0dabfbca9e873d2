//! Hybrid retrieval: dense and lexical legs fused with Reciprocal Rank
//! Fusion.
//!
//! Both legs fetch [`CANDIDATE_K`] candidates concurrently. The dense leg
//! drops anything below a permissive cosine floor; the lexical leg is BM25
//! over an OR of the normalized query terms. Fusion only looks at ranks, so
//! the two legs' raw scores never need to be comparable. The caller's
//! threshold is applied to the fused score, after which the list is
//! truncated to the requested limit.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;

use crate::{
    chunking::Heading,
    embedding::{EmbeddingProvider, InputKind},
    error::Result,
    store::{IndexStore, SearchHit},
    tantivy_index::lexical_terms,
    text_util,
};

/// Candidates fetched from each leg before fusion.
pub const CANDIDATE_K: usize = 20;

/// Minimum cosine similarity for a dense candidate.
pub const DENSE_FLOOR: f32 = 0.1;

/// RRF damping constant.
pub const RRF_K: f32 = 60.0;

pub const DEFAULT_LIMIT: usize = 5;

/// Default fused-score threshold. A chunk ranked first by one leg scores
/// about 0.016, first by both about 0.033.
pub const DEFAULT_THRESHOLD: f32 = 0.01;

/// One ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: u64,
    pub title: String,
    pub source_path: String,
    pub slug: Option<String>,
    pub content: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub heading: Option<Heading>,
    /// Cosine similarity, if the dense leg returned this chunk.
    pub vector_score: Option<f32>,
    /// BM25 score, if the lexical leg returned this chunk.
    pub lexical_score: Option<f32>,
    /// Fused RRF score.
    pub score: f32,
    pub rerank_score: Option<f32>,
}

impl SearchResult {
    fn from_hit(hit: SearchHit) -> Self {
        let SearchHit {
            chunk, document, ..
        } = hit;
        Self {
            chunk_id: chunk.id,
            document_id: document.id,
            title: document.meta.title,
            source_path: document.meta.source_path,
            slug: document.meta.slug,
            content: chunk.content,
            chunk_index: chunk.chunk_index,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            heading: chunk.heading,
            vector_score: None,
            lexical_score: None,
            score: 0.0,
            rerank_score: None,
        }
    }

    /// The score a caller should rank by: rerank score when present.
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    pub query: String,
    pub limit: usize,
    /// Minimum fused score.
    pub threshold: f32,
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            limit: DEFAULT_LIMIT,
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetrieverConfig {
    pub candidate_k: usize,
    pub dense_floor: f32,
    pub rrf_k: f32,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            candidate_k: CANDIDATE_K,
            dense_floor: DENSE_FLOOR,
            rrf_k: RRF_K,
        }
    }
}

/// Dense + lexical retriever over an [`IndexStore`].
#[derive(Clone)]
pub struct HybridRetriever {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: RetrieverConfig,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            embedder,
            config: RetrieverConfig::default(),
        }
    }

    /// Run both legs concurrently, fuse, threshold, then truncate.
    ///
    /// An empty leg is fine; an error in either leg fails the search.
    pub async fn search(
        &self,
        params: &SearchParams,
    ) -> Result<Vec<SearchResult>> {
        let k = self.config.candidate_k;
        let terms = lexical_terms(&params.query);

        let dense = async {
            let query =
                self.embedder.embed(&params.query, InputKind::Query).await?;
            let mut hits = self.store.nearest(&query, k).await?;
            hits.retain(|h| h.score >= self.config.dense_floor);
            Ok::<_, crate::Error>(hits)
        };
        let sparse = self.store.lexical(&terms, k);

        let (dense, sparse) = tokio::try_join!(dense, sparse)?;
        tracing::debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            "retrieved candidates"
        );

        let fused = reciprocal_rank_fusion(dense, sparse, self.config.rrf_k);
        Ok(apply_threshold(fused, params.threshold, params.limit))
    }
}

/// Fuse a dense and a lexical ranking.
///
/// Each appearance contributes `1 / (k + rank + 1)` with a 0-based rank.
/// Results are sorted by fused score; ties keep first-seen order, dense
/// hits before lexical ones.
pub fn reciprocal_rank_fusion(
    dense: Vec<SearchHit>,
    sparse: Vec<SearchHit>,
    k: f32,
) -> Vec<SearchResult> {
    let mut fused: Vec<SearchResult> =
        Vec::with_capacity(dense.len() + sparse.len());
    let mut position: HashMap<String, usize> = HashMap::new();

    for (rank, hit) in dense.into_iter().enumerate() {
        let raw = hit.score;
        let slot = slot_for(&mut fused, &mut position, hit);
        fused[slot].score += rrf_contribution(rank, k);
        fused[slot].vector_score = Some(raw);
    }
    for (rank, hit) in sparse.into_iter().enumerate() {
        let raw = hit.score;
        let slot = slot_for(&mut fused, &mut position, hit);
        fused[slot].score += rrf_contribution(rank, k);
        fused[slot].lexical_score = Some(raw);
    }

    fused.sort_by(|a, b| b.score.total_cmp(&a.score));
    fused
}

fn slot_for(
    fused: &mut Vec<SearchResult>,
    position: &mut HashMap<String, usize>,
    hit: SearchHit,
) -> usize {
    if let Some(&slot) = position.get(&hit.chunk.id) {
        return slot;
    }
    position.insert(hit.chunk.id.clone(), fused.len());
    fused.push(SearchResult::from_hit(hit));
    fused.len() - 1
}

fn rrf_contribution(rank: usize, k: f32) -> f32 {
    1.0 / (k + rank as f32 + 1.0)
}

/// Keep results with a fused score of at least `threshold`, then at most
/// `limit` of them.
pub fn apply_threshold(
    results: Vec<SearchResult>,
    threshold: f32,
    limit: usize,
) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|r| r.score >= threshold)
        .take(limit)
        .collect()
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for (i, r) in results.iter().enumerate() {
        let rerank = r
            .rerank_score
            .map(|s| format!(" rerank {s:.3}"))
            .unwrap_or_default();
        println!(
            "{:>3}. [{:.4}{rerank}] {}:{}-{}",
            i + 1,
            r.score,
            r.source_path,
            r.start_line,
            r.end_line,
        );
        match &r.heading {
            Some(h) => println!("     {} > {}", r.title, h.text),
            None => println!("     {}", r.title),
        }
        println!(
            "     vector {} | lexical {}",
            optional_score(r.vector_score),
            optional_score(r.lexical_score)
        );
        let preview = text_util::preview(&r.content, text_util::SNIPPET_CHARS);
        println!("     {preview}");
    }
    println!("\n{} result(s)", results.len());
}

fn optional_score(score: Option<f32>) -> String {
    score.map(|s| format!("{s:.3}")).unwrap_or_else(|| "-".to_string())
}

#[derive(Serialize)]
struct JsonOutput<'a> {
    query: &'a str,
    result_count: usize,
    results: &'a [SearchResult],
}

/// Format results as JSON output.
pub fn format_json(results: &[SearchResult], query: &str) -> Result<()> {
    let out = JsonOutput {
        query,
        result_count: results.len(),
        results,
    };
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
