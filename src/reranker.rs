//! Cross-encoder reranking of fused results.
//!
//! [`Reranker`] never fails: without a provider it passes results through,
//! and a provider error leaves the input untouched.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    http::ApiClient,
    search::SearchResult,
    usage::{Operation, TokenUsage, UsageDetail},
};

/// Default Voyage rerank model.
pub const DEFAULT_RERANK_MODEL: &str = "rerank-2.5";

/// Results below this relevance score are dropped after reranking.
pub const RELEVANCE_CUTOFF: f32 = 0.5;

/// A relevance score for one input document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RerankScore {
    /// Index into the documents passed to the provider.
    pub index: usize,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RerankResponse {
    pub scores: Vec<RerankScore>,
    pub total_tokens: u64,
}

/// Scores `(query, document)` relevance in one batched call.
#[async_trait]
pub trait RerankProvider: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<RerankResponse>;

    fn model(&self) -> &str;
}

/// Voyage AI `/rerank` client.
#[derive(Debug, Clone)]
pub struct VoyageReranker {
    client: ApiClient,
    model: String,
}

impl VoyageReranker {
    pub fn new(client: ApiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: &'a [String],
    model: &'a str,
    top_k: usize,
    return_documents: bool,
}

#[derive(Debug, Deserialize)]
struct VoyageRerankResponse {
    data: Vec<VoyageRerankItem>,
    #[serde(default)]
    usage: Option<VoyageUsage>,
}

#[derive(Debug, Deserialize)]
struct VoyageRerankItem {
    index: usize,
    relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct VoyageUsage {
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl RerankProvider for VoyageReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
    ) -> Result<RerankResponse> {
        let request = RerankRequest {
            query,
            documents,
            model: &self.model,
            top_k: documents.len(),
            return_documents: false,
        };
        let response: VoyageRerankResponse =
            self.client.post_json("rerank", &request).await?;
        Ok(RerankResponse {
            scores: response
                .data
                .into_iter()
                .map(|d| RerankScore {
                    index: d.index,
                    relevance_score: d.relevance_score,
                })
                .collect(),
            total_tokens: response.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Output of [`Reranker::rerank`].
#[derive(Debug, Clone)]
pub struct Reranked {
    pub results: Vec<SearchResult>,
    /// Present when the provider was called successfully.
    pub usage: Option<TokenUsage>,
}

/// Optional rerank stage of the query pipeline.
#[derive(Clone)]
pub struct Reranker {
    provider: Option<Arc<dyn RerankProvider>>,
}

impl Reranker {
    pub fn new(provider: Arc<dyn RerankProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    /// A reranker that returns its input unchanged.
    pub fn passthrough() -> Self {
        Self { provider: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Rescore `results` against `query`, sort by relevance and drop
    /// results below the cutoff.
    pub async fn rerank(
        &self,
        query: &str,
        results: Vec<SearchResult>,
    ) -> Reranked {
        let Some(provider) = &self.provider else {
            return Reranked {
                results,
                usage: None,
            };
        };
        if results.is_empty() {
            return Reranked {
                results,
                usage: None,
            };
        }

        let documents: Vec<String> =
            results.iter().map(|r| r.content.clone()).collect();
        let response = match provider.rerank(query, &documents).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "reranking failed, keeping retrieval order"
                );
                return Reranked {
                    results,
                    usage: None,
                };
            }
        };

        let candidate_count = results.len();
        let reranked =
            apply_scores(results, &response.scores, RELEVANCE_CUTOFF);
        tracing::debug!(
            candidates = candidate_count,
            kept = reranked.len(),
            top = reranked.first().and_then(|r| r.rerank_score),
            "reranked results"
        );

        Reranked {
            results: reranked,
            usage: Some(TokenUsage::new(
                Operation::Rerank,
                provider.model(),
                response.total_tokens,
                UsageDetail::Rerank {
                    query: query.to_string(),
                    candidate_count,
                },
            )),
        }
    }
}

impl std::fmt::Debug for Reranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reranker")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Attach scores to their original results by index, sort by score and
/// apply the cutoff.
///
/// Indices out of range or seen twice are ignored. Results the provider did
/// not score are dropped.
fn apply_scores(
    results: Vec<SearchResult>,
    scores: &[RerankScore],
    cutoff: f32,
) -> Vec<SearchResult> {
    let mut slots: Vec<Option<SearchResult>> =
        results.into_iter().map(Some).collect();
    let mut scored = Vec::with_capacity(scores.len());

    for score in scores {
        match slots.get_mut(score.index).and_then(Option::take) {
            Some(mut result) => {
                result.rerank_score = Some(score.relevance_score);
                scored.push(result);
            }
            None => tracing::warn!(
                index = score.index,
                "ignoring rerank score for unknown result"
            ),
        }
    }

    scored.sort_by(|a, b| b.relevance().total_cmp(&a.relevance()));
    scored.retain(|r| r.relevance() >= cutoff);
    scored
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{error::Error, search::tests::result};

    /// Provider returning fixed scores, whatever the documents.
    pub(crate) struct FakeRerank {
        pub calls: AtomicUsize,
        pub scores: Vec<RerankScore>,
        pub fail: bool,
    }

    impl FakeRerank {
        pub(crate) fn scoring(scores: Vec<RerankScore>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                scores,
                fail: false,
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RerankProvider for FakeRerank {
        async fn rerank(
            &self,
            _query: &str,
            _documents: &[String],
        ) -> Result<RerankResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Provider {
                    provider: "fake",
                    message: "unavailable".to_string(),
                });
            }
            Ok(RerankResponse {
                scores: self.scores.clone(),
                total_tokens: 42,
            })
        }

        fn model(&self) -> &str {
            "fake-rerank"
        }
    }

    pub(crate) fn score(index: usize, relevance_score: f32) -> RerankScore {
        RerankScore {
            index,
            relevance_score,
        }
    }

    fn inputs() -> Vec<SearchResult> {
        vec![result("a", 0.03), result("b", 0.02), result("c", 0.01)]
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[tokio::test]
    async fn reorders_and_applies_cutoff() {
        let provider = Arc::new(FakeRerank {
            calls: AtomicUsize::new(0),
            scores: vec![score(2, 0.91), score(0, 0.64), score(1, 0.12)],
            fail: false,
        });
        let out = Reranker::new(provider.clone()).rerank("q", inputs()).await;

        assert_eq!(ids(&out.results), vec!["c", "a"]);
        assert_eq!(out.results[0].rerank_score, Some(0.91));
        // Fields other than the rerank score survive the remap.
        assert_eq!(out.results[0].score, 0.01);
        assert_eq!(out.results[0].content, "content of c");
        assert_eq!(out.usage.unwrap().total_tokens, 42);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn provider_failure_keeps_input() {
        let provider = Arc::new(FakeRerank {
            calls: AtomicUsize::new(0),
            scores: Vec::new(),
            fail: true,
        });
        let out = Reranker::new(provider).rerank("q", inputs()).await;
        assert_eq!(out.results, inputs());
        assert!(out.usage.is_none());
    }

    #[tokio::test]
    async fn passthrough_without_provider() {
        let reranker = Reranker::passthrough();
        assert!(!reranker.is_enabled());
        let out = reranker.rerank("q", inputs()).await;
        assert_eq!(out.results, inputs());
    }

    #[tokio::test]
    async fn empty_input_skips_provider() {
        let provider = Arc::new(FakeRerank {
            calls: AtomicUsize::new(0),
            scores: Vec::new(),
            fail: false,
        });
        let out =
            Reranker::new(provider.clone()).rerank("q", Vec::new()).await;
        assert!(out.results.is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unknown_and_duplicate_indices_are_ignored() {
        let scored = apply_scores(
            inputs(),
            &[score(7, 0.99), score(1, 0.8), score(1, 0.7)],
            0.5,
        );
        assert_eq!(ids(&scored), vec!["b"]);
        assert_eq!(scored[0].rerank_score, Some(0.8));
    }

    #[test]
    fn parses_voyage_response() {
        let parsed: VoyageRerankResponse = serde_json::from_str(
            r#"{"object":"list","data":[{"relevance_score":0.8,"index":1}],
                "model":"rerank-2.5","usage":{"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(parsed.data[0].index, 1);
        assert_eq!(parsed.usage.unwrap().total_tokens, 12);
    }
}
