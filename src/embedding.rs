//! Dense embedding providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    http::ApiClient,
    vector,
};

/// Default Voyage embedding model.
pub const DEFAULT_EMBED_MODEL: &str = "voyage-code-3";

/// Whether text is being embedded for storage or as a search query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Document,
    Query,
}

/// Vectors for a batch, in input order.
#[derive(Debug, Clone, PartialEq)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    pub total_tokens: u64,
}

/// Turns text into fixed-dimension vectors.
///
/// Implementations must fail rather than return zero vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_batch(
        &self,
        texts: &[String],
        kind: InputKind,
    ) -> Result<Embeddings>;

    async fn embed(&self, text: &str, kind: InputKind) -> Result<Vec<f32>> {
        let mut batch = self.embed_batch(&[text.to_string()], kind).await?;
        batch
            .vectors
            .pop()
            .ok_or_else(|| {
                Error::InvalidEmbedding("empty response".to_string())
            })
    }

    /// Model identifier, recorded with token usage.
    fn model(&self) -> &str;
}

/// Voyage AI `/embeddings` client.
#[derive(Debug, Clone)]
pub struct VoyageEmbedder {
    client: ApiClient,
    model: String,
    dimension: usize,
}

impl VoyageEmbedder {
    pub fn new(client: ApiClient, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            dimension: vector::EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    input_type: InputKind,
    output_dimension: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl EmbeddingResponse {
    /// Restore input order and validate the vectors.
    fn into_embeddings(
        mut self,
        expected: usize,
        dimension: usize,
    ) -> Result<Embeddings> {
        self.data.sort_by_key(|d| d.index);
        let vectors: Vec<Vec<f32>> =
            self.data.into_iter().map(|d| d.embedding).collect();
        vector::validate(&vectors, expected, dimension)?;
        Ok(Embeddings {
            vectors,
            total_tokens: self.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for VoyageEmbedder {
    async fn embed_batch(
        &self,
        texts: &[String],
        kind: InputKind,
    ) -> Result<Embeddings> {
        if texts.is_empty() {
            return Ok(Embeddings {
                vectors: Vec::new(),
                total_tokens: 0,
            });
        }

        let request = EmbeddingRequest {
            input: texts,
            model: &self.model,
            input_type: kind,
            output_dimension: self.dimension,
        };
        let response: EmbeddingResponse =
            self.client.post_json("embeddings", &request).await?;
        let embeddings = response.into_embeddings(texts.len(), self.dimension)?;
        tracing::debug!(
            model = %self.model,
            count = texts.len(),
            tokens = embeddings.total_tokens,
            "embedded batch"
        );
        Ok(embeddings)
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Deterministic in-process embedder over 4-dimensional vectors.
    ///
    /// Queries embed to `query_vector`; documents embed to a vector derived
    /// from their length. Call number `fail_on_call` (0-based) fails.
    pub(crate) struct FakeEmbedder {
        pub calls: AtomicUsize,
        pub fail_on_call: Option<usize>,
        pub query_vector: Vec<f32>,
    }

    impl FakeEmbedder {
        pub(crate) fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                query_vector: vec![1.0, 0.1, 0.0, 0.0],
            }
        }

        pub(crate) fn failing_on(call: usize) -> Self {
            Self {
                fail_on_call: Some(call),
                ..Self::new()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FakeEmbedder {
        async fn embed_batch(
            &self,
            texts: &[String],
            kind: InputKind,
        ) -> Result<Embeddings> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(Error::Provider {
                    provider: "fake",
                    message: "rate limited".to_string(),
                });
            }
            let vectors = texts
                .iter()
                .map(|t| match kind {
                    InputKind::Query => self.query_vector.clone(),
                    InputKind::Document => {
                        vec![1.0, (t.len() % 10) as f32, 0.5, 0.0]
                    }
                })
                .collect();
            Ok(Embeddings {
                vectors,
                total_tokens: texts
                    .iter()
                    .map(|t| t.split_whitespace().count() as u64)
                    .sum(),
            })
        }

        fn model(&self) -> &str {
            "fake-embed"
        }
    }

    fn response(json: &str) -> EmbeddingResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn response_is_reordered_by_index() {
        let r = response(
            r#"{"object":"list","data":[
                {"object":"embedding","embedding":[0.0,1.0],"index":1},
                {"object":"embedding","embedding":[1.0,0.0],"index":0}
            ],"model":"voyage-code-3","usage":{"total_tokens":7}}"#,
        );
        let e = r.into_embeddings(2, 2).unwrap();
        assert_eq!(e.vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(e.total_tokens, 7);
    }

    #[test]
    fn short_or_zero_responses_fail() {
        let short = response(r#"{"data":[{"embedding":[1.0,0.0],"index":0}]}"#);
        assert!(matches!(
            short.into_embeddings(2, 2),
            Err(Error::InvalidEmbedding(_))
        ));

        let zero = response(r#"{"data":[{"embedding":[0.0,0.0],"index":0}]}"#);
        assert!(zero.into_embeddings(1, 2).is_err());

        let wrong_dim = response(r#"{"data":[{"embedding":[1.0],"index":0}]}"#);
        assert!(wrong_dim.into_embeddings(1, 2).is_err());
    }

    #[test]
    fn request_serializes_input_type() {
        let texts = vec!["hello".to_string()];
        let body = serde_json::to_value(EmbeddingRequest {
            input: &texts,
            model: DEFAULT_EMBED_MODEL,
            input_type: InputKind::Query,
            output_dimension: 1024,
        })
        .unwrap();
        assert_eq!(body["input_type"], "query");
        assert_eq!(body["model"], "voyage-code-3");
        assert_eq!(body["input"][0], "hello");
    }

    #[tokio::test]
    async fn embed_uses_single_item_batch() {
        let fake = FakeEmbedder::new();
        let v = fake.embed("anything", InputKind::Query).await.unwrap();
        assert_eq!(v, fake.query_vector);
        assert_eq!(fake.calls(), 1);
    }
}
