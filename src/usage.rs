//! Token usage accounting.
//!
//! Every provider call that reports token counts is recorded for cost
//! auditing. Records carry a versioned metadata payload; anything that does
//! not decode as the current version is kept verbatim as
//! [`UsageMetadata::Legacy`] instead of being rejected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Embedding,
    Generation,
    Rerank,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Embedding => "embedding",
            Self::Generation => "generation",
            Self::Rerank => "rerank",
        })
    }
}

/// What a usage record refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UsageDetail {
    /// One embedding batch of the indexer.
    EmbeddingBatch {
        batch_index: usize,
        chunk_ids: Vec<String>,
    },
    /// One answered question.
    Query {
        question: String,
        source_count: usize,
    },
    /// One rerank call over a candidate list.
    Rerank {
        query: String,
        candidate_count: usize,
    },
}

/// Versioned metadata attached to a [`TokenUsage`] record.
#[derive(Debug, Clone, PartialEq)]
pub enum UsageMetadata {
    V1(UsageDetail),
    /// An entry written by an older format, or one that failed to decode.
    Legacy(serde_json::Value),
}

#[derive(Serialize, Deserialize)]
struct Versioned {
    version: u64,
    #[serde(flatten)]
    detail: UsageDetail,
}

impl UsageMetadata {
    pub const CURRENT_VERSION: u64 = 1;

    /// Decode stored metadata, falling back to [`UsageMetadata::Legacy`].
    pub fn from_value(value: serde_json::Value) -> Self {
        match serde_json::from_value::<Versioned>(value.clone()) {
            Ok(v) if v.version == Self::CURRENT_VERSION => Self::V1(v.detail),
            _ => Self::Legacy(value),
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::V1(detail) => serde_json::to_value(Versioned {
                version: Self::CURRENT_VERSION,
                detail: detail.clone(),
            })
            .unwrap_or(serde_json::Value::Null),
            Self::Legacy(raw) => raw.clone(),
        }
    }

    pub fn detail(&self) -> Option<&UsageDetail> {
        match self {
            Self::V1(detail) => Some(detail),
            Self::Legacy(_) => None,
        }
    }
}

impl Serialize for UsageMetadata {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(s)
    }
}

impl<'de> Deserialize<'de> for UsageMetadata {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        serde_json::Value::deserialize(d).map(Self::from_value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub operation: Operation,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub metadata: UsageMetadata,
    pub recorded_at: DateTime<Utc>,
}

impl TokenUsage {
    pub fn new(
        operation: Operation,
        model: impl Into<String>,
        total_tokens: u64,
        detail: UsageDetail,
    ) -> Self {
        Self {
            operation,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens,
            metadata: UsageMetadata::V1(detail),
            recorded_at: Utc::now(),
        }
    }
}

/// Token counts reported by a generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Per-operation totals over a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub records: u64,
    pub embedding_tokens: u64,
    pub generation_tokens: u64,
    pub rerank_tokens: u64,
}

impl UsageTotals {
    pub fn from_records(records: &[TokenUsage]) -> Self {
        records.iter().fold(Self::default(), |mut acc, r| {
            acc.records += 1;
            match r.operation {
                Operation::Embedding => acc.embedding_tokens += r.total_tokens,
                Operation::Generation => {
                    acc.generation_tokens += r.total_tokens
                }
                Operation::Rerank => acc.rerank_tokens += r.total_tokens,
            }
            acc
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn current_version_decodes_typed() {
        let meta = UsageMetadata::V1(UsageDetail::EmbeddingBatch {
            batch_index: 3,
            chunk_ids: vec!["a_chunk_0".into()],
        });
        let value = meta.to_value();
        assert_eq!(value["version"], 1);
        assert_eq!(value["kind"], "embedding_batch");
        assert_eq!(UsageMetadata::from_value(value), meta);
    }

    #[test]
    fn legacy_object_is_preserved() {
        let raw = json!({"batchSize": 100, "chunkIds": ["x_chunk_0"]});
        let meta = UsageMetadata::from_value(raw.clone());
        assert_eq!(meta, UsageMetadata::Legacy(raw));
        assert!(meta.detail().is_none());
    }

    #[test]
    fn opaque_text_and_unknown_versions_are_legacy() {
        let text = json!("{\"batchSize\":100}");
        assert!(matches!(
            UsageMetadata::from_value(text),
            UsageMetadata::Legacy(_)
        ));

        let future = json!({
            "version": 9,
            "kind": "query",
            "question": "q",
            "source_count": 1
        });
        assert!(matches!(
            UsageMetadata::from_value(future),
            UsageMetadata::Legacy(_)
        ));
    }

    #[test]
    fn record_round_trips_through_json() {
        let record = TokenUsage::new(
            Operation::Generation,
            "gpt-4o-mini",
            42,
            UsageDetail::Query {
                question: "what is fetch?".into(),
                source_count: 2,
            },
        );
        let bytes = serde_json::to_vec(&record).unwrap();
        let back: TokenUsage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn totals_split_by_operation() {
        let detail = UsageDetail::Query {
            question: String::new(),
            source_count: 0,
        };
        let records = vec![
            TokenUsage::new(Operation::Embedding, "m", 10, detail.clone()),
            TokenUsage::new(Operation::Embedding, "m", 5, detail.clone()),
            TokenUsage::new(Operation::Generation, "m", 7, detail),
        ];
        let totals = UsageTotals::from_records(&records);
        assert_eq!(totals.records, 3);
        assert_eq!(totals.embedding_tokens, 15);
        assert_eq!(totals.generation_tokens, 7);
        assert_eq!(totals.rerank_tokens, 0);
    }
}
