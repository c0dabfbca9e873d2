//! The persistent index boundary.
//!
//! [`IndexStore`] is what the indexer and the retriever talk to. The local
//! implementation lives in [`crate::local_store`]; tests and alternative
//! backends can provide their own.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    chunking::{Heading, LineRange},
    error::Result,
    usage::TokenUsage,
};

/// Document-level metadata as produced by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    /// Stable source identifier, the path relative to the corpus root.
    pub source_path: String,
    pub title: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub page_type: Option<String>,
    #[serde(default)]
    pub sidebar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: u64,
    #[serde(flatten)]
    pub meta: DocumentMeta,
    pub total_chunks: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted chunk row. The embedding is stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub document_id: u64,
    pub content: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub heading: Option<Heading>,
    pub character_count: usize,
    pub word_count: usize,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk upsert. Without an embedding, an existing embedding is kept only
/// if the content is unchanged.
#[derive(Debug, Clone)]
pub struct ChunkWrite {
    pub record: ChunkRecord,
    pub embedding: Option<Vec<f32>>,
}

/// What the store already knows about a chunk id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    pub content_hash: String,
    pub has_embedding: bool,
    /// Stored position, which can drift while the content stays the same.
    pub lines: LineRange,
    pub heading: Option<Heading>,
}

/// One row of a ranked store query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk: ChunkRecord,
    pub document: DocumentRecord,
    /// Cosine similarity for the dense leg, BM25 score for the sparse leg.
    pub score: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: u64,
    pub chunks: u64,
    pub embedded_chunks: u64,
    pub usage_records: u64,
}

/// Persistent index of documents, chunks and their embeddings.
///
/// Implementations must make each call atomic: a chunk row and its
/// embedding become visible together.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or update a document, reusing the existing row for the same
    /// source path. Chunks at or beyond `total_chunks` are removed.
    async fn upsert_document(
        &self,
        meta: DocumentMeta,
        total_chunks: usize,
    ) -> Result<DocumentRecord>;

    /// Known state for each of `ids`; unknown ids are absent from the map.
    async fn chunk_states(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkState>>;

    /// Insert or overwrite chunk rows (and embeddings) in one transaction.
    async fn upsert_chunks(&self, chunks: Vec<ChunkWrite>) -> Result<()>;

    /// The `k` embedded chunks closest to `query` by cosine similarity,
    /// best first.
    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// The `k` best chunks for an OR of `terms` under BM25, best first.
    async fn lexical(
        &self,
        terms: &[String],
        k: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Delete a document and everything hanging off it. Returns whether it
    /// existed.
    async fn delete_document(&self, source_path: &str) -> Result<bool>;

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>>;

    async fn record_usage(&self, usage: TokenUsage) -> Result<()>;

    async fn list_usage(&self) -> Result<Vec<TokenUsage>>;

    async fn stats(&self) -> Result<StoreStats>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// Record `usage`, logging instead of failing. Usage accounting must never
/// fail the operation it describes.
pub async fn record_best_effort(store: &dyn IndexStore, usage: TokenUsage) {
    let operation = usage.operation;
    if let Err(e) = store.record_usage(usage).await {
        tracing::warn!(%operation, error = %e, "failed to record token usage");
    }
}
