//! Incremental embedding indexer.
//!
//! Re-running over the same chunk set is safe: chunks that already carry an
//! embedding for identical content are skipped, so a run interrupted by a
//! failing batch picks up where it left off.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::Serialize;

use crate::{
    doc_id::content_hash,
    embedding::{EmbeddingProvider, InputKind},
    error::Result,
    incremental::{Pending, diff_chunks},
    ingestion::{SourceChunk, group_chunks},
    store::{ChunkRecord, ChunkWrite, IndexStore, record_best_effort},
    usage::{Operation, TokenUsage, UsageDetail},
};

/// Chunks per embedding request.
pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerConfig {
    pub batch_size: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexReport {
    pub documents: usize,
    /// New chunks embedded.
    pub inserted: usize,
    /// Known chunks (re-)embedded: previously unembedded or edited.
    pub updated: usize,
    /// Chunks already embedded with identical content.
    pub skipped: usize,
    /// Skipped chunks whose line range or heading moved; rows rewritten.
    pub relocated: usize,
    /// Chunks in failed batches. They are stored without an embedding.
    pub failed: usize,
    pub batches: usize,
    /// 0-based indices of the batches that failed.
    pub failed_batches: Vec<usize>,
    pub embedding_tokens: u64,
}

impl IndexReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

/// Progress notification, sent after each batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub batch_index: usize,
    pub total_batches: usize,
    pub chunks: usize,
    pub ok: bool,
}

pub struct Indexer {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    config: IndexerConfig,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            store,
            embedder,
            config: IndexerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn index(&self, chunks: Vec<SourceChunk>) -> Result<IndexReport> {
        self.index_with_progress(chunks, |_| {}).await
    }

    /// Index `chunks`, calling `progress` after every batch.
    ///
    /// Store errors while writing documents are fatal. Errors inside a batch
    /// are logged, counted in the report and the run moves on.
    pub async fn index_with_progress<F>(
        &self,
        chunks: Vec<SourceChunk>,
        mut progress: F,
    ) -> Result<IndexReport>
    where
        F: FnMut(BatchProgress),
    {
        let mut report = IndexReport::default();
        let groups = group_chunks(chunks);

        // Documents first, so every chunk has a parent row.
        let mut document_ids: HashMap<String, u64> = HashMap::new();
        let mut ordered = Vec::new();
        for group in groups {
            let record = self
                .store
                .upsert_document(group.meta, group.total_chunks)
                .await?;
            document_ids.insert(record.meta.source_path.clone(), record.id);
            ordered.extend(group.chunks);
            report.documents += 1;
        }

        let ids: Vec<String> = ordered.iter().map(|c| c.id.clone()).collect();
        let known = self.store.chunk_states(&ids).await?;
        let diff = diff_chunks(ordered, &known);
        report.skipped = diff.skipped.len() + diff.relocated.len();
        report.relocated = diff.relocated.len();
        tracing::info!(
            documents = report.documents,
            new = diff.new_count(),
            stale = diff.stale_count(),
            skipped = report.skipped,
            relocated = report.relocated,
            "planned indexing run"
        );

        // Same content, so the stored embedding stays valid.
        if !diff.relocated.is_empty() {
            let writes = diff
                .relocated
                .iter()
                .filter_map(|c| chunk_write(c, &document_ids, None))
                .collect();
            self.store.upsert_chunks(writes).await?;
        }

        let batch_size = self.config.batch_size.max(1);
        let total_batches = diff.queued.len().div_ceil(batch_size);
        report.batches = total_batches;

        for (batch_index, batch) in diff.queued.chunks(batch_size).enumerate() {
            let ok = self
                .index_batch(batch_index, batch, &document_ids, &mut report)
                .await;
            if !ok {
                report.failed += batch.len();
                report.failed_batches.push(batch_index);
            }
            progress(BatchProgress {
                batch_index,
                total_batches,
                chunks: batch.len(),
                ok,
            });
        }

        tracing::info!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "indexing finished"
        );
        Ok(report)
    }

    /// Embed and store one batch. Returns whether it succeeded.
    async fn index_batch(
        &self,
        batch_index: usize,
        batch: &[(SourceChunk, Pending)],
        document_ids: &HashMap<String, u64>,
        report: &mut IndexReport,
    ) -> bool {
        let texts: Vec<String> =
            batch.iter().map(|(c, _)| c.chunk.content.clone()).collect();

        let embedded =
            self.embedder.embed_batch(&texts, InputKind::Document).await;
        let embeddings = match embedded {
            Ok(embeddings) => embeddings,
            Err(e) => {
                tracing::warn!(
                    batch = batch_index,
                    error = %e,
                    "embedding batch failed"
                );
                // Store the rows anyway so lexical search sees them; the
                // next run embeds them.
                let writes = batch
                    .iter()
                    .filter_map(|(c, _)| chunk_write(c, document_ids, None))
                    .collect();
                if let Err(e) = self.store.upsert_chunks(writes).await {
                    tracing::warn!(
                        batch = batch_index,
                        error = %e,
                        "failed to store unembedded chunks"
                    );
                }
                return false;
            }
        };

        let writes: Vec<ChunkWrite> = batch
            .iter()
            .zip(embeddings.vectors)
            .filter_map(|((c, _), v)| chunk_write(c, document_ids, Some(v)))
            .collect();
        if let Err(e) = self.store.upsert_chunks(writes).await {
            tracing::warn!(
                batch = batch_index,
                error = %e,
                "failed to store batch"
            );
            return false;
        }

        for (_, pending) in batch {
            match pending {
                Pending::New => report.inserted += 1,
                Pending::Stale => report.updated += 1,
            }
        }
        report.embedding_tokens += embeddings.total_tokens;

        let usage = TokenUsage::new(
            Operation::Embedding,
            self.embedder.model(),
            embeddings.total_tokens,
            UsageDetail::EmbeddingBatch {
                batch_index,
                chunk_ids: batch.iter().map(|(c, _)| c.id.clone()).collect(),
            },
        );
        record_best_effort(self.store.as_ref(), usage).await;
        tracing::debug!(
            batch = batch_index,
            chunks = batch.len(),
            "stored batch"
        );
        true
    }
}

fn chunk_write(
    chunk: &SourceChunk,
    document_ids: &HashMap<String, u64>,
    embedding: Option<Vec<f32>>,
) -> Option<ChunkWrite> {
    let source = &chunk.document.source_path;
    let Some(&document_id) = document_ids.get(source) else {
        tracing::warn!(chunk = %chunk.id, "chunk without a document row");
        return None;
    };
    let now = Utc::now();
    let c = &chunk.chunk;
    Some(ChunkWrite {
        record: ChunkRecord {
            id: chunk.id.clone(),
            document_id,
            content: c.content.clone(),
            chunk_index: c.index,
            start_line: c.lines.start,
            end_line: c.lines.end,
            heading: c.heading.clone(),
            character_count: c.character_count,
            word_count: c.word_count,
            content_hash: content_hash(&c.content),
            created_at: now,
            updated_at: now,
        },
        embedding,
    })
}
