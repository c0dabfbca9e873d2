use std::collections::HashMap;

use crate::{doc_id::content_hash, ingestion::SourceChunk, store::ChunkState};

/// Why a chunk needs to be embedded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pending {
    /// Unknown to the store.
    New,
    /// Stored, but without an embedding or with different content.
    Stale,
}

/// Result of comparing a document's chunks against the stored state.
#[derive(Debug, Default)]
pub struct ChunkDiff {
    /// Chunks to embed, in input order.
    pub queued: Vec<(SourceChunk, Pending)>,
    /// Chunks that already carry an embedding for identical content.
    pub skipped: Vec<SourceChunk>,
    /// Embedded chunks with identical content whose line range or heading
    /// moved. Their rows are rewritten, their embeddings kept.
    pub relocated: Vec<SourceChunk>,
}

impl ChunkDiff {
    pub fn new_count(&self) -> usize {
        self.queued
            .iter()
            .filter(|(_, p)| *p == Pending::New)
            .count()
    }

    pub fn stale_count(&self) -> usize {
        self.queued.len() - self.new_count()
    }
}

/// Split `chunks` into those that must be (re-)embedded and those that can
/// be skipped.
///
/// A chunk is skipped only when its id is known, it has an embedding, and
/// its content hash is unchanged. A skipped chunk whose stored position no
/// longer matches lands in `relocated` instead of `skipped`.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use docrag::incremental::diff_chunks;
///
/// let diff = diff_chunks(Vec::new(), &HashMap::new());
/// assert!(diff.queued.is_empty());
/// assert!(diff.skipped.is_empty());
/// assert!(diff.relocated.is_empty());
/// ```
pub fn diff_chunks(
    chunks: Vec<SourceChunk>,
    known: &HashMap<String, ChunkState>,
) -> ChunkDiff {
    let mut diff = ChunkDiff::default();

    for chunk in chunks {
        match known.get(&chunk.id) {
            None => diff.queued.push((chunk, Pending::New)),
            Some(state)
                if state.has_embedding
                    && state.content_hash
                        == content_hash(&chunk.chunk.content) =>
            {
                if state.lines == chunk.chunk.lines
                    && state.heading == chunk.chunk.heading
                {
                    diff.skipped.push(chunk);
                } else {
                    diff.relocated.push(chunk);
                }
            }
            Some(_) => diff.queued.push((chunk, Pending::Stale)),
        }
    }

    diff
}
