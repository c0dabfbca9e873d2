//! Turning markdown files into chunk sets ready for the indexer.

use std::{collections::HashMap, path::Path};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    chunking::{self, ChunkCandidate, ChunkingConfig},
    doc_id::chunk_id,
    error::Result,
    frontmatter,
    store::DocumentMeta,
    walker::DiscoveredFile,
};

/// A chunk together with the document it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChunk {
    pub id: String,
    pub document: DocumentMeta,
    pub total_chunks: usize,
    #[serde(flatten)]
    pub chunk: ChunkCandidate,
}

/// Header of a chunk dump written by `docrag chunk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub total_chunks: usize,
    pub generated_at: DateTime<Utc>,
    pub chunking_strategy: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// A serialized chunk set. The indexer accepts one in place of a corpus
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDump {
    pub metadata: DumpMetadata,
    pub chunks: Vec<SourceChunk>,
}

impl ChunkDump {
    pub fn new(chunks: Vec<SourceChunk>, config: &ChunkingConfig) -> Self {
        Self {
            metadata: DumpMetadata {
                total_chunks: chunks.len(),
                generated_at: Utc::now(),
                chunking_strategy: chunking::STRATEGY.to_string(),
                chunk_size: config.chunk_size,
                chunk_overlap: config.overlap,
            },
            chunks,
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// The chunks of one document, in chunk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentBatch {
    pub meta: DocumentMeta,
    pub total_chunks: usize,
    pub chunks: Vec<SourceChunk>,
}

/// Chunk a single markdown document.
///
/// `source_path` is the stable identifier stored with the document; `path`
/// is only used for the file-stem title fallback.
pub fn prepare_document(
    source_path: &str,
    path: &Path,
    raw: &str,
    config: &ChunkingConfig,
) -> Vec<SourceChunk> {
    let parsed = frontmatter::parse(raw);
    let meta = DocumentMeta {
        source_path: source_path.to_string(),
        title: frontmatter::resolve_title(
            &parsed.frontmatter,
            &parsed.body,
            path,
        ),
        slug: frontmatter::resolve_slug(&parsed.frontmatter),
        page_type: parsed.frontmatter.page_type.clone(),
        sidebar: parsed.frontmatter.sidebar.clone(),
    };

    let candidates =
        chunking::chunk_document(raw, &parsed.body, parsed.line_offset, config);
    let total_chunks = candidates.len();
    candidates
        .into_iter()
        .map(|chunk| SourceChunk {
            id: chunk_id(source_path, chunk.index),
            document: meta.clone(),
            total_chunks,
            chunk,
        })
        .collect()
}

/// Read and chunk discovered files in parallel.
///
/// Unreadable files are logged and skipped. Output keeps the order of
/// `files`.
pub fn prepare_files(
    files: &[DiscoveredFile],
    config: &ChunkingConfig,
) -> Vec<SourceChunk> {
    files
        .par_iter()
        .map(|file| match std::fs::read_to_string(&file.absolute_path) {
            Ok(raw) => {
                let chunks = prepare_document(
                    &file.source_path(),
                    &file.relative_path,
                    &raw,
                    config,
                );
                tracing::debug!(
                    source = %file.source_path(),
                    chunks = chunks.len(),
                    "chunked document"
                );
                chunks
            }
            Err(e) => {
                tracing::warn!(
                    path = %file.absolute_path.display(),
                    error = %e,
                    "skipping unreadable file"
                );
                Vec::new()
            }
        })
        .flatten()
        .collect()
}

/// Group a flat chunk list by document, in first-seen document order.
///
/// First-seen order decides the order documents are written in, so it is
/// tracked with an explicit sequence and a position index.
pub fn group_chunks(chunks: Vec<SourceChunk>) -> Vec<DocumentBatch> {
    let mut batches: Vec<DocumentBatch> = Vec::new();
    let mut position: HashMap<String, usize> = HashMap::new();

    for chunk in chunks {
        let slot = match position.get(&chunk.document.source_path) {
            Some(&i) => i,
            None => {
                position.insert(
                    chunk.document.source_path.clone(),
                    batches.len(),
                );
                batches.push(DocumentBatch {
                    meta: chunk.document.clone(),
                    total_chunks: chunk.total_chunks,
                    chunks: Vec::new(),
                });
                batches.len() - 1
            }
        };
        batches[slot].chunks.push(chunk);
    }

    for batch in &mut batches {
        batch.chunks.sort_by_key(|c| c.chunk.index);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    const MDN_PAGE: &str = "---
title: Using the Fetch API
slug: Web/API/Fetch_API/Using_Fetch
page-type: guide
sidebar: apiref
---

The Fetch API provides a JavaScript interface.

## Basic usage

Call fetch() with a URL.
";

    fn prepare(source: &str, raw: &str) -> Vec<SourceChunk> {
        prepare_document(
            source,
            Path::new(source),
            raw,
            &ChunkingConfig::default(),
        )
    }

    #[test]
    fn frontmatter_feeds_document_meta() {
        let chunks = prepare("web/api/fetch_api/index.md", MDN_PAGE);
        assert_eq!(chunks.len(), 1);
        let doc = &chunks[0].document;
        assert_eq!(doc.title, "Using the Fetch API");
        assert_eq!(doc.slug.as_deref(), Some("Web/API/Fetch_API/Using_Fetch"));
        assert_eq!(doc.page_type.as_deref(), Some("guide"));
        assert_eq!(doc.sidebar.as_deref(), Some("apiref"));
        assert_eq!(chunks[0].id, "web/api/fetch_api/index.md_chunk_0");
        assert_eq!(chunks[0].total_chunks, 1);
        assert!(chunks[0].chunk.lines.start > 6);
    }

    #[test]
    fn title_falls_back_to_file_stem() {
        let chunks = prepare("notes/caching.md", "Plain text only.");
        assert_eq!(chunks[0].document.title, "caching");
        assert_eq!(chunks[0].document.slug, None);
    }

    #[test]
    fn empty_body_has_no_chunks() {
        assert!(prepare("empty.md", "---\ntitle: Empty\n---\n\n").is_empty());
    }

    #[test]
    fn prepare_files_reads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.md"), "# A\n\nalpha").unwrap();
        std::fs::write(tmp.path().join("b.md"), "# B\n\nbeta").unwrap();

        let files = crate::walker::discover_files(tmp.path()).unwrap();
        let chunks = prepare_files(&files, &ChunkingConfig::default());
        let ids: Vec<_> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a.md_chunk_0", "b.md_chunk_0"]);
    }

    #[test]
    fn group_keeps_first_seen_order() {
        let long = format!("# Long\n\n{}", "sentence here. ".repeat(200));
        let mut chunks = prepare("z.md", &long);
        let mut a = prepare("a.md", "# A\n\nalpha");
        let z_tail = chunks.split_off(1);
        chunks.append(&mut a);
        chunks.extend(z_tail.into_iter().rev());

        let groups = group_chunks(chunks);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].meta.source_path, "z.md");
        assert_eq!(groups[1].meta.source_path, "a.md");
        let indices: Vec<_> =
            groups[0].chunks.iter().map(|c| c.chunk.index).collect();
        assert_eq!(indices, (0..groups[0].total_chunks).collect::<Vec<_>>());
    }

    #[test]
    fn dump_survives_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("chunks.json");
        let config = ChunkingConfig::default();
        let dump = ChunkDump::new(prepare("fetch.md", MDN_PAGE), &config);
        dump.write(&path).unwrap();

        let restored = ChunkDump::read(&path).unwrap();
        assert_eq!(restored, dump);
        assert_eq!(restored.metadata.chunking_strategy, chunking::STRATEGY);
        assert_eq!(restored.metadata.chunk_overlap, 200);
    }
}
