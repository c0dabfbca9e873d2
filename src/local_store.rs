//! [`IndexStore`] backed by a redb database and a tantivy index on local
//! disk.
//!
//! Both engines are synchronous; every call runs on the blocking pool.
//! The tantivy writer is created on the first write so a process that only
//! queries never takes the index writer lock.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tantivy::IndexWriter;

use crate::{
    chunk_db::ChunkDb,
    data_dir::DataDir,
    error::{Error, Result},
    store::{
        ChunkState,
        ChunkWrite,
        DocumentMeta,
        DocumentRecord,
        IndexStore,
        SearchHit,
        StoreStats,
    },
    tantivy_index::{LexicalIndex, WRITER_BUDGET},
    usage::TokenUsage,
    vector::{self, EMBEDDING_DIMENSION},
};

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    db: ChunkDb,
    lexical: LexicalIndex,
    writer: Mutex<Option<IndexWriter>>,
    writer_budget: usize,
}

impl Inner {
    /// Run `f` with the lexical writer and commit afterwards.
    fn with_writer<T>(
        &self,
        f: impl FnOnce(&LexicalIndex, &IndexWriter) -> Result<T>,
    ) -> Result<T> {
        let mut guard =
            self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = match guard.take() {
            Some(writer) => writer,
            None => self.lexical.writer(self.writer_budget)?,
        };
        let writer = guard.insert(writer);

        match f(&self.lexical, writer) {
            Ok(out) => {
                writer.commit()?;
                Ok(out)
            }
            Err(e) => {
                if let Err(rollback) = writer.rollback() {
                    tracing::warn!(
                        error = %rollback,
                        "lexical rollback failed"
                    );
                }
                Err(e)
            }
        }
    }
}

impl LocalStore {
    /// Open the store inside a resolved data directory.
    pub fn open(data_dir: &DataDir) -> Result<Self> {
        Self::open_at(
            &data_dir.store_db(),
            &data_dir.lexical_dir()?,
            EMBEDDING_DIMENSION,
        )
    }

    /// Open the store from explicit paths and embedding dimension.
    pub fn open_at(
        db_path: &Path,
        lexical_dir: &Path,
        dimension: usize,
    ) -> Result<Self> {
        let db = ChunkDb::open(db_path, dimension)?;
        let lexical = LexicalIndex::open(lexical_dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                lexical,
                writer: Mutex::new(None),
                writer_budget: WRITER_BUDGET,
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.inner.db.dimension()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner)).await?
    }
}

#[async_trait]
impl IndexStore for LocalStore {
    async fn upsert_document(
        &self,
        meta: DocumentMeta,
        total_chunks: usize,
    ) -> Result<DocumentRecord> {
        self.blocking(move |inner| {
            let (record, pruned) =
                inner.db.upsert_document(meta, total_chunks)?;
            if !pruned.is_empty() {
                tracing::debug!(
                    source = %record.meta.source_path,
                    pruned = pruned.len(),
                    "removed chunks past the new end of document"
                );
                inner.with_writer(|lexical, writer| {
                    for id in &pruned {
                        lexical.delete_chunk(writer, id);
                    }
                    Ok(())
                })?;
            }
            Ok(record)
        })
        .await
    }

    async fn chunk_states(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkState>> {
        let ids = ids.to_vec();
        self.blocking(move |inner| inner.db.chunk_states(&ids)).await
    }

    async fn upsert_chunks(&self, chunks: Vec<ChunkWrite>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        self.blocking(move |inner| {
            let mut sources: HashMap<u64, String> = HashMap::new();
            for write in &chunks {
                let id = write.record.document_id;
                if !sources.contains_key(&id) {
                    let source = inner
                        .db
                        .get_document(id)?
                        .map(|doc| doc.meta.source_path)
                        .ok_or_else(|| Error::NotFound {
                            kind: "document",
                            name: write.record.id.clone(),
                        })?;
                    sources.insert(id, source);
                }
            }

            // Lexical entries go first. If they fail, redb is untouched and
            // the chunks stay queued for the next run.
            inner.with_writer(|lexical, writer| {
                for write in &chunks {
                    let source = &sources[&write.record.document_id];
                    lexical.add_chunk(
                        writer,
                        &write.record.id,
                        source,
                        &write.record.content,
                    )?;
                }
                Ok(())
            })?;
            inner.db.write_chunks(&chunks)
        })
        .await
    }

    async fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension() {
            return Err(Error::InvalidEmbedding(format!(
                "query has dimension {}, expected {}",
                query.len(),
                self.dimension()
            )));
        }
        let query = query.to_vec();
        self.blocking(move |inner| {
            let candidates = inner.db.embeddings()?;
            let ranked =
                vector::top_k(&query, candidates, k, f32::NEG_INFINITY);
            inner.db.hydrate(ranked)
        })
        .await
    }

    async fn lexical(
        &self,
        terms: &[String],
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let terms = terms.to_vec();
        self.blocking(move |inner| {
            let ranked = inner.lexical.search(&terms, k)?;
            inner.db.hydrate(ranked)
        })
        .await
    }

    async fn delete_document(&self, source_path: &str) -> Result<bool> {
        let source_path = source_path.to_string();
        self.blocking(move |inner| {
            let Some(removed) = inner.db.delete_document(&source_path)? else {
                return Ok(false);
            };
            inner.with_writer(|lexical, writer| {
                lexical.delete_source(writer, &source_path);
                Ok(())
            })?;
            tracing::debug!(
                source = %source_path,
                chunks = removed.len(),
                "deleted document"
            );
            Ok(true)
        })
        .await
    }

    async fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        self.blocking(|inner| inner.db.list_documents()).await
    }

    async fn record_usage(&self, usage: TokenUsage) -> Result<()> {
        self.blocking(move |inner| inner.db.record_usage(&usage).map(|_| ()))
            .await
    }

    async fn list_usage(&self) -> Result<Vec<TokenUsage>> {
        self.blocking(|inner| inner.db.list_usage()).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.blocking(|inner| inner.db.stats()).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.blocking(move |inner| inner.db.get_setting(&key)).await
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.blocking(move |inner| inner.db.set_setting(&key, &value))
            .await
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("db", &self.inner.db)
            .finish_non_exhaustive()
    }
}
