use std::{collections::HashMap, path::Path};

use chrono::Utc;
use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    ReadableTableMetadata,
    TableDefinition,
};

use crate::{
    chunking::LineRange,
    doc_id::DocumentId,
    error::{Error, Result},
    store::{
        ChunkRecord,
        ChunkState,
        ChunkWrite,
        DocumentMeta,
        DocumentRecord,
        SearchHit,
        StoreStats,
    },
    usage::TokenUsage,
    vector,
};

const DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("documents");
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const EMBEDDINGS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("embeddings");
const TOKEN_USAGE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("token_usage");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

/// Synchronous redb storage for documents, chunks, embeddings, usage
/// records and settings.
///
/// Rows are JSON encoded; embeddings use the binary layout of
/// [`vector::encode`].
pub struct ChunkDb {
    db: Database,
    dimension: usize,
}

impl ChunkDb {
    /// Open or create the database at `path`.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrag::chunk_db::ChunkDb;
    ///
    /// let db = ChunkDb::open(&tmp.path().join("docrag.db"), 1024).unwrap();
    /// assert_eq!(db.stats().unwrap().documents, 0);
    /// ```
    pub fn open(path: &Path, dimension: usize) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(EMBEDDINGS)?;
        txn.open_table(TOKEN_USAGE)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    // -- Documents --

    /// Insert or update a document keyed by its source path.
    ///
    /// Returns the stored record and the ids of chunks removed because
    /// they fall outside the new chunk count.
    pub fn upsert_document(
        &self,
        meta: DocumentMeta,
        total_chunks: usize,
    ) -> Result<(DocumentRecord, Vec<String>)> {
        let id = DocumentId::new(&meta.source_path).numeric;
        let now = Utc::now();

        let txn = self.db.begin_write()?;
        let (record, pruned) = {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut embeddings = txn.open_table(EMBEDDINGS)?;

            let created_at = match documents.get(id)? {
                Some(guard) => {
                    serde_json::from_slice::<DocumentRecord>(guard.value())?
                        .created_at
                }
                None => now,
            };
            let record = DocumentRecord {
                id,
                meta,
                total_chunks,
                created_at,
                updated_at: now,
            };
            documents.insert(id, serde_json::to_vec(&record)?.as_slice())?;

            let pruned: Vec<String> =
                owned_chunks(&chunks, &record.meta.source_path, id)?
                    .into_iter()
                    .filter(|(_, index)| *index >= total_chunks)
                    .map(|(chunk_id, _)| chunk_id)
                    .collect();
            for chunk_id in &pruned {
                chunks.remove(chunk_id.as_str())?;
                embeddings.remove(chunk_id.as_str())?;
            }
            (record, pruned)
        };
        txn.commit()?;
        Ok((record, pruned))
    }

    pub fn get_document(&self, id: u64) -> Result<Option<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn list_documents(&self) -> Result<Vec<DocumentRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            result.push(serde_json::from_slice(v.value())?);
        }
        result.sort_by(|a: &DocumentRecord, b| {
            a.meta.source_path.cmp(&b.meta.source_path)
        });
        Ok(result)
    }

    /// Remove a document with its chunks and embeddings.
    ///
    /// Returns the removed chunk ids, or `None` if the document was unknown.
    pub fn delete_document(
        &self,
        source_path: &str,
    ) -> Result<Option<Vec<String>>> {
        let id = DocumentId::new(source_path).numeric;

        let txn = self.db.begin_write()?;
        let removed = {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut embeddings = txn.open_table(EMBEDDINGS)?;

            if documents.remove(id)?.is_none() {
                None
            } else {
                let ids: Vec<String> = owned_chunks(&chunks, source_path, id)?
                    .into_iter()
                    .map(|(chunk_id, _)| chunk_id)
                    .collect();
                for chunk_id in &ids {
                    chunks.remove(chunk_id.as_str())?;
                    embeddings.remove(chunk_id.as_str())?;
                }
                Some(ids)
            }
        };
        txn.commit()?;
        Ok(removed)
    }

    // -- Chunks --

    pub fn chunk_states(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, ChunkState>> {
        let txn = self.db.begin_read()?;
        let chunks = txn.open_table(CHUNKS)?;
        let embeddings = txn.open_table(EMBEDDINGS)?;

        let mut states = HashMap::with_capacity(ids.len());
        for id in ids {
            let Some(guard) = chunks.get(id.as_str())? else {
                continue;
            };
            let record: ChunkRecord = serde_json::from_slice(guard.value())?;
            let has_embedding = embeddings.get(id.as_str())?.is_some();
            states.insert(
                id.clone(),
                ChunkState {
                    content_hash: record.content_hash,
                    has_embedding,
                    lines: LineRange {
                        start: record.start_line,
                        end: record.end_line,
                    },
                    heading: record.heading,
                },
            );
        }
        Ok(states)
    }

    /// Upsert chunk rows and embeddings in one write transaction.
    ///
    /// An existing row keeps its `created_at`. A write without an embedding
    /// drops a stored embedding whose content hash no longer matches.
    pub fn write_chunks(&self, writes: &[ChunkWrite]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        for write in writes {
            if let Some(embedding) = &write.embedding
                && embedding.len() != self.dimension
            {
                return Err(Error::InvalidEmbedding(format!(
                    "chunk {} has dimension {}, expected {}",
                    write.record.id,
                    embedding.len(),
                    self.dimension
                )));
            }
        }

        let txn = self.db.begin_write()?;
        {
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut embeddings = txn.open_table(EMBEDDINGS)?;

            for write in writes {
                let id = write.record.id.as_str();
                let previous: Option<ChunkRecord> = match chunks.get(id)? {
                    Some(guard) => Some(serde_json::from_slice(guard.value())?),
                    None => None,
                };

                let mut record = write.record.clone();
                if let Some(prev) = &previous {
                    record.created_at = prev.created_at;
                }
                chunks.insert(id, serde_json::to_vec(&record)?.as_slice())?;

                match &write.embedding {
                    Some(embedding) => {
                        embeddings
                            .insert(id, vector::encode(embedding).as_slice())?;
                    }
                    None => {
                        let stale = previous.is_some_and(|prev| {
                            prev.content_hash != record.content_hash
                        });
                        if stale {
                            embeddings.remove(id)?;
                        }
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(CHUNKS)?;
        match table.get(id)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_embedding(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.get(id)?.and_then(|guard| vector::decode(guard.value())))
    }

    /// Every stored embedding of the expected dimension.
    pub fn embeddings(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            match vector::decode(v.value()) {
                Some(data) if data.len() == self.dimension => {
                    result.push((k.value().to_string(), data));
                }
                _ => {
                    tracing::warn!(chunk = k.value(), "skipping bad embedding")
                }
            }
        }
        Ok(result)
    }

    /// Resolve scored chunk ids to chunk and document rows, keeping order.
    /// Ids that no longer exist are skipped.
    pub fn hydrate(
        &self,
        scored: Vec<(String, f32)>,
    ) -> Result<Vec<SearchHit>> {
        let txn = self.db.begin_read()?;
        let chunks = txn.open_table(CHUNKS)?;
        let documents = txn.open_table(DOCUMENTS)?;
        let mut doc_cache: HashMap<u64, DocumentRecord> = HashMap::new();

        let mut hits = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            let Some(guard) = chunks.get(id.as_str())? else {
                tracing::debug!(chunk = %id, "stale index entry");
                continue;
            };
            let chunk: ChunkRecord = serde_json::from_slice(guard.value())?;

            let document = match doc_cache.get(&chunk.document_id) {
                Some(doc) => doc.clone(),
                None => {
                    let Some(guard) = documents.get(chunk.document_id)? else {
                        tracing::debug!(chunk = %id, "chunk without document");
                        continue;
                    };
                    let doc: DocumentRecord =
                        serde_json::from_slice(guard.value())?;
                    doc_cache.insert(chunk.document_id, doc.clone());
                    doc
                }
            };

            hits.push(SearchHit {
                chunk,
                document,
                score,
            });
        }
        Ok(hits)
    }

    // -- Token usage --

    pub fn record_usage(&self, usage: &TokenUsage) -> Result<u64> {
        let txn = self.db.begin_write()?;
        let key = {
            let mut table = txn.open_table(TOKEN_USAGE)?;
            let key = match table.last()? {
                Some((k, _v)) => k.value() + 1,
                None => 0,
            };
            table.insert(key, serde_json::to_vec(usage)?.as_slice())?;
            key
        };
        txn.commit()?;
        Ok(key)
    }

    pub fn list_usage(&self) -> Result<Vec<TokenUsage>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(TOKEN_USAGE)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            match serde_json::from_slice(v.value()) {
                Ok(usage) => result.push(usage),
                Err(e) => {
                    tracing::warn!(
                        key = k.value(),
                        error = %e,
                        "unreadable usage record"
                    );
                }
            }
        }
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let txn = self.db.begin_read()?;
        Ok(StoreStats {
            documents: txn.open_table(DOCUMENTS)?.len()?,
            chunks: txn.open_table(CHUNKS)?.len()?,
            embedded_chunks: txn.open_table(EMBEDDINGS)?.len()?,
            usage_records: txn.open_table(TOKEN_USAGE)?.len()?,
        })
    }
}

/// Chunks of one document as `(id, chunk_index)`, found by scanning the
/// `{source_path}_chunk_` key prefix.
fn owned_chunks<T>(
    table: &T,
    source_path: &str,
    document_id: u64,
) -> Result<Vec<(String, usize)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let prefix = format!("{source_path}_chunk_");
    let mut found = Vec::new();
    for entry in table.range(prefix.as_str()..)? {
        let (k, v) = entry?;
        if !k.value().starts_with(&prefix) {
            break;
        }
        let record: ChunkRecord = serde_json::from_slice(v.value())?;
        if record.document_id == document_id {
            found.push((record.id, record.chunk_index));
        }
    }
    Ok(found)
}

impl std::fmt::Debug for ChunkDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkDb")
            .field("dimension", &self.dimension)
            .finish_non_exhaustive()
    }
}
