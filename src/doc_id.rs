/// A stable document identifier derived from the document's source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentId {
    /// The numeric ID used as the key in redb tables.
    pub numeric: u64,
    /// The short hex string for human display (e.g. "a1b2c3").
    pub short: String,
}

impl DocumentId {
    /// Generate a stable document ID from a source path.
    ///
    /// The first eight bytes of the blake3 digest are used, so the value is
    /// identical across platforms and runs.
    pub fn new(source_path: &str) -> Self {
        Self::from_numeric(Self::hash_path(source_path))
    }

    pub fn from_numeric(numeric: u64) -> Self {
        Self {
            numeric,
            short: Self::short_hex(numeric, 6),
        }
    }

    fn hash_path(source_path: &str) -> u64 {
        let digest = blake3::hash(source_path.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_be_bytes(bytes)
    }

    fn short_hex(value: u64, len: usize) -> String {
        let full = format!("{value:016x}");
        full[..len].to_string()
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short)
    }
}

/// Identifier of a chunk: `{source_path}_chunk_{index}`.
///
/// Re-chunking unchanged content reproduces the same ids, which is what
/// makes indexing resumable.
pub fn chunk_id(source_path: &str, index: usize) -> String {
    format!("{source_path}_chunk_{index}")
}

/// Recover the ordinal index from a chunk id produced by [`chunk_id`].
pub fn chunk_index(chunk_id: &str) -> Option<usize> {
    chunk_id.rsplit_once("_chunk_")?.1.parse().ok()
}

/// blake3 hex digest of chunk content, used to notice edited chunks.
pub fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}
