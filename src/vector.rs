//! Dense vector helpers: on-disk encoding, validation and cosine ranking.

use rayon::prelude::*;

use crate::error::{Error, Result};

/// Dimension of every embedding in the index.
pub const EMBEDDING_DIMENSION: usize = 1024;

/// Header size: 4 bytes dimension (u32 LE).
const HEADER_SIZE: usize = 4;

/// Encode a vector as a dimension header followed by f32 LE values.
pub fn encode(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + vector.len() * 4);
    bytes.extend_from_slice(&(vector.len() as u32).to_le_bytes());
    bytes.extend_from_slice(bytemuck::cast_slice(vector));
    bytes
}

/// Decode bytes written by [`encode`]. Returns `None` on a length mismatch.
pub fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let data = &bytes[HEADER_SIZE..];
    if data.len() != dimension * 4 {
        return None;
    }
    match bytemuck::try_cast_slice::<u8, f32>(data) {
        Ok(values) => Some(values.to_vec()),
        // Unaligned buffer.
        Err(_) => Some(
            data.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
    }
}

/// Reject vectors a provider should never return.
///
/// Checks the count against `expected`, the dimension of each vector, and
/// that no vector is all zeros or contains non-finite values.
pub fn validate(
    vectors: &[Vec<f32>],
    expected: usize,
    dimension: usize,
) -> Result<()> {
    if vectors.len() != expected {
        return Err(Error::InvalidEmbedding(format!(
            "expected {expected} vectors, got {}",
            vectors.len()
        )));
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dimension {
            return Err(Error::InvalidEmbedding(format!(
                "vector {i} has dimension {}, expected {dimension}",
                v.len()
            )));
        }
        if v.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidEmbedding(format!(
                "vector {i} contains non-finite values"
            )));
        }
        if v.iter().all(|&x| x == 0.0) {
            return Err(Error::InvalidEmbedding(format!(
                "vector {i} is all zeros"
            )));
        }
    }
    Ok(())
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut na, mut nb) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Rank `candidates` by cosine similarity to `query` and keep the best `k`
/// with similarity at least `floor`.
///
/// Ties keep candidate order.
pub fn top_k<K: Send>(
    query: &[f32],
    candidates: Vec<(K, Vec<f32>)>,
    k: usize,
    floor: f32,
) -> Vec<(K, f32)> {
    let mut scored: Vec<(K, f32)> = candidates
        .into_par_iter()
        .map(|(key, v)| {
            let score = cosine(query, &v);
            (key, score)
        })
        .filter(|(_, score)| *score >= floor)
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}
