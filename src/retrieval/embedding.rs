pub const DEFAULT_EMBEDDING_DIM: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding service unavailable: {0}")]
    Unavailable(String),
    #[error("embedding service returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("text has no embeddable tokens")]
    EmptyText,
}

pub trait EmbeddingService: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Local bag-of-words embedder: each lowercase token hashes into one signed
/// bucket and the vector is L2-normalised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            dimension: DEFAULT_EMBEDDING_DIM,
        }
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

impl EmbeddingService for HashingEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let tokens = text
            .split(|ch: char| !ch.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|token| !token.is_empty())
            .collect::<Vec<_>>();
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyText);
        }

        let mut out = vec![0.0_f32; self.dimension];
        for token in tokens {
            let hash = stable_hash(token.as_bytes());
            let idx = (hash as usize) % self.dimension;
            let sign = if (hash >> 32) & 1 == 0 { 1.0_f32 } else { -1.0_f32 };
            let mag = 1.0_f32 + (token.len() as f32 / 32.0_f32);
            out[idx] += sign * mag;
        }

        let norm = out.iter().map(|value| value * value).sum::<f32>().sqrt();
        if norm <= f32::EPSILON {
            return Err(EmbeddingError::EmptyText);
        }
        for value in &mut out {
            *value /= norm;
        }
        Ok(out)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f32;
    let mut left_norm = 0.0_f32;
    let mut right_norm = 0.0_f32;
    for (a, b) in left.iter().zip(right.iter()) {
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }
    let denom = left_norm.sqrt() * right_norm.sqrt();
    if denom <= f32::EPSILON || !denom.is_finite() {
        return 0.0;
    }
    dot / denom
}

fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325_u64;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3_u64);
    }
    hash
}
