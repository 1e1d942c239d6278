//! Semantic Index (§4.5 "Index"): fixed-dimensional embeddings per
//! capability, computed once at registration and never transmitted
//! across the mesh — each node scores candidates with vectors it
//! computed itself.

pub const EMBEDDING_DIM: usize = 384;

pub trait Embedder: Send + Sync {
    /// Deterministic and stable: the same text always yields the same
    /// vector from a given embedder instance, for the lifetime of a
    /// capability (§4.5 "re-embedding requires a new cap_id").
    fn embed(&self, text: &str) -> Vec<f32>;

    fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Deterministic hash-based fallback embedder (§4.5 "Implementers MAY
/// use a third-party sentence-embedding model OR a deterministic
/// hash-based fallback"). Hashes word n-grams into vector positions,
/// giving texts that share vocabulary a nonzero cosine similarity
/// without needing a model file or network call.
pub struct HashingEmbedder {
    dim: usize,
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn tokens(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    fn hash_bucket(&self, token: &str, salt: u64) -> usize {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        salt.hash(&mut hasher);
        token.hash(&mut hasher);
        (hasher.finish() as usize) % self.dim
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dim];
        let tokens = Self::tokens(text);

        for token in &tokens {
            let bucket = self.hash_bucket(token, 0);
            vector[bucket] += 1.0;
        }
        // Bigrams give adjacent-word pairs their own signal, so
        // "vision classify" and "classify vision" land differently
        // from either term alone.
        for pair in tokens.windows(2) {
            let bigram = format!("{}_{}", pair[0], pair[1]);
            let bucket = self.hash_bucket(&bigram, 1);
            vector[bucket] += 0.5;
        }

        normalize(&mut vector);
        vector
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

/// Top-k search over a flat set of `(key, vector)` pairs. For the
/// target scale (N <= 10,000, §4.5 latency budget) a linear scan with
/// a partial sort comfortably meets the 5ms budget; a production index
/// backed by an ANN library can implement the same trait without
/// changing callers.
pub fn top_k<'a>(
    query: &[f32],
    candidates: impl Iterator<Item = (&'a str, &'a [f32])>,
    k: usize,
) -> Vec<(&'a str, f32)> {
    let mut scored: Vec<(&str, f32)> = candidates
        .map(|(key, vector)| (key, cosine_similarity(query, vector)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(k);
    scored
}
