//! Embedding provider traits and vector utilities.
//!
//! Defines the [`EmbeddingModelProvider`] trait that all embedding backends
//! implement, the [`Embedder`] handle they hand out, plus pure helper
//! functions for vector serialization and similarity computation.
//!
//! Concrete providers (OpenAI, Ollama) live in the `knowledge` app crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::models::EmbeddingsProviderConfig;

/// Computes the embedding vector for a piece of text.
///
/// Implementations must return a normalized vector so that cosine
/// similarity and dot product agree.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Shared embedding function handle.
pub type EmbeddingFunc = Arc<dyn Embedder>;

/// A configured embedding backend.
///
/// Providers are cloned (via [`clone_box`](Self::clone_box)) whenever a
/// single call needs a different model than the shared instance, so that
/// the shared configuration is never mutated.
pub trait EmbeddingModelProvider: Send + Sync {
    /// Provider type, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Model currently in use, e.g. `"text-embedding-3-small"`.
    fn embedding_model_name(&self) -> &str;

    fn use_embedding_model(&mut self, model: &str);

    /// Build the embedding function for the current configuration.
    fn embedding_func(&self) -> anyhow::Result<EmbeddingFunc>;

    /// Fill unset fields from the environment and defaults.
    fn configure(&mut self) -> anyhow::Result<()>;

    /// Exportable configuration, without secrets.
    fn config(&self) -> EmbeddingsProviderConfig;

    /// Fields that must agree for two configs to produce compatible
    /// vectors.
    fn required_fields(&self) -> &'static [&'static str] {
        &["model"]
    }

    fn clone_box(&self) -> Box<dyn EmbeddingModelProvider>;
}

impl Clone for Box<dyn EmbeddingModelProvider> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// Each `f32` is stored as 4 bytes in little-endian order, producing
/// a BLOB of `vec.len() × 4` bytes.
///
/// # Example
///
/// ```rust
/// use knowledge_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`; `0.0` for empty vectors or vectors of
/// different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}

// ============ Hash Provider ============

/// Deterministic feature-hashing embedder.
///
/// Tokens are lowercased alphanumeric words hashed (FNV-1a, seeded with the
/// model name) into `dims` buckets; the result is normalized. Two models
/// with different names produce unrelated vectors, which makes model
/// mismatches observable without a network provider. Used by the test
/// suites and for offline use (`provider = "hash"`).
pub struct HashEmbedder {
    model: String,
    dims: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut vec = vec![0.0f32; self.dims];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let bucket = fnv1a(self.model.as_bytes(), token.to_lowercase().as_bytes());
            vec[(bucket % self.dims as u64) as usize] += 1.0;
        }
        normalize(&mut vec);
        Ok(vec)
    }
}

fn fnv1a(seed: &[u8], data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in seed.iter().chain(b"\0").chain(data.iter()) {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Provider handing out [`HashEmbedder`]s.
///
/// Clones share the embed-call counter, so a test can observe how many
/// vectors were actually computed across per-call provider copies.
#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    model: String,
    dims: usize,
    calls: Arc<AtomicUsize>,
}

impl HashEmbeddingProvider {
    pub const NAME: &'static str = "hash";

    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of texts embedded so far by this provider and its clones.
    pub fn embed_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingModelProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn embedding_model_name(&self) -> &str {
        &self.model
    }

    fn use_embedding_model(&mut self, model: &str) {
        self.model = model.to_string();
    }

    fn embedding_func(&self) -> anyhow::Result<EmbeddingFunc> {
        Ok(Arc::new(HashEmbedder {
            model: self.model.clone(),
            dims: self.dims,
            calls: self.calls.clone(),
        }))
    }

    fn configure(&mut self) -> anyhow::Result<()> {
        if self.model.is_empty() {
            self.model = format!("hash-{}", self.dims);
        }
        Ok(())
    }

    fn config(&self) -> EmbeddingsProviderConfig {
        let mut config = serde_json::Map::new();
        config.insert("model".into(), self.model.clone().into());
        config.insert("dims".into(), (self.dims as u64).into());
        EmbeddingsProviderConfig {
            provider_type: Self::NAME.to_string(),
            config,
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        &["model", "dims"]
    }

    fn clone_box(&self) -> Box<dyn EmbeddingModelProvider> {
        Box::new(self.clone())
    }
}
