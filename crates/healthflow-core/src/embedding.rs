//! Embedding provider trait, content-addressed embedding cache, and vector
//! utilities.
//!
//! Concrete providers (OpenAI, Ollama) live in the `healthflow` app crate.
//! This module owns the provider-independent rules: order preservation,
//! token-limit checks, dimensionality checks, and memoization keyed by
//! `(SHA-256(text), model)`.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use crate::chunk::content_hash;
use crate::error::{CoreError, CoreResult};
use crate::models::ModelSpec;

/// Approximate characters-per-token ratio used for input-limit checks.
pub const CHARS_PER_TOKEN: usize = 4;

/// Trait for embedding backends.
///
/// Implementations make exactly one provider call per invocation and
/// classify failures: rate limits, timeouts and 5xx responses are
/// [`CoreError::transient`]; everything else is permanent. Retrying is the
/// caller's job.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// The model this provider produces vectors for.
    fn model(&self) -> &ModelSpec;

    /// Embed a batch of texts, returning one vector per text in input order.
    async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>>;
}

/// Estimated token count of `text` (ceil of chars / [`CHARS_PER_TOKEN`]).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

type CacheKey = (String, String);

struct CacheInner {
    vectors: HashMap<CacheKey, Vec<f32>>,
    order: VecDeque<CacheKey>,
}

/// Bounded, content-addressed vector cache with FIFO eviction.
pub struct EmbeddingCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl EmbeddingCache {
    /// A capacity of 0 disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                vectors: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn get(&self, hash: &str, model: &str) -> Option<Vec<f32>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .vectors
            .get(&(hash.to_string(), model.to_string()))
            .cloned()
    }

    pub fn insert(&self, hash: &str, model: &str, vector: Vec<f32>) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (hash.to_string(), model.to_string());
        if inner.vectors.contains_key(&key) {
            return;
        }
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.vectors.remove(&oldest);
                }
                None => break,
            }
        }
        inner.order.push_back(key.clone());
        inner.vectors.insert(key, vector);
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .vectors
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Provider front-end enforcing the embedding contract.
///
/// - Output order and length match the input.
/// - Texts above the model's token window fail with
///   [`CoreError::InvalidInput`] before any provider call.
/// - Vectors of the wrong length fail with [`CoreError::DimensionMismatch`].
/// - Identical text under the same model is sent to the provider at most
///   once while it stays cached.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, cache_capacity: usize) -> Self {
        Self {
            provider,
            cache: EmbeddingCache::new(cache_capacity),
        }
    }

    pub fn model(&self) -> &ModelSpec {
        self.provider.model()
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Embed `texts`, serving repeats from the cache.
    pub async fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        let model = self.provider.model().clone();

        for (i, text) in texts.iter().enumerate() {
            let tokens = estimate_tokens(text);
            if tokens > model.max_input_tokens {
                return Err(CoreError::InvalidInput(format!(
                    "text #{} is ~{} tokens; model '{}' accepts at most {}",
                    i, tokens, model.name, model.max_input_tokens
                )));
            }
        }

        let hashes: Vec<String> = texts.iter().map(|t| content_hash(t)).collect();
        let mut results: Vec<Option<Vec<f32>>> = hashes
            .iter()
            .map(|h| self.cache.get(h, &model.name))
            .collect();

        // Unique misses, first occurrence order.
        let mut seen = HashSet::new();
        let mut miss_hashes = Vec::new();
        let mut miss_texts = Vec::new();
        for (i, slot) in results.iter().enumerate() {
            if slot.is_none() && seen.insert(hashes[i].as_str()) {
                miss_hashes.push(hashes[i].clone());
                miss_texts.push(texts[i].clone());
            }
        }

        if !miss_texts.is_empty() {
            let vectors = self.provider.embed_batch(&miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                return Err(CoreError::permanent(format!(
                    "provider returned {} vectors for {} inputs",
                    vectors.len(),
                    miss_texts.len()
                )));
            }
            let mut fresh: HashMap<&str, &Vec<f32>> = HashMap::new();
            for (hash, vector) in miss_hashes.iter().zip(vectors.iter()) {
                if vector.len() != model.dims {
                    return Err(CoreError::DimensionMismatch {
                        expected: model.dims,
                        actual: vector.len(),
                    });
                }
                fresh.insert(hash.as_str(), vector);
            }
            for (i, slot) in results.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = fresh.get(hashes[i].as_str()).map(|v| (*v).clone());
                }
            }
            for (hash, vector) in miss_hashes.iter().zip(vectors) {
                self.cache.insert(hash, &model.name, vector);
            }
        }

        results
            .into_iter()
            .map(|v| v.ok_or_else(|| CoreError::permanent("missing embedding in provider response")))
            .collect()
    }

    /// Embed a single query text.
    pub async fn embed_query(&self, text: &str) -> CoreResult<Vec<f32>> {
        self.embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::permanent("empty embedding response"))
    }
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use healthflow_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB produced by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or a
/// zero-norm operand.
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
