//! Embedding clients.
//!
//! [`EmbeddingClient`] wraps the single-call HTTP embedding service;
//! [`HashEmbedder`] is a deterministic local fallback used by tests and
//! offline runs. Both sit behind the [`Embedder`] trait so the experience
//! memory never knows which one it has.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use axon_core::config::EmbeddingConfig;

use crate::error::{ExperienceError, Result};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input, in order. A count mismatch is an error.
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>>;

    async fn embed_one(&self, input: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed(&[input.to_string()]).await?;
        vectors
            .pop()
            .ok_or(ExperienceError::CountMismatch { expected: 1, got: 0 })
    }
}

/// HTTP embedding service client.
///
/// `POST {model, input: […]}` → `{data: [{embedding: […]}]}`, authorized
/// with `Authorization: Bearer <key>` or a configurable header name.
pub struct EmbeddingClient {
    client: reqwest::Client,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/v1/embeddings", self.config.base_url);
        let body = serde_json::json!({
            "model": self.config.model,
            "input": inputs,
        });

        let mut builder = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            builder = match &self.config.auth_header {
                Some(header) => builder.header(header.as_str(), key),
                None => builder.bearer_auth(key),
            };
        }

        debug!(count = inputs.len(), model = %self.config.model, "embedding request");
        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let message = resp.text().await.unwrap_or_default();
            warn!(status, body = %message, "embedding service error");
            return Err(ExperienceError::Embedding { status, message });
        }

        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| ExperienceError::Embedding {
                status,
                message: e.to_string(),
            })?;

        if parsed.data.len() != inputs.len() {
            return Err(ExperienceError::CountMismatch {
                expected: inputs.len(),
                got: parsed.data.len(),
            });
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// Deterministic bag-of-words embedder. No network, stable across runs;
/// related phrasings land near each other because shared words share
/// dimensions. Good enough for tests and degraded offline operation, not
/// for production retrieval quality.
pub struct HashEmbedder {
    dim: usize,
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self { dim: 32 }
    }
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }

    fn vectorize(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut v = vec![0.0f32; self.dim];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dim;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|s| self.vectorize(s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_one("how to tar a dir").await.unwrap();
        let b = embedder.embed_one("how to tar a dir").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[tokio::test]
    async fn related_phrasings_share_mass() {
        let embedder = HashEmbedder::default();
        let a = embedder.embed_one("how to tar a dir").await.unwrap();
        let b = embedder.embed_one("how to archive a dir").await.unwrap();
        let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
        assert!(dot > 0.5, "related phrasings should score > 0.5, got {dot}");
    }

    #[tokio::test]
    async fn one_vector_per_input() {
        let embedder = HashEmbedder::default();
        let vectors = embedder
            .embed(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 3);
    }
}
