//! Inference client port.
//!
//! The substrate never talks to an LLM gateway directly; everything that
//! needs embeddings or structured classification goes through this trait.
//! Callers are expected to degrade gracefully when a call returns
//! `InferenceUnavailable`.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Opaque gateway to an inference service.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Client name (e.g., "http", "null"), for diagnostics.
    fn name(&self) -> &'static str;

    /// Embedding dimension produced by `embed`.
    fn dimension(&self) -> usize;

    /// Generate a dense embedding for a single text.
    async fn embed(&self, text: &str) -> DomainResult<Vec<f32>>;

    /// Ask the model to produce a JSON object matching `schema` for the
    /// given prompt. `schema` is a human/model-readable description of the
    /// expected shape, not enforced by the substrate; callers validate the
    /// returned value.
    async fn classify(&self, prompt: &str, schema: &str) -> DomainResult<serde_json::Value>;
}
