//! Null inference client implementation.
//!
//! Used when no inference service is configured. Every call fails with
//! `InferenceUnavailable`, which exercises the degradation paths: memory
//! search falls back to full-text, smart upsert falls back to heuristics,
//! and the opt-in enrichment features become no-ops.

use async_trait::async_trait;

use super::inference::InferenceClient;
use crate::domain::errors::{DomainError, DomainResult};

/// An inference client that is always unavailable.
#[derive(Debug, Clone, Default)]
pub struct NullInferenceClient;

impl NullInferenceClient {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InferenceClient for NullInferenceClient {
    fn name(&self) -> &'static str {
        "null"
    }

    fn dimension(&self) -> usize {
        0
    }

    async fn embed(&self, _text: &str) -> DomainResult<Vec<f32>> {
        Err(DomainError::InferenceUnavailable(
            "no inference client configured".to_string(),
        ))
    }

    async fn classify(&self, _prompt: &str, _schema: &str) -> DomainResult<serde_json::Value> {
        Err(DomainError::InferenceUnavailable(
            "no inference client configured".to_string(),
        ))
    }
}
