//! Shared test helpers: in-memory substrates and a scripted inference
//! client.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use apiary::domain::errors::{DomainError, DomainResult};
use apiary::{InferenceClient, Substrate};

/// Deterministic, scriptable inference client.
///
/// `embed` returns a programmed vector for known texts and a stable
/// hash-derived vector otherwise; `classify` pops pre-queued responses
/// and errors when the queue is empty.
#[derive(Default)]
pub struct MockInference {
    embeddings: Mutex<HashMap<String, Vec<f32>>>,
    classifications: Mutex<VecDeque<Value>>,
}

impl MockInference {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn program_embedding(&self, text: &str, vector: Vec<f32>) {
        self.embeddings.lock().await.insert(text.to_string(), vector);
    }

    pub async fn queue_classification(&self, value: Value) {
        self.classifications.lock().await.push_back(value);
    }
}

#[async_trait]
impl InferenceClient for MockInference {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn dimension(&self) -> usize {
        8
    }

    async fn embed(&self, text: &str) -> DomainResult<Vec<f32>> {
        if let Some(vector) = self.embeddings.lock().await.get(text) {
            return Ok(vector.clone());
        }
        // Stable fallback vector derived from the text bytes.
        let mut vector = vec![0.0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 8] += f32::from(byte) / 255.0;
        }
        Ok(vector)
    }

    async fn classify(&self, _prompt: &str, _schema: &str) -> DomainResult<Value> {
        self.classifications
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| DomainError::InferenceUnavailable("no scripted response".to_string()))
    }
}

/// Substrate with no inference service: exercises the degradation paths.
#[allow(dead_code)]
pub async fn offline_substrate() -> Substrate {
    Substrate::open_in_memory_offline()
        .await
        .expect("failed to open in-memory substrate")
}

/// Substrate wired to a scripted mock inference client.
#[allow(dead_code)]
pub async fn mock_substrate() -> (Substrate, Arc<MockInference>) {
    let inference = Arc::new(MockInference::new());
    let substrate = Substrate::open_in_memory(inference.clone())
        .await
        .expect("failed to open in-memory substrate");
    (substrate, inference)
}

/// Init an agent session and return its name.
#[allow(dead_code)]
pub async fn init_agent(substrate: &Substrate, project: &str, name: &str) -> String {
    substrate
        .mailbox
        .init(project, Some(name), None, None)
        .await
        .expect("init failed")
        .agent
}
