//! Semantic memory service: vector search with full-text fallback,
//! confidence-adjusted decay, temporal validity, supersession chains, and
//! inference-enriched storage.
//!
//! Every inference-backed feature is opt-in and degrades gracefully: the
//! core store and retrieval paths never fail because a model was
//! unreachable.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::adapters::sqlite::memory_repository::{cosine_distance, MemoryRepository};
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::memory::{
    Entity, EntityRelationship, EntityType, LinkType, Memory, MemoryLink, ScoredMemory,
};
use crate::domain::ports::inference::InferenceClient;
use crate::services::smart_ops::{SmartOp, SmartOpDecider};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MemoryConfig {
    /// Minimum similarity for smart-op neighbors.
    pub similarity_threshold: f64,
    /// Minimum similarity for auto-links.
    pub auto_link_threshold: f64,
    /// Cap on auto-links created per store.
    pub auto_link_limit: usize,
    /// Neighbors retrieved for the smart-op decider.
    pub smart_ops_k: usize,
    pub search_limit: i64,
    /// Content truncation length for unexpanded search results.
    pub snippet_length: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.7,
            auto_link_threshold: 0.8,
            auto_link_limit: 5,
            smart_ops_k: 5,
            search_limit: 10,
            snippet_length: 200,
        }
    }
}

/// Input for `store`.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub content: String,
    pub metadata: Value,
    pub collection: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl Default for NewMemory {
    fn default() -> Self {
        Self {
            content: String::new(),
            metadata: Value::Object(serde_json::Map::new()),
            collection: "default".to_string(),
            confidence: 0.5,
            tags: Vec::new(),
            valid_from: None,
            valid_until: None,
        }
    }
}

/// Opt-in enrichment toggles for `store`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreOptions {
    pub auto_tag: bool,
    pub auto_link: bool,
    pub extract_entities: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<i64>,
    pub collection: Option<String>,
    /// Force the full-text path even when inference is available.
    pub use_fts: bool,
    /// Return full content instead of snippets.
    pub expand: bool,
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct UpsertOptions {
    pub use_smart_ops: bool,
    pub collection: String,
    pub store: StoreOptions,
}

impl Default for UpsertOptions {
    fn default() -> Self {
        Self {
            use_smart_ops: true,
            collection: "default".to_string(),
            store: StoreOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub operation: String,
    pub memory_id: Option<String>,
    pub reason: String,
}

#[derive(Clone)]
pub struct MemoryStore {
    repo: MemoryRepository,
    inference: Arc<dyn InferenceClient>,
    decider: SmartOpDecider,
    config: MemoryConfig,
}

impl MemoryStore {
    pub fn new(
        repo: MemoryRepository,
        inference: Arc<dyn InferenceClient>,
        config: MemoryConfig,
    ) -> Self {
        let decider = SmartOpDecider::new(inference.clone());
        Self {
            repo,
            inference,
            decider,
            config,
        }
    }

    /// Store a memory. Embedding and enrichment failures are swallowed;
    /// the row is written regardless.
    pub async fn store(&self, new: NewMemory, options: StoreOptions) -> DomainResult<Memory> {
        if new.content.trim().is_empty() {
            return Err(DomainError::Validation("memory content is empty".to_string()));
        }
        if !(0.0..=1.0).contains(&new.confidence) {
            return Err(DomainError::Validation(format!(
                "confidence {} out of range 0..1",
                new.confidence
            )));
        }

        let now = Utc::now();
        let embedding = match self.inference.embed(&new.content).await {
            Ok(embedding) => Some(embedding),
            Err(error) => {
                tracing::debug!(%error, "embedding unavailable; storing without vector");
                None
            }
        };

        let mut memory = Memory {
            id: Memory::new_id(),
            content: new.content,
            metadata: new.metadata,
            collection: new.collection,
            confidence: new.confidence,
            tags: new.tags,
            auto_tags: Vec::new(),
            keywords: Vec::new(),
            embedding,
            created_at: now,
            updated_at: now,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            superseded_by: None,
        };

        if options.auto_tag {
            self.auto_tag(&mut memory).await;
        }

        self.repo.insert(&memory).await?;

        if options.auto_link {
            self.auto_link(&memory).await;
        }
        if options.extract_entities {
            self.extract_entities(&memory).await;
        }

        Ok(memory)
    }

    pub async fn get(&self, id: &str) -> DomainResult<Memory> {
        self.repo.get(id).await?.ok_or_else(|| DomainError::NotFound {
            entity: "memory",
            id: id.to_string(),
        })
    }

    pub async fn delete(&self, id: &str) -> DomainResult<()> {
        self.repo.delete(id).await
    }

    pub async fn links_for(&self, id: &str) -> DomainResult<Vec<MemoryLink>> {
        self.repo.links_for(id).await
    }

    pub async fn entities_for(&self, id: &str) -> DomainResult<Vec<Entity>> {
        self.repo.entities_for(id).await
    }

    pub async fn relationships_for(&self, id: &str) -> DomainResult<Vec<EntityRelationship>> {
        self.repo.relationships_for(id).await
    }

    /// Search memories. Vector retrieval when an embedding can be
    /// computed; full-text otherwise (or when forced). Scores are
    /// decay-adjusted before ranking.
    pub async fn search(&self, query: &str, options: SearchOptions) -> DomainResult<Vec<ScoredMemory>> {
        let limit = options.limit.unwrap_or(self.config.search_limit).max(1);
        let collection = options.collection.as_deref();

        let mut scored = if options.use_fts {
            self.fts_candidates(query, collection, limit).await?
        } else {
            match self.inference.embed(query).await {
                Ok(query_embedding) => {
                    self.vector_candidates(&query_embedding, collection).await?
                }
                Err(error) => {
                    tracing::debug!(%error, "vector search unavailable; falling back to full-text");
                    self.fts_candidates(query, collection, limit).await?
                }
            }
        };

        let now = Utc::now();
        for hit in &mut scored {
            hit.effective_score = hit.score * hit.memory.decay_factor(now);
        }
        if let Some(min_score) = options.min_score {
            scored.retain(|hit| hit.effective_score >= min_score);
        }
        scored.sort_by(|a, b| {
            b.effective_score
                .partial_cmp(&a.effective_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit.max(0) as usize);

        if !options.expand {
            for hit in &mut scored {
                truncate_content(&mut hit.memory, self.config.snippet_length);
            }
        }
        Ok(scored)
    }

    /// Search restricted to memories whose validity window covers `t`.
    pub async fn find_valid_at(
        &self,
        query: &str,
        t: DateTime<Utc>,
        options: SearchOptions,
    ) -> DomainResult<Vec<ScoredMemory>> {
        let mut results = self.search(query, options).await?;
        results.retain(|hit| hit.memory.is_valid_at(t));
        Ok(results)
    }

    /// Replace `old_id` with `new_id`: closes the old validity window,
    /// opens the new one, and records the supersession pointer and link.
    pub async fn supersede(&self, old_id: &str, new_id: &str) -> DomainResult<()> {
        if old_id == new_id {
            return Err(DomainError::Validation(
                "a memory cannot supersede itself".to_string(),
            ));
        }
        let mut old = self.get(old_id).await?;
        let mut new = self.get(new_id).await?;
        let now = Utc::now();

        old.superseded_by = Some(new.id.clone());
        old.valid_until = Some(now);
        old.updated_at = now;
        new.valid_from = Some(now);
        new.updated_at = now;

        self.repo.update(&old).await?;
        self.repo.update(&new).await?;
        self.repo
            .insert_link(new_id, old_id, LinkType::Supersedes, 1.0)
            .await?;
        Ok(())
    }

    /// The chronological supersession chain starting at `id`: the memory
    /// itself, then each successor. The pointer graph is a forest, but a
    /// visited set guards against corrupted data.
    pub async fn supersession_chain(&self, id: &str) -> DomainResult<Vec<Memory>> {
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current = Some(id.to_string());
        while let Some(memory_id) = current {
            if !visited.insert(memory_id.clone()) {
                break;
            }
            let memory = self.get(&memory_id).await?;
            current = memory.superseded_by.clone();
            chain.push(memory);
        }
        Ok(chain)
    }

    /// Smart upsert: retrieve neighbors, ask the decider, execute the
    /// chosen operation atomically.
    pub async fn upsert(&self, content: &str, options: UpsertOptions) -> DomainResult<UpsertOutcome> {
        if content.trim().is_empty() {
            return Err(DomainError::Validation("memory content is empty".to_string()));
        }

        let embedding = match self.inference.embed(content).await {
            Ok(embedding) => Some(embedding),
            Err(error) => {
                tracing::debug!(%error, "upsert degrading to plain add");
                None
            }
        };

        let Some(query_embedding) = embedding else {
            // No vector, no neighbors: degrade to ADD and say so.
            let memory = self
                .store(
                    NewMemory {
                        content: content.to_string(),
                        collection: options.collection.clone(),
                        ..NewMemory::default()
                    },
                    options.store,
                )
                .await?;
            return Ok(UpsertOutcome {
                operation: "add".to_string(),
                memory_id: Some(memory.id),
                reason: "inference unavailable; degraded to add".to_string(),
            });
        };

        let mut neighbors = self
            .vector_candidates(&query_embedding, Some(options.collection.as_str()))
            .await?;
        neighbors.retain(|n| n.score >= self.config.similarity_threshold);
        neighbors.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        neighbors.truncate(self.config.smart_ops_k);

        let decision = if options.use_smart_ops {
            self.decider.decide(content, &neighbors).await
        } else {
            crate::services::smart_ops::SmartOpDecision {
                op: SmartOp::Add,
                reason: "smart ops disabled".to_string(),
            }
        };

        let outcome = match decision.op {
            SmartOp::Add => {
                let memory = self
                    .store(
                        NewMemory {
                            content: content.to_string(),
                            collection: options.collection.clone(),
                            ..NewMemory::default()
                        },
                        options.store,
                    )
                    .await?;
                UpsertOutcome {
                    operation: "add".to_string(),
                    memory_id: Some(memory.id),
                    reason: decision.reason,
                }
            }
            SmartOp::Update { target } => {
                let mut memory = self.get(&target).await?;
                memory.content = content.to_string();
                memory.embedding = Some(query_embedding);
                memory.updated_at = Utc::now();
                self.repo.update(&memory).await?;
                UpsertOutcome {
                    operation: "update".to_string(),
                    memory_id: Some(target),
                    reason: decision.reason,
                }
            }
            SmartOp::Delete { target } => {
                self.repo.delete(&target).await?;
                UpsertOutcome {
                    operation: "delete".to_string(),
                    memory_id: Some(target),
                    reason: decision.reason,
                }
            }
            SmartOp::Noop { target } => UpsertOutcome {
                operation: "noop".to_string(),
                memory_id: target,
                reason: decision.reason,
            },
        };
        Ok(outcome)
    }

    async fn vector_candidates(
        &self,
        query_embedding: &[f32],
        collection: Option<&str>,
    ) -> DomainResult<Vec<ScoredMemory>> {
        let candidates = self.repo.embedded_memories(collection).await?;
        let mut scored = Vec::with_capacity(candidates.len());
        for (memory, embedding) in candidates {
            let distance = cosine_distance(query_embedding, &embedding);
            if distance == f32::MAX {
                continue;
            }
            let score = f64::from(1.0 - distance);
            scored.push(ScoredMemory {
                memory,
                score,
                effective_score: score,
            });
        }
        Ok(scored)
    }

    async fn fts_candidates(
        &self,
        query: &str,
        collection: Option<&str>,
        limit: i64,
    ) -> DomainResult<Vec<ScoredMemory>> {
        let memories = self.repo.fts_search(query, collection, limit).await?;
        Ok(memories
            .into_iter()
            .map(|memory| ScoredMemory {
                memory,
                score: 1.0,
                effective_score: 1.0,
            })
            .collect())
    }

    const TAG_SCHEMA: &'static str = r#"{"tags": ["3 to 5 short tags"], "keywords": ["5 to 10 keywords"], "category": "one word"}"#;

    async fn auto_tag(&self, memory: &mut Memory) {
        let prompt = format!(
            "Produce tags, keywords, and a category for this memory:\n{}",
            memory.content
        );
        match self.inference.classify(&prompt, Self::TAG_SCHEMA).await {
            Ok(value) => {
                memory.auto_tags = string_list(value.get("tags"));
                memory.keywords = string_list(value.get("keywords"));
                if let Some(category) = value.get("category").and_then(Value::as_str) {
                    if let Value::Object(map) = &mut memory.metadata {
                        map.insert("category".to_string(), Value::String(category.to_string()));
                    }
                }
            }
            Err(error) => {
                tracing::debug!(%error, "auto-tagging skipped");
            }
        }
    }

    async fn auto_link(&self, memory: &Memory) {
        let Some(embedding) = &memory.embedding else {
            return;
        };
        let candidates = match self.repo.embedded_memories(Some(&memory.collection)).await {
            Ok(candidates) => candidates,
            Err(error) => {
                tracing::debug!(%error, "auto-linking skipped");
                return;
            }
        };

        let mut related: Vec<(String, f64)> = candidates
            .iter()
            .filter(|(candidate, _)| candidate.id != memory.id)
            .filter_map(|(candidate, candidate_embedding)| {
                let distance = cosine_distance(embedding, candidate_embedding);
                if distance == f32::MAX {
                    return None;
                }
                let similarity = f64::from(1.0 - distance);
                (similarity >= self.config.auto_link_threshold)
                    .then(|| (candidate.id.clone(), similarity))
            })
            .collect();
        related.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        related.truncate(self.config.auto_link_limit);

        for (target_id, similarity) in related {
            if let Err(error) = self
                .repo
                .insert_link(&memory.id, &target_id, LinkType::Related, similarity)
                .await
            {
                tracing::debug!(%error, "auto-link insert skipped");
            }
        }
    }

    const ENTITY_SCHEMA: &'static str = r#"{"entities": [{"name": "...", "entity_type": "person | project | technology | concept"}], "relationships": [{"subject": "...", "predicate": "...", "object": "...", "confidence": 0.0}]}"#;

    async fn extract_entities(&self, memory: &Memory) {
        let prompt = format!(
            "Extract named entities and subject-predicate-object relationships from:\n{}",
            memory.content
        );
        let value = match self.inference.classify(&prompt, Self::ENTITY_SCHEMA).await {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(%error, "entity extraction skipped");
                return;
            }
        };

        if let Some(entities) = value.get("entities").and_then(Value::as_array) {
            for entity in entities {
                let Some(name) = entity.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let Some(entity_type) = entity
                    .get("entity_type")
                    .and_then(Value::as_str)
                    .and_then(EntityType::from_str)
                else {
                    continue;
                };
                match self.repo.upsert_entity(name, entity_type).await {
                    Ok(entity_id) => {
                        if let Err(error) =
                            self.repo.link_memory_entity(&memory.id, entity_id).await
                        {
                            tracing::debug!(%error, "entity junction skipped");
                        }
                    }
                    Err(error) => tracing::debug!(%error, "entity upsert skipped"),
                }
            }
        }

        if let Some(relationships) = value.get("relationships").and_then(Value::as_array) {
            for relationship in relationships {
                let (Some(subject), Some(predicate), Some(object)) = (
                    relationship.get("subject").and_then(Value::as_str),
                    relationship.get("predicate").and_then(Value::as_str),
                    relationship.get("object").and_then(Value::as_str),
                ) else {
                    continue;
                };
                let confidence = relationship
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.5);
                if let Err(error) = self
                    .repo
                    .upsert_relationship(subject, predicate, object, confidence, &memory.id)
                    .await
                {
                    tracing::debug!(%error, "relationship upsert skipped");
                }
            }
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn truncate_content(memory: &mut Memory, limit: usize) {
    if memory.content.chars().count() > limit {
        let truncated: String = memory.content.chars().take(limit).collect();
        memory.content = format!("{truncated}…");
    }
}
