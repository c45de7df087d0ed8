//! Semantic memory model.
//!
//! Memories carry an embedding, free-form JSON metadata, a confidence
//! score that slows decay, an optional temporal validity window, and a
//! supersession pointer forming per-fact chains.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dimensionality of stored embeddings.
pub const EMBEDDING_DIM: usize = 1024;

/// Base half-life in days before confidence adjustment.
pub const BASE_HALF_LIFE_DAYS: f64 = 90.0;

/// A stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Value,
    pub collection: String,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub auto_tags: Vec<String>,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
}

impl Memory {
    pub fn new_id() -> String {
        format!("mem-{}", Uuid::new_v4())
    }

    /// A memory is valid at `t` iff its validity window covers `t`.
    pub fn is_valid_at(&self, t: DateTime<Utc>) -> bool {
        self.valid_from.is_none_or(|from| from <= t)
            && self.valid_until.is_none_or(|until| until > t)
    }

    /// Confidence-adjusted half-life in days.
    pub fn half_life_days(&self) -> f64 {
        BASE_HALF_LIFE_DAYS * (0.5 + self.confidence)
    }

    /// Decay multiplier at `now`: `0.5^(age_days / half_life)`.
    ///
    /// Age is measured from `updated_at`, so refreshing a memory restarts
    /// its decay clock.
    pub fn decay_factor(&self, now: DateTime<Utc>) -> f64 {
        let age_ms = (now - self.updated_at).num_milliseconds().max(0) as f64;
        let age_days = age_ms / 86_400_000.0;
        0.5_f64.powf(age_days / self.half_life_days())
    }
}

/// Typed link between two memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Related,
    Contradicts,
    Supersedes,
    Elaborates,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Related => "related",
            Self::Contradicts => "contradicts",
            Self::Supersedes => "supersedes",
            Self::Elaborates => "elaborates",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "related" => Some(Self::Related),
            "contradicts" => Some(Self::Contradicts),
            "supersedes" => Some(Self::Supersedes),
            "elaborates" => Some(Self::Elaborates),
            _ => None,
        }
    }
}

/// A bidirectional link between memories, unique per
/// `(source_id, target_id, link_type)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryLink {
    pub id: i64,
    pub source_id: String,
    pub target_id: String,
    pub link_type: LinkType,
    pub strength: f64,
}

/// Named entity extracted from memory content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub entity_type: EntityType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Project,
    Technology,
    Concept,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Project => "project",
            Self::Technology => "technology",
            Self::Concept => "concept",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "person" => Some(Self::Person),
            "project" => Some(Self::Project),
            "technology" => Some(Self::Technology),
            "concept" => Some(Self::Concept),
            _ => None,
        }
    }
}

/// Subject-predicate-object triple with provenance, deduplicated on
/// `(subject, predicate, object)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: i64,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f64,
    pub memory_id: String,
}

/// A search hit with its raw similarity score and the decay-adjusted
/// score used for ranking.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f64,
    pub effective_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_at(updated: DateTime<Utc>, confidence: f64) -> Memory {
        Memory {
            id: Memory::new_id(),
            content: "the build uses sqlite in wal mode".into(),
            metadata: serde_json::json!({}),
            collection: "default".into(),
            confidence,
            tags: vec![],
            auto_tags: vec![],
            keywords: vec![],
            embedding: None,
            created_at: updated,
            updated_at: updated,
            valid_from: None,
            valid_until: None,
            superseded_by: None,
        }
    }

    #[test]
    fn decay_halves_after_one_half_life() {
        let now = Utc::now();
        let m = memory_at(now - chrono::Duration::days(90), 0.5);
        // confidence 0.5 -> half-life exactly 90 days
        let factor = m.decay_factor(now);
        assert!((factor - 0.5).abs() < 1e-3, "factor was {factor}");
    }

    #[test]
    fn higher_confidence_decays_slower() {
        let now = Utc::now();
        let low = memory_at(now - chrono::Duration::days(60), 0.1);
        let high = memory_at(now - chrono::Duration::days(60), 0.9);
        assert!(high.decay_factor(now) > low.decay_factor(now));
    }

    #[test]
    fn validity_window_bounds() {
        let now = Utc::now();
        let mut m = memory_at(now, 0.5);
        assert!(m.is_valid_at(now));

        m.valid_from = Some(now + chrono::Duration::hours(1));
        assert!(!m.is_valid_at(now));

        m.valid_from = Some(now - chrono::Duration::hours(2));
        m.valid_until = Some(now - chrono::Duration::hours(1));
        assert!(!m.is_valid_at(now));

        m.valid_until = Some(now + chrono::Duration::hours(1));
        assert!(m.is_valid_at(now));
    }
}
