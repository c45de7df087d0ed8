//! Smart-op decider: choose ADD / UPDATE / DELETE / NOOP for incoming
//! information, given its nearest existing memories.
//!
//! The decision is made by the inference client when one is available;
//! otherwise a heuristic keeps upsert usable: an exact duplicate becomes
//! a no-op, everything else an add.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::models::memory::ScoredMemory;
use crate::domain::ports::inference::InferenceClient;

/// The chosen operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmartOp {
    Add,
    Update { target: String },
    Delete { target: String },
    Noop { target: Option<String> },
}

impl SmartOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Noop { .. } => "noop",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmartOpDecision {
    pub op: SmartOp,
    pub reason: String,
}

const DECISION_SCHEMA: &str = r#"{"operation": "add | update | delete | noop", "target_id": "id of the affected existing memory, when operation is update/delete/noop", "reason": "one sentence"}"#;

#[derive(Clone)]
pub struct SmartOpDecider {
    inference: Arc<dyn InferenceClient>,
}

impl SmartOpDecider {
    pub fn new(inference: Arc<dyn InferenceClient>) -> Self {
        Self { inference }
    }

    /// Decide what to do with `content` given its `neighbors` (nearest
    /// existing memories, best first). Never fails: inference errors
    /// degrade to the heuristic.
    pub async fn decide(&self, content: &str, neighbors: &[ScoredMemory]) -> SmartOpDecision {
        match self.classify(content, neighbors).await {
            Ok(decision) => decision,
            Err(error) => {
                tracing::debug!(%error, "smart-op inference failed; using heuristic");
                heuristic_decision(content, neighbors)
            }
        }
    }

    async fn classify(
        &self,
        content: &str,
        neighbors: &[ScoredMemory],
    ) -> crate::domain::errors::DomainResult<SmartOpDecision> {
        let mut prompt = String::from(
            "New information arrived for the memory store. Decide whether to add it as a new \
             memory, update an existing one, delete an obsolete one, or do nothing.\n\nNew information:\n",
        );
        prompt.push_str(content);
        prompt.push_str("\n\nNearest existing memories:\n");
        for neighbor in neighbors {
            prompt.push_str(&format!(
                "- id={} score={:.3} content={}\n",
                neighbor.memory.id, neighbor.score, neighbor.memory.content
            ));
        }

        let value = self.inference.classify(&prompt, DECISION_SCHEMA).await?;
        parse_decision(&value, neighbors)
            .ok_or_else(|| crate::domain::errors::DomainError::Validation(
                format!("unusable smart-op decision: {value}"),
            ))
    }
}

fn parse_decision(value: &Value, neighbors: &[ScoredMemory]) -> Option<SmartOpDecision> {
    let operation = value.get("operation")?.as_str()?.to_lowercase();
    let target = value
        .get("target_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("no reason given")
        .to_string();

    let known_target = |t: &String| neighbors.iter().any(|n| &n.memory.id == t);
    let op = match operation.as_str() {
        "add" => SmartOp::Add,
        "update" => SmartOp::Update {
            target: target.filter(known_target)?,
        },
        "delete" => SmartOp::Delete {
            target: target.filter(known_target)?,
        },
        "noop" => SmartOp::Noop {
            target: target.filter(known_target),
        },
        _ => return None,
    };
    Some(SmartOpDecision { op, reason })
}

/// Fallback when inference is unavailable: exact duplicates are no-ops,
/// everything else is an add.
pub fn heuristic_decision(content: &str, neighbors: &[ScoredMemory]) -> SmartOpDecision {
    let trimmed = content.trim();
    if let Some(duplicate) = neighbors
        .iter()
        .find(|n| n.memory.content.trim() == trimmed)
    {
        return SmartOpDecision {
            op: SmartOp::Noop {
                target: Some(duplicate.memory.id.clone()),
            },
            reason: "inference unavailable; exact duplicate of an existing memory".to_string(),
        };
    }
    SmartOpDecision {
        op: SmartOp::Add,
        reason: "inference unavailable; stored as new memory".to_string(),
    }
}
