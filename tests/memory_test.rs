//! Semantic memory integration tests.

mod common;

use apiary::domain::errors::DomainError;
use apiary::services::memory::{NewMemory, SearchOptions, StoreOptions, UpsertOptions};
use common::{mock_substrate, offline_substrate};
use serde_json::json;

fn plain(content: &str) -> NewMemory {
    NewMemory {
        content: content.to_string(),
        ..NewMemory::default()
    }
}

#[tokio::test]
async fn vector_search_ranks_by_similarity() {
    let (substrate, inference) = mock_substrate().await;
    inference
        .program_embedding("the build runs in wal mode", vec![1.0, 0.0, 0.0])
        .await;
    inference
        .program_embedding("checkpoints flush the log", vec![0.9, 0.1, 0.0])
        .await;
    inference
        .program_embedding("the scheduler is cooperative", vec![0.0, 1.0, 0.0])
        .await;
    inference
        .program_embedding("wal checkpoint behaviour", vec![1.0, 0.05, 0.0])
        .await;

    for content in [
        "the build runs in wal mode",
        "checkpoints flush the log",
        "the scheduler is cooperative",
    ] {
        substrate
            .memory
            .store(plain(content), StoreOptions::default())
            .await
            .unwrap();
    }

    let hits = substrate
        .memory
        .search("wal checkpoint behaviour", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].memory.content, "the build runs in wal mode");
    assert_eq!(hits[1].memory.content, "checkpoints flush the log");
    assert!(hits[0].score > hits[1].score);
    assert!(hits[1].score > hits[2].score);
}

#[tokio::test]
async fn offline_search_falls_back_to_full_text() {
    let substrate = offline_substrate().await;
    substrate
        .memory
        .store(plain("reservations use conservative glob intersection"), StoreOptions::default())
        .await
        .unwrap();
    substrate
        .memory
        .store(plain("locks retry with jittered backoff"), StoreOptions::default())
        .await
        .unwrap();

    let hits = substrate
        .memory
        .search("glob intersection", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].memory.content.contains("glob"));
}

#[tokio::test]
async fn decay_prefers_fresh_low_confidence_over_stale() {
    let (substrate, inference) = mock_substrate().await;
    // Identical embeddings: only decay separates them.
    for content in ["fresh fact", "stale fact", "decay probe"] {
        inference.program_embedding(content, vec![1.0, 0.0]).await;
    }
    let fresh = substrate
        .memory
        .store(plain("fresh fact"), StoreOptions::default())
        .await
        .unwrap();
    let stale = substrate
        .memory
        .store(plain("stale fact"), StoreOptions::default())
        .await
        .unwrap();

    // Backdate the stale one far past its half-life.
    let old = chrono::Utc::now() - chrono::Duration::days(400);
    sqlx::query("UPDATE memories SET created_at = ?, updated_at = ? WHERE id = ?")
        .bind(old.timestamp_millis())
        .bind(old.timestamp_millis())
        .bind(&stale.id)
        .execute(substrate.pool())
        .await
        .unwrap();

    let hits = substrate
        .memory
        .search("decay probe", SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits[0].memory.id, fresh.id);
    assert!(hits[0].effective_score > hits[1].effective_score);
    // Raw similarity was identical; decay did the ranking.
    assert!((hits[0].score - hits[1].score).abs() < 1e-6);
}

#[tokio::test]
async fn snippets_truncate_unless_expanded() {
    let substrate = offline_substrate().await;
    let long_content = format!("needle {}", "x".repeat(400));
    substrate
        .memory
        .store(plain(&long_content), StoreOptions::default())
        .await
        .unwrap();

    let snippets = substrate
        .memory
        .search("needle", SearchOptions::default())
        .await
        .unwrap();
    assert!(snippets[0].memory.content.chars().count() < 250);
    assert!(snippets[0].memory.content.ends_with('…'));

    let expanded = substrate
        .memory
        .search(
            "needle",
            SearchOptions {
                expand: true,
                ..SearchOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(expanded[0].memory.content, long_content);
}

#[tokio::test]
async fn supersession_chains_and_temporal_validity() {
    let (substrate, inference) = mock_substrate().await;
    for content in ["api uses v1 tokens", "api uses v2 tokens", "api tokens"] {
        inference.program_embedding(content, vec![1.0, 0.0]).await;
    }

    let old = substrate
        .memory
        .store(plain("api uses v1 tokens"), StoreOptions::default())
        .await
        .unwrap();
    let before_supersede = chrono::Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let new = substrate
        .memory
        .store(plain("api uses v2 tokens"), StoreOptions::default())
        .await
        .unwrap();
    substrate.memory.supersede(&old.id, &new.id).await.unwrap();

    let chain = substrate.memory.supersession_chain(&old.id).await.unwrap();
    let ids: Vec<&str> = chain.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec![old.id.as_str(), new.id.as_str()]);

    // As of now, only the successor is valid.
    let current = substrate
        .memory
        .find_valid_at("api tokens", chrono::Utc::now(), SearchOptions::default())
        .await
        .unwrap();
    let current_ids: Vec<&str> = current.iter().map(|m| m.memory.id.as_str()).collect();
    assert!(current_ids.contains(&new.id.as_str()));
    assert!(!current_ids.contains(&old.id.as_str()));

    // Before the supersession, only the original was valid.
    let past = substrate
        .memory
        .find_valid_at("api tokens", before_supersede, SearchOptions::default())
        .await
        .unwrap();
    let past_ids: Vec<&str> = past.iter().map(|m| m.memory.id.as_str()).collect();
    assert!(past_ids.contains(&old.id.as_str()));
    assert!(!past_ids.contains(&new.id.as_str()));

    // The supersedes link was recorded once.
    let links = substrate.memory.links_for(&new.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].link_type, apiary::domain::models::memory::LinkType::Supersedes);
}

#[tokio::test]
async fn smart_upsert_updates_the_chosen_target() {
    let (substrate, inference) = mock_substrate().await;
    inference.program_embedding("port is 8080", vec![1.0, 0.0]).await;
    inference.program_embedding("port is 9090", vec![0.99, 0.01]).await;

    let original = substrate
        .memory
        .store(plain("port is 8080"), StoreOptions::default())
        .await
        .unwrap();

    inference
        .queue_classification(json!({
            "operation": "update",
            "target_id": original.id,
            "reason": "the port changed"
        }))
        .await;

    let outcome = substrate
        .memory
        .upsert("port is 9090", UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.operation, "update");
    assert_eq!(outcome.memory_id.as_deref(), Some(original.id.as_str()));
    assert_eq!(outcome.reason, "the port changed");

    let updated = substrate.memory.get(&original.id).await.unwrap();
    assert_eq!(updated.content, "port is 9090");
}

#[tokio::test]
async fn smart_upsert_without_classifier_uses_heuristics() {
    let (substrate, inference) = mock_substrate().await;
    inference.program_embedding("exact duplicate", vec![1.0, 0.0]).await;

    let original = substrate
        .memory
        .store(plain("exact duplicate"), StoreOptions::default())
        .await
        .unwrap();

    // No classification queued: heuristic sees the duplicate.
    let outcome = substrate
        .memory
        .upsert("exact duplicate", UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.operation, "noop");
    assert_eq!(outcome.memory_id.as_deref(), Some(original.id.as_str()));

    // Novel content becomes an add.
    inference.program_embedding("novel insight", vec![0.0, 1.0]).await;
    let outcome = substrate
        .memory
        .upsert("novel insight", UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.operation, "add");
}

#[tokio::test]
async fn offline_upsert_degrades_to_add() {
    let substrate = offline_substrate().await;
    let outcome = substrate
        .memory
        .upsert("anything at all", UpsertOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.operation, "add");
    assert!(outcome.reason.contains("inference unavailable"));
    assert!(outcome.memory_id.is_some());
}

#[tokio::test]
async fn auto_tagging_degrades_gracefully() {
    let (substrate, inference) = mock_substrate().await;
    inference
        .queue_classification(json!({
            "tags": ["infra", "database", "sqlite"],
            "keywords": ["wal", "checkpoint", "journal", "flush", "sync"],
            "category": "storage"
        }))
        .await;

    let tagged = substrate
        .memory
        .store(
            plain("wal checkpoints flush the journal"),
            StoreOptions {
                auto_tag: true,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(tagged.auto_tags, vec!["infra", "database", "sqlite"]);
    assert_eq!(tagged.keywords.len(), 5);
    assert_eq!(tagged.metadata["category"], "storage");

    // Queue exhausted: the store still succeeds, tags stay empty.
    let untagged = substrate
        .memory
        .store(
            plain("no classifier this time"),
            StoreOptions {
                auto_tag: true,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(untagged.auto_tags.is_empty());
}

#[tokio::test]
async fn auto_linking_connects_similar_memories_once() {
    let (substrate, inference) = mock_substrate().await;
    inference.program_embedding("first fact", vec![1.0, 0.0]).await;
    inference.program_embedding("second fact", vec![0.95, 0.05]).await;
    inference.program_embedding("unrelated", vec![0.0, 1.0]).await;

    let first = substrate
        .memory
        .store(plain("first fact"), StoreOptions::default())
        .await
        .unwrap();
    substrate
        .memory
        .store(plain("unrelated"), StoreOptions::default())
        .await
        .unwrap();

    let second = substrate
        .memory
        .store(
            plain("second fact"),
            StoreOptions {
                auto_link: true,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();

    let links = substrate.memory.links_for(&second.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].target_id, first.id);
    assert!(links[0].strength > 0.9);
}

#[tokio::test]
async fn entity_extraction_deduplicates() {
    let (substrate, inference) = mock_substrate().await;
    let entities = json!({
        "entities": [
            {"name": "SQLite", "entity_type": "technology"},
            {"name": "sqlite", "entity_type": "technology"},
            {"name": "apiary", "entity_type": "project"}
        ],
        "relationships": [
            {"subject": "apiary", "predicate": "uses", "object": "SQLite", "confidence": 0.9},
            {"subject": "apiary", "predicate": "uses", "object": "SQLite", "confidence": 0.4}
        ]
    });
    inference.queue_classification(entities.clone()).await;

    let memory = substrate
        .memory
        .store(
            plain("apiary persists through sqlite"),
            StoreOptions {
                extract_entities: true,
                ..StoreOptions::default()
            },
        )
        .await
        .unwrap();

    let extracted = substrate.memory.entities_for(&memory.id).await.unwrap();
    assert_eq!(extracted.len(), 2);

    let relationships = substrate.memory.relationships_for(&memory.id).await.unwrap();
    assert_eq!(relationships.len(), 1);
    assert!((relationships[0].confidence - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn missing_memories_surface_not_found() {
    let substrate = offline_substrate().await;
    let err = substrate.memory.get("mem-missing").await.unwrap_err();
    assert!(matches!(err, DomainError::NotFound { entity: "memory", .. }));
    let err = substrate.memory.delete("mem-missing").await.unwrap_err();
    assert!(matches!(err, DomainError::NotFound { .. }));
}
