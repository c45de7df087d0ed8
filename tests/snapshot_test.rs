//! JSONL snapshot integration tests.

mod common;

use apiary::adapters::sqlite::MemoryRepository;
use apiary::services::memory::{NewMemory, StoreOptions};
use apiary::services::snapshot::{export_memories, import_memories, serialize_cells};
use apiary::NewCell;
use common::offline_substrate;

const PROJECT: &str = "/work/checkout";

#[tokio::test]
async fn memories_export_and_import_across_stores() {
    let source = offline_substrate().await;
    for content in ["first fact", "second fact"] {
        source
            .memory
            .store(
                NewMemory {
                    content: content.to_string(),
                    tags: vec!["exported".into()],
                    confidence: 0.9,
                    ..NewMemory::default()
                },
                StoreOptions::default(),
            )
            .await
            .unwrap();
    }

    let source_repo = MemoryRepository::new(source.pool().clone());
    let jsonl = export_memories(&source_repo, None).await.unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    assert!(!jsonl.contains("embedding"));

    let target = offline_substrate().await;
    let target_repo = MemoryRepository::new(target.pool().clone());
    let report = import_memories(&target_repo, &jsonl, "default").await.unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(report.skipped_duplicates, 0);
    assert!(report.failed.is_empty());

    // Importing the same document again only skips.
    let report = import_memories(&target_repo, &jsonl, "default").await.unwrap();
    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped_duplicates, 2);

    // Imported rows are searchable through the normal service.
    let hits = target
        .memory
        .search("second fact", apiary::services::memory::SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.tags, vec!["exported"]);
}

#[tokio::test]
async fn corrupt_lines_do_not_fail_the_batch() {
    let substrate = offline_substrate().await;
    let repo = MemoryRepository::new(substrate.pool().clone());

    let jsonl = concat!(
        r#"{"id": "mem-ok", "information": "valid record", "created_at": 1700000000000}"#,
        "\n",
        "this is not json\n",
        r#"{"id": "mem-ok-2", "information": "another", "created_at": 1700000000001, "confidence": 0.7}"#,
        "\n",
    );

    let report = import_memories(&repo, jsonl, "default").await.unwrap();
    assert_eq!(report.imported, 2);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, 2);

    let restored = repo.get("mem-ok-2").await.unwrap().unwrap();
    assert!((restored.confidence - 0.7).abs() < 1e-9);
}

#[tokio::test]
async fn cells_serialize_one_per_line() {
    let substrate = offline_substrate().await;
    for title in ["a", "b"] {
        substrate
            .hive
            .create_cell(
                PROJECT,
                NewCell {
                    title: title.into(),
                    priority: 2,
                    ..NewCell::default()
                },
            )
            .await
            .unwrap();
    }
    let cells = substrate
        .hive
        .list_cells(PROJECT, apiary::services::hive::CellFilter::default())
        .await
        .unwrap();
    let jsonl = serialize_cells(&cells).unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    for line in jsonl.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["id"].is_string());
        assert_eq!(value["status"], "open");
    }
}
