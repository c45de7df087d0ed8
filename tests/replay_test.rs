//! Projection rebuild determinism and epic replay pacing.

mod common;

use apiary::services::hive::CellPatch;
use apiary::services::mailbox::{InboxQuery, SendMessage};
use apiary::services::replay::{ReplayFilter, ReplaySpeed};
use apiary::services::reservations::ReserveRequest;
use apiary::{CellRelationship, CellType, EventFilter, NewCell, Substrate};
use common::{init_agent, offline_substrate};

const PROJECT: &str = "/work/checkout";

const PROJECTION_TABLES: &[&str] = &[
    "agents",
    "messages",
    "message_recipients",
    "reservations",
    "cells",
    "cell_dependencies",
    "cell_labels",
    "cell_comments",
];

async fn snapshot_projections(substrate: &Substrate) -> Vec<(String, Vec<Vec<serde_json::Value>>)> {
    let mut tables = Vec::new();
    for table in PROJECTION_TABLES {
        let rows = substrate
            .adapter
            .query(&format!("SELECT * FROM {table} ORDER BY 1, 2"), &[])
            .await
            .unwrap();
        tables.push(((*table).to_string(), rows.rows));
    }
    tables
}

async fn run_scenario(substrate: &Substrate) {
    let alpha = init_agent(substrate, PROJECT, "alpha").await;
    let beta = init_agent(substrate, PROJECT, "beta").await;

    let sent = substrate
        .mailbox
        .send(
            PROJECT,
            &alpha,
            SendMessage {
                to: vec![beta.clone()],
                subject: "plan".into(),
                body: "splitting the work".into(),
                ..SendMessage::default()
            },
        )
        .await
        .unwrap();
    substrate
        .mailbox
        .read_message(PROJECT, &beta, sent.message_id)
        .await
        .unwrap();

    substrate
        .reservations
        .reserve(
            PROJECT,
            &alpha,
            ReserveRequest {
                paths: vec!["src/**".into()],
                ..ReserveRequest::default()
            },
        )
        .await
        .unwrap();
    substrate
        .reservations
        .reserve(
            PROJECT,
            &beta,
            ReserveRequest {
                paths: vec!["src/lib.rs".into()],
                ..ReserveRequest::default()
            },
        )
        .await
        .unwrap();

    let first = substrate
        .hive
        .create_cell(
            PROJECT,
            NewCell {
                title: "first".into(),
                priority: 1,
                ..NewCell::default()
            },
        )
        .await
        .unwrap();
    let second = substrate
        .hive
        .create_cell(
            PROJECT,
            NewCell {
                title: "second".into(),
                priority: 2,
                ..NewCell::default()
            },
        )
        .await
        .unwrap();
    substrate
        .hive
        .add_dependency(PROJECT, &first.id, &second.id, CellRelationship::Blocks)
        .await
        .unwrap();
    substrate
        .hive
        .add_label(PROJECT, &second.id, "follow-up")
        .await
        .unwrap();
    substrate
        .hive
        .add_comment(PROJECT, &first.id, &alpha, "taking this one")
        .await
        .unwrap();
    substrate
        .hive
        .update_cell(
            PROJECT,
            &first.id,
            CellPatch {
                assignee: Some(alpha.clone()),
                ..CellPatch::default()
            },
        )
        .await
        .unwrap();
    substrate.hive.close_cell(PROJECT, &first.id, None).await.unwrap();
}

#[tokio::test]
async fn truncate_and_replay_reproduces_projections_exactly() {
    let substrate = offline_substrate().await;
    run_scenario(&substrate).await;
    // Dirty marks are consumed by exporters, not part of the comparison.
    substrate.hive.drain_dirty(PROJECT).await.unwrap();

    let before = snapshot_projections(&substrate).await;
    let applied = substrate.log.replay(&EventFilter::new(), true).await.unwrap();
    assert!(applied > 0);
    let after = snapshot_projections(&substrate).await;

    assert_eq!(before, after);
}

#[tokio::test]
async fn replay_twice_is_idempotent() {
    let substrate = offline_substrate().await;
    run_scenario(&substrate).await;

    substrate.log.replay(&EventFilter::new(), true).await.unwrap();
    let first = snapshot_projections(&substrate).await;
    substrate.log.replay(&EventFilter::new(), false).await.unwrap();
    let second = snapshot_projections(&substrate).await;

    assert_eq!(first, second);
}

#[tokio::test]
async fn appending_after_replay_matches_incremental_application() {
    let substrate = offline_substrate().await;
    run_scenario(&substrate).await;

    // Apply one more event incrementally...
    let agent = init_agent(&substrate, PROJECT, "gamma").await;
    substrate
        .mailbox
        .send(
            PROJECT,
            &agent,
            SendMessage {
                to: vec!["alpha".into()],
                subject: "late".into(),
                body: "joining".into(),
                ..SendMessage::default()
            },
        )
        .await
        .unwrap();
    substrate.hive.drain_dirty(PROJECT).await.unwrap();
    let incremental = snapshot_projections(&substrate).await;

    // ...and compare against a full rebuild of the extended log.
    substrate.log.replay(&EventFilter::new(), true).await.unwrap();
    substrate.hive.drain_dirty(PROJECT).await.unwrap();
    let rebuilt = snapshot_projections(&substrate).await;
    assert_eq!(incremental, rebuilt);
}

#[tokio::test]
async fn epic_replay_is_scoped_filtered_and_paced() {
    let substrate = offline_substrate().await;
    let agent = init_agent(&substrate, PROJECT, "alpha").await;

    let epic = substrate
        .hive
        .create_cell(
            PROJECT,
            NewCell {
                cell_type: CellType::Epic,
                title: "epic".into(),
                priority: 1,
                ..NewCell::default()
            },
        )
        .await
        .unwrap();
    let children = substrate
        .hive
        .decompose_epic(
            PROJECT,
            &epic.id,
            &agent,
            vec![
                NewCell {
                    title: "child".into(),
                    priority: 1,
                    ..NewCell::default()
                },
            ],
        )
        .await
        .unwrap();
    substrate
        .hive
        .close_cell(PROJECT, &children[0], None)
        .await
        .unwrap();

    // Unrelated noise outside the epic's scope.
    substrate
        .hive
        .create_cell(
            PROJECT,
            NewCell {
                title: "unrelated".into(),
                priority: 2,
                ..NewCell::default()
            },
        )
        .await
        .unwrap();

    let events = substrate
        .replay
        .fetch_epic_events(PROJECT, &epic.id)
        .await
        .unwrap();
    assert!(events.len() >= 3);
    assert!(events.iter().all(|t| {
        let entity = t.event.entity_id.as_deref().unwrap_or_default();
        entity == epic.id || entity == children[0]
    }));
    assert_eq!(events[0].delta_ms, 0);
    // Timestamps ascend, deltas are the gaps.
    assert!(events.windows(2).all(|w| w[1].delta_ms >= 0));

    let closures = substrate.replay.filter_events(
        events.clone(),
        &ReplayFilter {
            kinds: vec!["cell_closed".to_string()],
            ..ReplayFilter::default()
        },
    );
    assert_eq!(closures.len(), 1);
    assert_eq!(closures[0].delta_ms, 0);

    // Instant playback yields everything without pacing waits.
    let mut player = substrate.replay.replay_with_timing(events.clone(), ReplaySpeed::Instant);
    let started = std::time::Instant::now();
    let mut seen = 0;
    while player.next().await.is_some() {
        seen += 1;
    }
    assert_eq!(seen, events.len());
    assert!(started.elapsed() < std::time::Duration::from_millis(250));

    // Restart rewinds the producer.
    player.restart();
    assert!(player.next().await.is_some());
}

#[tokio::test]
async fn mailbox_state_survives_rebuild() {
    let substrate = offline_substrate().await;
    let sender = init_agent(&substrate, PROJECT, "sender").await;
    let recipient = init_agent(&substrate, PROJECT, "recipient").await;

    let sent = substrate
        .mailbox
        .send(
            PROJECT,
            &sender,
            SendMessage {
                to: vec![recipient.clone()],
                subject: "durable".into(),
                body: "contents".into(),
                ..SendMessage::default()
            },
        )
        .await
        .unwrap();

    substrate.log.replay(&EventFilter::new(), true).await.unwrap();

    // Same id, same body, recoverable purely from the log.
    let message = substrate
        .mailbox
        .read_message(PROJECT, &recipient, sent.message_id)
        .await
        .unwrap();
    assert_eq!(message.body, "contents");

    let inbox = substrate
        .mailbox
        .inbox(PROJECT, &recipient, InboxQuery::default())
        .await
        .unwrap();
    assert_eq!(inbox.messages.len(), 1);
}
