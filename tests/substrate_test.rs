//! File-backed substrate lifecycle: state survives process restarts.

mod common;

use std::sync::Arc;

use apiary::services::mailbox::SendMessage;
use apiary::{Config, NewCell, NullInferenceClient, Substrate};

const PROJECT: &str = "/work/checkout";

#[tokio::test]
async fn state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database.path = dir
        .path()
        .join("core.db")
        .to_string_lossy()
        .into_owned();

    let inference = Arc::new(NullInferenceClient::new());

    let cell_id = {
        let substrate = Substrate::open(&config, inference.clone()).await.unwrap();
        let sender = substrate
            .mailbox
            .init(PROJECT, Some("alpha"), None, None)
            .await
            .unwrap()
            .agent;
        substrate
            .mailbox
            .init(PROJECT, Some("beta"), None, None)
            .await
            .unwrap();
        substrate
            .mailbox
            .send(
                PROJECT,
                &sender,
                SendMessage {
                    to: vec!["beta".into()],
                    subject: "persisted".into(),
                    body: "across restarts".into(),
                    ..SendMessage::default()
                },
            )
            .await
            .unwrap();
        let cell = substrate
            .hive
            .create_cell(
                PROJECT,
                NewCell {
                    title: "durable work".into(),
                    priority: 1,
                    ..NewCell::default()
                },
            )
            .await
            .unwrap();
        substrate.close().await;
        cell.id
    };

    // A fresh process: new pool, empty session registry, same file.
    let substrate = Substrate::open(&config, inference).await.unwrap();
    assert_eq!(substrate.log.count().await.unwrap(), 4);

    let cell = substrate.hive.get_cell(&cell_id).await.unwrap();
    assert_eq!(cell.title, "durable work");

    // Sessions are per-process: beta must re-init before reading.
    let beta = substrate
        .mailbox
        .init(PROJECT, Some("beta"), None, None)
        .await
        .unwrap();
    assert!(!beta.already_initialized);

    let agents = substrate.mailbox.agents(PROJECT).await.unwrap();
    assert_eq!(agents.len(), 2);
}
