//! End-to-end session and tree scenarios, exercised at the synchronizer
//! boundary: intents in, targeted frames and broadcast events out.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{connect, recv_game_state, spawn_harness};
use kifulab::sync::OutboundFrame;
use kifulab::wire::{ServerMessage, ToastLevel};
use kifulab_config::EngineSettings;

#[tokio::test]
async fn first_connection_is_granted_with_full_state() {
    let harness = spawn_harness(EngineSettings::default());
    let (_client, first) = connect(&harness).await;

    let ServerMessage::SessionGranted(granted) = first else {
        panic!("expected session:granted, got {:?}", first);
    };
    assert!(!granted.session_id.is_empty());
    assert!(!granted.owner_token.is_empty());
    assert_eq!(granted.game.game_id, harness.game_id);
    assert_eq!(granted.game.root_node_id, harness.root_node_id);
    assert_eq!(granted.game.current_node_id, harness.root_node_id);
    assert!(!granted.server_capabilities.analysis);
    assert!(!granted.analysis_state.enabled);
}

#[tokio::test]
async fn second_connection_sees_busy() {
    let harness = spawn_harness(EngineSettings::default());
    let (_a, _) = connect(&harness).await;
    let (_b, first_b) = connect(&harness).await;

    let ServerMessage::SessionBusy { owner_since, .. } = first_b else {
        panic!("expected session:busy, got {:?}", first_b);
    };
    assert!(owner_since.is_some());
}

#[tokio::test]
async fn takeover_kicks_old_owner_and_rotates_tokens() {
    let harness = spawn_harness(EngineSettings::default());
    let (mut a, granted_a) = connect(&harness).await;
    let ServerMessage::SessionGranted(granted_a) = granted_a else {
        panic!("expected grant for A");
    };

    let (mut b, _busy) = connect(&harness).await;
    b.send(&harness, "session:takeover", json!({}));

    // A is kicked and its channel closed.
    let kicked = a.recv_message().await;
    assert!(
        matches!(kicked, ServerMessage::SessionKicked { ref reason } if reason == "takeover"),
        "got {:?}",
        kicked
    );
    assert!(matches!(a.recv().await, OutboundFrame::Close));

    // B is granted with a fresh pair.
    let granted_b = b.recv_message().await;
    let ServerMessage::SessionGranted(granted_b) = granted_b else {
        panic!("expected grant for B");
    };
    assert_ne!(granted_b.session_id, granted_a.session_id);
    assert_ne!(granted_b.owner_token, granted_a.owner_token);
    b.session_id = Some(granted_b.session_id.clone());
    b.owner_token = Some(granted_b.owner_token.clone());

    let toast = b.recv_message().await;
    assert!(matches!(toast, ServerMessage::Toast { level: ToastLevel::Info, .. }));
}

#[tokio::test]
async fn stale_write_after_takeover_is_rejected() {
    let harness = spawn_harness(EngineSettings::default());
    let (mut a, granted_a) = connect(&harness).await;
    let ServerMessage::SessionGranted(granted_a) = granted_a else {
        panic!("expected grant for A");
    };

    let (mut b, _busy) = connect(&harness).await;
    b.send(&harness, "session:takeover", json!({}));
    let _kicked = a.recv_message().await;
    let _close = a.recv().await;
    let _granted_b = b.recv_message().await;

    // A delayed frame from A still carrying the old pair.
    a.send_with_tokens(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
        Some(granted_a.session_id.clone()),
        Some(granted_a.owner_token.clone()),
    );

    let reply = a.recv_message().await;
    assert!(
        matches!(reply, ServerMessage::SessionStale { .. }),
        "got {:?}",
        reply
    );

    // The move was never applied.
    let game = harness
        .store
        .get_game_with_tree(&harness.game_id)
        .unwrap()
        .unwrap();
    assert_eq!(game.node_count(), 1);
}

#[tokio::test]
async fn tokenless_frames_from_observers_are_dropped_silently() {
    let harness = spawn_harness(EngineSettings::default());
    let (_a, _) = connect(&harness).await;
    let (mut b, _busy) = connect(&harness).await;

    b.send_with_tokens(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
        None,
        None,
    );
    b.expect_silence(Duration::from_millis(300)).await;
}

#[tokio::test]
async fn play_move_is_deduplicated() {
    let harness = spawn_harness(EngineSettings::default());
    let mut events = harness.sync.subscribe();
    let (client, _granted) = connect(&harness).await;

    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
    );
    let state1 = recv_game_state(&mut events).await;
    let child_id = state1.current_node_id.clone();
    assert_ne!(child_id, harness.root_node_id);

    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
    );
    let state2 = recv_game_state(&mut events).await;
    assert_eq!(state2.current_node_id, child_id);
    assert_eq!(state2.children_index[&harness.root_node_id].len(), 1);
    assert_eq!(state2.nodes.len(), 2);
}

#[tokio::test]
async fn invalid_moves_produce_an_error_toast_and_no_node() {
    let harness = spawn_harness(EngineSettings::default());
    let (mut client, _granted) = connect(&harness).await;

    // White's pawn cannot move first.
    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "3c3d"}),
    );
    let toast = client.recv_message().await;
    assert!(
        matches!(toast, ServerMessage::Toast { level: ToastLevel::Error, .. }),
        "got {:?}",
        toast
    );
    let game = harness
        .store
        .get_game_with_tree(&harness.game_id)
        .unwrap()
        .unwrap();
    assert_eq!(game.node_count(), 1);
}

#[tokio::test]
async fn reorder_children_is_reflected_in_broadcast_state() {
    let harness = spawn_harness(EngineSettings::default());
    let mut events = harness.sync.subscribe();
    let (client, _granted) = connect(&harness).await;

    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
    );
    let state = recv_game_state(&mut events).await;
    let c1 = state.current_node_id.clone();

    client.send(&harness, "node:jump", json!({"node_id": harness.root_node_id}));
    recv_game_state(&mut events).await;

    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "2g2f"}),
    );
    let state = recv_game_state(&mut events).await;
    let c2 = state.current_node_id.clone();

    client.send(
        &harness,
        "node:reorder_children",
        json!({"parent_id": harness.root_node_id, "ordered_child_ids": [c2, c1]}),
    );
    let state = recv_game_state(&mut events).await;
    assert_eq!(
        state.children_index[&harness.root_node_id],
        vec![c2.clone(), c1.clone()]
    );
    // order_index was rewritten, the cursor untouched.
    let node_c1 = state.nodes.iter().find(|n| n.node_id == c1).unwrap();
    let node_c2 = state.nodes.iter().find(|n| n.node_id == c2).unwrap();
    assert_eq!(node_c2.order_index, 0);
    assert_eq!(node_c1.order_index, 1);
    assert_eq!(state.current_node_id, c2);
}

#[tokio::test]
async fn bad_reorder_permutation_is_rejected_whole() {
    let harness = spawn_harness(EngineSettings::default());
    let mut events = harness.sync.subscribe();
    let (mut client, _granted) = connect(&harness).await;

    client.send(
        &harness,
        "node:play_move",
        json!({"from_node_id": harness.root_node_id, "move_usi": "7g7f"}),
    );
    let state = recv_game_state(&mut events).await;
    let c1 = state.current_node_id.clone();

    client.send(
        &harness,
        "node:reorder_children",
        json!({"parent_id": harness.root_node_id, "ordered_child_ids": [c1, "bogus"]}),
    );
    let toast = client.recv_message().await;
    assert!(matches!(toast, ServerMessage::Toast { level: ToastLevel::Error, .. }));

    let game = harness
        .store
        .get_game_with_tree(&harness.game_id)
        .unwrap()
        .unwrap();
    assert_eq!(game.children_of(&harness.root_node_id)[0].order_index, 0);
}

#[tokio::test]
async fn set_comment_persists() {
    let harness = spawn_harness(EngineSettings::default());
    let (client, _granted) = connect(&harness).await;
    let mut events = harness.sync.subscribe();

    client.send(
        &harness,
        "node:set_comment",
        json!({"node_id": harness.root_node_id, "comment": "opening notes"}),
    );
    let state = recv_game_state(&mut events).await;
    let root = state
        .nodes
        .iter()
        .find(|n| n.node_id == harness.root_node_id)
        .unwrap();
    assert_eq!(root.comment, "opening notes");

    let game = harness
        .store
        .get_game_with_tree(&harness.game_id)
        .unwrap()
        .unwrap();
    assert_eq!(game.node(&harness.root_node_id).unwrap().comment, "opening notes");
}

#[tokio::test]
async fn enable_without_engine_is_refused() {
    let harness = spawn_harness(EngineSettings::default());
    let (mut client, _granted) = connect(&harness).await;

    client.send(&harness, "analysis:set_enabled", json!({"enabled": true}));
    let toast = client.recv_message().await;
    assert!(matches!(toast, ServerMessage::Toast { level: ToastLevel::Warning, .. }));
    let stopped = client.recv_message().await;
    assert!(
        matches!(stopped, ServerMessage::AnalysisStopped { ref reason } if reason == "not_configured")
    );

    // The flag was not flipped.
    let game = harness
        .store
        .get_game_with_tree(&harness.game_id)
        .unwrap()
        .unwrap();
    assert!(!game.analysis_enabled());
}

#[tokio::test]
async fn owner_disconnect_frees_the_slot() {
    let harness = spawn_harness(EngineSettings::default());
    let (a, _granted) = connect(&harness).await;
    a.disconnect(&harness);

    let (_b, first_b) = connect(&harness).await;
    assert!(matches!(first_b, ServerMessage::SessionGranted(_)));
}

#[tokio::test]
async fn game_new_replaces_current_game() {
    let harness = spawn_harness(EngineSettings::default());
    let mut events = harness.sync.subscribe();
    let (client, _granted) = connect(&harness).await;

    client.send(&harness, "game:new", json!({"title": "second"}));
    let state = recv_game_state(&mut events).await;
    assert_ne!(state.game_id, harness.game_id);
    assert_eq!(state.title, "second");

    // Both games exist on disk; the cursor key points at the new one.
    let (_items, total) = harness.store.list_games(10, 0).unwrap();
    assert_eq!(total, 2);
    assert_eq!(
        harness.store.last_game_id().unwrap().as_deref(),
        Some(state.game_id.as_str())
    );
}

#[tokio::test]
async fn import_intent_installs_parsed_game() {
    let harness = spawn_harness(EngineSettings::default());
    let imported = harness
        .sync
        .import_text("position startpos moves 7g7f 3c3d".to_string(), None)
        .await
        .unwrap()
        .unwrap();
    let (format, wire) = imported;
    assert_eq!(format, kifulab_core::codec::Format::Usi);
    assert_eq!(wire.nodes.len(), 3);
    assert_eq!(wire.current_path_moves, vec!["7g7f", "3c3d"]);

    let rejected = harness
        .sync
        .import_text("this is not a kifu".to_string(), None)
        .await
        .unwrap();
    assert!(rejected.is_err());
}
