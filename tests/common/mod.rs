//! Shared harness: a synchronizer over an in-memory store plus fake
//! connections that speak the wire protocol directly.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use kifulab::analysis::AnalysisCoordinator;
use kifulab::store::SqliteStore;
use kifulab::supervisor::UsiSupervisor;
use kifulab::sync::{Intent, OutboundFrame, SyncHandle, Synchronizer};
use kifulab::wire::{ClientEnvelope, ServerMessage};
use kifulab_config::EngineSettings;
use kifulab_core::codec::CodecRegistry;
use kifulab_core::tree::Game;

pub struct Harness {
    pub sync: SyncHandle,
    pub store: Arc<SqliteStore>,
    pub coordinator: Arc<AnalysisCoordinator>,
    pub game_id: String,
    pub root_node_id: String,
}

pub fn spawn_harness(engine: EngineSettings) -> Harness {
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let game = Game::new(Some("harness"), None).unwrap();
    let game_id = game.game_id.clone();
    let root_node_id = game.root_node_id.clone();
    store.put_game(&game).unwrap();
    store.set_last_game_id(Some(&game_id)).unwrap();

    let (events, _) = broadcast::channel(1024);
    let supervisor = Arc::new(UsiSupervisor::new(engine));
    let coordinator = Arc::new(AnalysisCoordinator::new(
        Arc::clone(&supervisor),
        Arc::clone(&store),
        events.clone(),
    ));
    let codecs = Arc::new(CodecRegistry::standard());
    let sync = Synchronizer::spawn(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        codecs,
        events,
        game,
    );

    Harness {
        sync,
        store,
        coordinator,
        game_id,
        root_node_id,
    }
}

/// A fake connection: targeted frames arrive on `rx`
pub struct Client {
    pub conn_id: u64,
    pub rx: mpsc::UnboundedReceiver<OutboundFrame>,
    pub session_id: Option<String>,
    pub owner_token: Option<String>,
}

impl Client {
    /// Send a frame carrying this client's current token pair
    pub fn send(&self, harness: &Harness, msg_type: &str, payload: Value) {
        harness.sync.send(Intent::Frame {
            conn_id: self.conn_id,
            envelope: ClientEnvelope {
                msg_type: msg_type.to_string(),
                payload,
                session_id: self.session_id.clone(),
                owner_token: self.owner_token.clone(),
            },
        });
    }

    /// Send a frame with an explicit (possibly stale) token pair
    pub fn send_with_tokens(
        &self,
        harness: &Harness,
        msg_type: &str,
        payload: Value,
        session_id: Option<String>,
        owner_token: Option<String>,
    ) {
        harness.sync.send(Intent::Frame {
            conn_id: self.conn_id,
            envelope: ClientEnvelope {
                msg_type: msg_type.to_string(),
                payload,
                session_id,
                owner_token,
            },
        });
    }

    pub fn disconnect(&self, harness: &Harness) {
        harness.sync.send(Intent::Disconnected {
            conn_id: self.conn_id,
        });
    }

    /// Next targeted frame, with a timeout
    pub async fn recv(&mut self) -> OutboundFrame {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a targeted frame")
            .expect("connection channel closed")
    }

    /// Next targeted message, panicking on Close
    pub async fn recv_message(&mut self) -> ServerMessage {
        match self.recv().await {
            OutboundFrame::Message(message) => message,
            OutboundFrame::Close => panic!("unexpected close frame"),
        }
    }

    /// Assert that no targeted frame arrives within the window
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(frame) = tokio::time::timeout(window, self.rx.recv()).await {
            panic!("expected silence, got {:?}", frame);
        }
    }
}

/// Register a connection and consume its first targeted frame
/// (`session:granted` or `session:busy`)
pub async fn connect(harness: &Harness) -> (Client, ServerMessage) {
    let conn_id = harness.sync.new_conn_id();
    let (tx, rx) = mpsc::unbounded_channel();
    harness.sync.send(Intent::Connected {
        conn_id,
        sender: tx,
    });
    let mut client = Client {
        conn_id,
        rx,
        session_id: None,
        owner_token: None,
    };
    let first = client.recv_message().await;
    if let ServerMessage::SessionGranted(granted) = &first {
        client.session_id = Some(granted.session_id.clone());
        client.owner_token = Some(granted.owner_token.clone());
    }
    (client, first)
}

/// Wait for the next broadcast event, with a timeout
pub async fn recv_event(rx: &mut broadcast::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a broadcast event")
        .expect("broadcast channel closed")
}

/// Wait (bounded) for the next broadcast `game:state`
pub async fn recv_game_state(
    rx: &mut broadcast::Receiver<ServerMessage>,
) -> kifulab_core::tree::GameWire {
    for _ in 0..32 {
        if let ServerMessage::GameState { game } = recv_event(rx).await {
            return *game;
        }
    }
    panic!("no game:state within 32 events");
}
