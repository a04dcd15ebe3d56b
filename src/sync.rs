//! State synchronizer
//!
//! The single writer. Connection readers and HTTP handlers turn requests
//! into [`Intent`]s; this task applies them to the game tree, the session
//! slot and the analysis coordinator strictly in arrival order, persists
//! every mutation, and only then broadcasts the resulting snapshot. A
//! position change cancels the running analysis before the state
//! broadcast, so stale analysis events can never trail a newer
//! `game:state`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use kifulab_core::codec::{CodecRegistry, Format};
use kifulab_core::error::CodecError;
use kifulab_core::sfen::position_command;
use kifulab_core::tree::{Game, GameWire};

use crate::analysis::{
    AnalysisCoordinator, REASON_DISABLED, REASON_OWNER_DISCONNECTED, REASON_POSITION_CHANGED,
    REASON_STOPPED_BY_USER,
};
use crate::session::{ConnId, SessionHub};
use crate::store::SqliteStore;
use crate::wire::{
    AnalysisStartPayload, AnalysisState, ClientEnvelope, CommentPayload, GameLoadPayload,
    GameNewPayload, GameSavePayload, GrantedPayload, JumpPayload, PlayMovePayload, ReorderPayload,
    ServerCapabilities, ServerMessage, SetEnabledPayload, SetMultipvPayload, ToastLevel,
};

/// Targeted frame for one connection
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    Message(ServerMessage),
    /// Ask the connection task to close its socket (takeover kicks)
    Close,
}

/// One unit of work for the synchronizer
pub enum Intent {
    Connected {
        conn_id: ConnId,
        sender: mpsc::UnboundedSender<OutboundFrame>,
    },
    Disconnected {
        conn_id: ConnId,
    },
    Frame {
        conn_id: ConnId,
        envelope: ClientEnvelope,
    },
    CreateGame {
        title: Option<String>,
        initial_sfen: Option<String>,
        reply: oneshot::Sender<Result<GameWire>>,
    },
    UpdateGame {
        game_id: String,
        payload: GameSavePayload,
        reply: oneshot::Sender<Result<Option<GameWire>>>,
    },
    ImportText {
        text: String,
        title: Option<String>,
        reply: oneshot::Sender<Result<(Format, GameWire), CodecError>>,
    },
    CurrentGame {
        reply: oneshot::Sender<GameWire>,
    },
}

/// Cheap cloneable handle used by connection tasks and HTTP handlers
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<Intent>,
    events: broadcast::Sender<ServerMessage>,
    next_conn_id: Arc<AtomicU64>,
}

impl SyncHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events.subscribe()
    }

    pub fn new_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn send(&self, intent: Intent) {
        let _ = self.tx.send(intent);
    }

    pub async fn create_game(
        &self,
        title: Option<String>,
        initial_sfen: Option<String>,
    ) -> Result<GameWire> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::CreateGame {
            title,
            initial_sfen,
            reply,
        });
        rx.await.context("synchronizer unavailable")?
    }

    pub async fn update_game(
        &self,
        game_id: String,
        payload: GameSavePayload,
    ) -> Result<Option<GameWire>> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::UpdateGame {
            game_id,
            payload,
            reply,
        });
        rx.await.context("synchronizer unavailable")?
    }

    pub async fn import_text(
        &self,
        text: String,
        title: Option<String>,
    ) -> Result<Result<(Format, GameWire), CodecError>> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::ImportText { text, title, reply });
        rx.await.context("synchronizer unavailable")
    }

    pub async fn current_game(&self) -> Result<GameWire> {
        let (reply, rx) = oneshot::channel();
        self.send(Intent::CurrentGame { reply });
        rx.await.context("synchronizer unavailable")
    }
}

pub struct Synchronizer {
    store: Arc<SqliteStore>,
    coordinator: Arc<AnalysisCoordinator>,
    codecs: Arc<CodecRegistry>,
    events: broadcast::Sender<ServerMessage>,
    game: Game,
    hub: SessionHub,
    conns: HashMap<ConnId, mpsc::UnboundedSender<OutboundFrame>>,
}

impl Synchronizer {
    /// Spawn the synchronizer task over a restored game and return the
    /// handle everything else talks through.
    pub fn spawn(
        store: Arc<SqliteStore>,
        coordinator: Arc<AnalysisCoordinator>,
        codecs: Arc<CodecRegistry>,
        events: broadcast::Sender<ServerMessage>,
        game: Game,
    ) -> SyncHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SyncHandle {
            tx,
            events: events.clone(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
        };
        let sync = Synchronizer {
            store,
            coordinator,
            codecs,
            events,
            game,
            hub: SessionHub::new(),
            conns: HashMap::new(),
        };
        tokio::spawn(sync.run(rx));
        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Intent>) {
        while let Some(intent) = rx.recv().await {
            self.handle_intent(intent).await;
        }
        debug!(target: "kifulab::sync", "synchronizer channel closed");
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::Connected { conn_id, sender } => {
                self.conns.insert(conn_id, sender);
                if let Some(slot) = self.hub.try_grant(conn_id) {
                    info!(target: "kifulab::sync", "session granted to connection {}", conn_id);
                    let granted = self.granted_payload(&slot.session_id, &slot.owner_token);
                    self.send_to(conn_id, ServerMessage::SessionGranted(Box::new(granted)));
                } else {
                    let owner_since = self.hub.owner().map(|s| s.since.clone());
                    self.send_to(
                        conn_id,
                        ServerMessage::SessionBusy {
                            owner_since,
                            owner_hint: "send session:takeover to claim the session".to_string(),
                        },
                    );
                }
            }

            Intent::Disconnected { conn_id } => {
                self.conns.remove(&conn_id);
                if self.hub.release_if_owner(conn_id) {
                    info!(target: "kifulab::sync", "owner connection {} disconnected", conn_id);
                    if self.coordinator.active_node().await.is_some() {
                        self.coordinator.stop(REASON_OWNER_DISCONNECTED).await;
                    }
                    if self.game.analysis_enabled() {
                        self.game.set_analysis_enabled(false);
                        self.persist();
                    }
                }
            }

            Intent::Frame { conn_id, envelope } => {
                self.handle_frame(conn_id, envelope).await;
            }

            Intent::CreateGame {
                title,
                initial_sfen,
                reply,
            } => {
                let result = self
                    .install_new_game(title.as_deref(), initial_sfen.as_deref())
                    .await;
                let _ = reply.send(result);
            }

            Intent::UpdateGame {
                game_id,
                payload,
                reply,
            } => {
                let result = self.update_game(&game_id, payload).await;
                let _ = reply.send(result);
            }

            Intent::ImportText { text, title, reply } => {
                let result = self.import_text(&text, title.as_deref()).await;
                let _ = reply.send(result);
            }

            Intent::CurrentGame { reply } => {
                let _ = reply.send(self.game.to_wire());
            }
        }
    }

    // ---- outbound helpers -------------------------------------------------

    fn send_to(&self, conn_id: ConnId, message: ServerMessage) {
        if let Some(sender) = self.conns.get(&conn_id) {
            let _ = sender.send(OutboundFrame::Message(message));
        }
    }

    fn toast_to(&self, conn_id: ConnId, level: ToastLevel, message: impl Into<String>) {
        self.send_to(conn_id, ServerMessage::toast(level, message));
    }

    fn broadcast_state(&self) {
        let _ = self.events.send(ServerMessage::GameState {
            game: Box::new(self.game.to_wire()),
        });
    }

    /// Persist the whole game (row + full node rewrite); a failed write is
    /// logged and surfaced as a broadcast toast but never leaves the
    /// in-memory state inconsistent.
    fn persist(&self) {
        if let Err(err) = self.store.put_game(&self.game) {
            error!(target: "kifulab::sync", "persist failed: {:#}", err);
            let _ = self.events.send(ServerMessage::toast(
                ToastLevel::Error,
                "failed to persist game state",
            ));
        }
        self.persist_cursor_keys();
    }

    /// Persist only the games row (cursor, title, meta, ui_state)
    fn persist_row(&self) {
        if let Err(err) = self.store.update_game_row(&self.game) {
            error!(target: "kifulab::sync", "row persist failed: {:#}", err);
            let _ = self.events.send(ServerMessage::toast(
                ToastLevel::Error,
                "failed to persist game state",
            ));
        }
        self.persist_cursor_keys();
    }

    /// Persist named nodes plus the games row
    fn persist_nodes(&self, node_ids: &[&str]) {
        for node_id in node_ids {
            match self.game.node(node_id) {
                Ok(node) => {
                    if let Err(err) = self.store.upsert_node(node) {
                        error!(target: "kifulab::sync", "node persist failed: {:#}", err);
                    }
                }
                Err(err) => {
                    warn!(target: "kifulab::sync", "persist of unknown node: {}", err)
                }
            }
        }
        self.persist_row();
    }

    fn persist_cursor_keys(&self) {
        if let Err(err) = self.store.set_last_game_id(Some(&self.game.game_id)) {
            warn!(target: "kifulab::sync", "app_state write failed: {:#}", err);
        }
        let cursor = serde_json::Value::from(self.game.current_node_id.as_str());
        if let Err(err) = self.store.put_app_state("last_seen_cursor", &cursor) {
            warn!(target: "kifulab::sync", "app_state write failed: {:#}", err);
        }
    }

    fn granted_payload(&self, session_id: &str, owner_token: &str) -> GrantedPayload {
        GrantedPayload {
            game: self.game.to_wire(),
            server_capabilities: ServerCapabilities::for_engine(self.coordinator.is_available()),
            engine_status: self.coordinator.supervisor().status_wire(),
            analysis_state: AnalysisState {
                enabled: self.game.analysis_enabled(),
                multipv: self.game.analysis_multipv(),
            },
            session_id: session_id.to_string(),
            owner_token: owner_token.to_string(),
        }
    }

    // ---- analysis glue ----------------------------------------------------

    /// Cancel a search that no longer matches the current node. Runs before
    /// the state broadcast so stopped/stale events precede the new state.
    async fn cancel_stale_search(&self) {
        if let Some(active) = self.coordinator.active_node().await {
            if active != self.game.current_node_id {
                self.coordinator.stop(REASON_POSITION_CHANGED).await;
            }
        }
    }

    fn position_command_for(&self, node_id: &str) -> Result<String, String> {
        let path = self
            .game
            .path_to(node_id)
            .map_err(|e| format!("invalid node for analysis: {}", e))?;
        let moves: Vec<String> = path.iter().filter_map(|n| n.move_usi.clone()).collect();
        position_command(&self.game.initial_sfen, &moves).map_err(|e| e.to_string())
    }

    /// Converge the engine onto the current node and enabled flag
    async fn sync_analysis(&mut self) {
        let enabled = self.game.analysis_enabled();
        let active = self.coordinator.active_node().await;

        if !enabled {
            if active.is_some() {
                self.coordinator.stop(REASON_DISABLED).await;
            }
            return;
        }
        if !self.coordinator.is_available() {
            return;
        }
        let current = self.game.current_node_id.clone();
        if active.as_deref() == Some(current.as_str()) {
            return;
        }

        let command = match self.position_command_for(&current) {
            Ok(command) => command,
            Err(message) => {
                let _ = self.events.send(ServerMessage::stopped("invalid_position"));
                let _ = self
                    .events
                    .send(ServerMessage::toast(ToastLevel::Error, message));
                return;
            }
        };
        let multipv = self.game.analysis_multipv();
        if self
            .coordinator
            .start(&current, &command, multipv)
            .await
            .is_err()
        {
            // The coordinator already emitted analysis:stopped + toast.
            self.game.set_analysis_enabled(false);
            self.persist();
            self.broadcast_state();
        }
    }

    /// Epilogue for cursor-moving mutations whose node set is unchanged
    /// (jump, save): cancel a stale search before the broadcast, persist the
    /// row, broadcast, re-converge analysis.
    async fn after_row_mutation(&mut self) {
        self.cancel_stale_search().await;
        self.persist_row();
        self.broadcast_state();
        self.sync_analysis().await;
    }

    /// Epilogue for play_move: the (possibly new) child is persisted
    /// individually, everything else as in [`after_row_mutation`].
    async fn after_play_move(&mut self, node_id: &str) {
        self.cancel_stale_search().await;
        self.persist_nodes(&[node_id]);
        self.broadcast_state();
        self.sync_analysis().await;
    }

    // ---- game installation (new / load / import) --------------------------

    async fn install_game(&mut self, game: Game) {
        self.game = game;
        self.cancel_stale_search().await;
        self.persist();
        self.broadcast_state();
        self.sync_analysis().await;
    }

    async fn install_new_game(
        &mut self,
        title: Option<&str>,
        initial_sfen: Option<&str>,
    ) -> Result<GameWire> {
        let game = Game::new(title, initial_sfen).context("invalid initial position")?;
        self.install_game(game).await;
        Ok(self.game.to_wire())
    }

    async fn update_game(
        &mut self,
        game_id: &str,
        payload: GameSavePayload,
    ) -> Result<Option<GameWire>> {
        if game_id == self.game.game_id {
            if let Err(message) = apply_save_payload(&mut self.game, &payload) {
                anyhow::bail!(message);
            }
            self.after_row_mutation().await;
            return Ok(Some(self.game.to_wire()));
        }

        // Not the live game: edit it in place on disk without switching.
        let Some(mut game) = self.store.get_game_with_tree(game_id)? else {
            return Ok(None);
        };
        if let Err(message) = apply_save_payload(&mut game, &payload) {
            anyhow::bail!(message);
        }
        self.store.put_game(&game)?;
        Ok(Some(game.to_wire()))
    }

    async fn import_text(
        &mut self,
        text: &str,
        title: Option<&str>,
    ) -> Result<(Format, GameWire), CodecError> {
        let (format, outcome) = self.codecs.parse_auto(text, title)?;
        for warning in &outcome.warnings {
            debug!(target: "kifulab::sync", "import warning: {}", warning);
        }
        self.install_game(outcome.game).await;
        Ok((format, self.game.to_wire()))
    }

    // ---- frame routing ----------------------------------------------------

    async fn handle_frame(&mut self, conn_id: ConnId, envelope: ClientEnvelope) {
        if envelope.msg_type == "session:takeover" {
            self.handle_takeover(conn_id).await;
            return;
        }

        if !self
            .hub
            .is_fresh(envelope.session_id.as_deref(), envelope.owner_token.as_deref())
            || !self.hub.is_owner(conn_id)
        {
            // A frame that presents tokens claims ownership; answering with
            // session:stale lets displaced owners notice the takeover.
            // Token-less frames from non-owners are dropped silently.
            if envelope.session_id.is_some() || envelope.owner_token.is_some() {
                self.send_to(
                    conn_id,
                    ServerMessage::SessionStale {
                        reason: "stale session_id/owner_token".to_string(),
                    },
                );
            } else {
                debug!(
                    target: "kifulab::sync",
                    "dropping {} from non-owner connection {}", envelope.msg_type, conn_id
                );
            }
            return;
        }

        self.handle_owner_frame(conn_id, envelope).await;
    }

    async fn handle_takeover(&mut self, conn_id: ConnId) {
        if self.hub.is_owner(conn_id) {
            // Idempotent: re-send the grant with the existing tokens.
            if let Some(slot) = self.hub.owner() {
                let granted = self.granted_payload(&slot.session_id, &slot.owner_token);
                self.send_to(conn_id, ServerMessage::SessionGranted(Box::new(granted)));
            }
            return;
        }

        let (old_conn, slot) = self.hub.takeover(conn_id);
        if let Some(old_conn) = old_conn {
            info!(
                target: "kifulab::sync",
                "connection {} took over the session from {}", conn_id, old_conn
            );
            self.send_to(
                old_conn,
                ServerMessage::SessionKicked {
                    reason: "takeover".to_string(),
                },
            );
            if let Some(sender) = self.conns.get(&old_conn) {
                let _ = sender.send(OutboundFrame::Close);
            }
        }
        let granted = self.granted_payload(&slot.session_id, &slot.owner_token);
        self.send_to(conn_id, ServerMessage::SessionGranted(Box::new(granted)));
        self.toast_to(conn_id, ToastLevel::Info, "session takeover complete");
    }

    async fn handle_owner_frame(&mut self, conn_id: ConnId, envelope: ClientEnvelope) {
        let msg_type = envelope.msg_type.as_str();
        let payload = envelope.payload;

        macro_rules! parse_payload {
            ($ty:ty) => {
                match serde_json::from_value::<$ty>(payload) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        self.toast_to(
                            conn_id,
                            ToastLevel::Error,
                            format!("invalid {} payload: {}", msg_type, err),
                        );
                        return;
                    }
                }
            };
        }

        match msg_type {
            "game:new" => {
                let payload = parse_payload!(GameNewPayload);
                if let Err(err) = self
                    .install_new_game(payload.title.as_deref(), payload.initial_sfen.as_deref())
                    .await
                {
                    self.toast_to(conn_id, ToastLevel::Error, format!("game:new failed: {:#}", err));
                }
            }

            "game:load" => {
                let payload = parse_payload!(GameLoadPayload);
                match self.store.get_game_with_tree(&payload.game_id) {
                    Ok(Some(game)) => self.install_game(game).await,
                    Ok(None) => self.toast_to(conn_id, ToastLevel::Error, "game not found"),
                    Err(err) => {
                        self.toast_to(conn_id, ToastLevel::Error, format!("load failed: {:#}", err))
                    }
                }
            }

            "game:save" => {
                let payload = parse_payload!(GameSavePayload);
                match apply_save_payload(&mut self.game, &payload) {
                    Ok(()) => self.after_row_mutation().await,
                    Err(message) => {
                        self.toast_to(conn_id, ToastLevel::Error, format!("save failed: {}", message))
                    }
                }
            }

            "node:play_move" => {
                let payload = parse_payload!(PlayMovePayload);
                match self
                    .game
                    .play_move(&payload.from_node_id, &payload.move_usi)
                {
                    Ok(node_id) => self.after_play_move(&node_id).await,
                    Err(err) => {
                        self.toast_to(conn_id, ToastLevel::Error, format!("play_move failed: {}", err))
                    }
                }
            }

            "node:jump" => {
                let payload = parse_payload!(JumpPayload);
                match self.game.jump(&payload.node_id) {
                    Ok(()) => self.after_row_mutation().await,
                    Err(err) => {
                        self.toast_to(conn_id, ToastLevel::Error, format!("jump failed: {}", err))
                    }
                }
            }

            "node:reorder_children" => {
                let payload = parse_payload!(ReorderPayload);
                match self
                    .game
                    .reorder_children(&payload.parent_id, &payload.ordered_child_ids)
                {
                    Ok(()) => {
                        // order_index is presentation only: no search to
                        // cancel, no cursor movement.
                        if let Err(err) = self
                            .store
                            .rewrite_children_order(&payload.parent_id, &payload.ordered_child_ids)
                        {
                            error!(target: "kifulab::sync", "reorder persist failed: {:#}", err);
                        }
                        self.persist_row();
                        self.broadcast_state();
                    }
                    Err(err) => {
                        self.toast_to(conn_id, ToastLevel::Error, format!("reorder failed: {}", err))
                    }
                }
            }

            "node:set_comment" => {
                let payload = parse_payload!(CommentPayload);
                match self.game.set_comment(&payload.node_id, &payload.comment) {
                    Ok(()) => {
                        self.persist_nodes(&[payload.node_id.as_str()]);
                        self.broadcast_state();
                    }
                    Err(err) => self.toast_to(
                        conn_id,
                        ToastLevel::Error,
                        format!("set_comment failed: {}", err),
                    ),
                }
            }

            "analysis:set_enabled" => {
                let payload = parse_payload!(SetEnabledPayload);
                if payload.enabled && !self.coordinator.is_available() {
                    self.toast_to(
                        conn_id,
                        ToastLevel::Warning,
                        "analysis engine is not configured on the server",
                    );
                    self.send_to(conn_id, ServerMessage::stopped("not_configured"));
                    return;
                }
                self.game.set_analysis_enabled(payload.enabled);
                self.persist();
                self.broadcast_state();
                self.sync_analysis().await;
            }

            "analysis:set_multipv" => {
                let payload = parse_payload!(SetMultipvPayload);
                if !(1..=5).contains(&payload.multipv) {
                    self.toast_to(conn_id, ToastLevel::Error, "multipv must be between 1 and 5");
                    return;
                }
                self.game.set_analysis_multipv(payload.multipv);
                self.persist();
                self.broadcast_state();
                // Engines are not required to accept MultiPV mid-search:
                // silently cancel and restart with the new width.
                if self.game.analysis_enabled() {
                    let current = self.game.current_node_id.clone();
                    if let Ok(command) = self.position_command_for(&current) {
                        let _ = self
                            .coordinator
                            .start(&current, &command, payload.multipv)
                            .await;
                    }
                }
            }

            "analysis:start" => {
                let payload = parse_payload!(AnalysisStartPayload);
                if !self.coordinator.is_available() {
                    self.toast_to(
                        conn_id,
                        ToastLevel::Warning,
                        "analysis engine is not configured on the server",
                    );
                    return;
                }
                let node_id = payload
                    .node_id
                    .unwrap_or_else(|| self.game.current_node_id.clone());
                match self.position_command_for(&node_id) {
                    Ok(command) => {
                        let multipv = self.game.analysis_multipv();
                        let _ = self.coordinator.start(&node_id, &command, multipv).await;
                    }
                    Err(message) => self.toast_to(conn_id, ToastLevel::Error, message),
                }
            }

            "analysis:stop" => {
                self.coordinator.stop(REASON_STOPPED_BY_USER).await;
            }

            other => {
                self.toast_to(
                    conn_id,
                    ToastLevel::Warning,
                    format!("unknown message type: {}", other),
                );
            }
        }
    }
}

/// Apply a `game:save` payload; string errors become owner toasts
fn apply_save_payload(game: &mut Game, payload: &GameSavePayload) -> Result<(), String> {
    if let Some(title) = &payload.title {
        let title = title.trim();
        if !title.is_empty() {
            game.title = title.to_string();
        }
    }
    if let Some(meta) = &payload.meta {
        game.meta = meta.clone();
    }
    if let Some(ui_state) = &payload.ui_state {
        game.ui_state = ui_state.clone();
    }
    if let Some(node_id) = &payload.current_node_id {
        game.jump(node_id).map_err(|e| e.to_string())?;
    }
    game.touch();
    Ok(())
}
