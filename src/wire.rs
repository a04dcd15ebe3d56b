//! Wire protocol: JSON frames exchanged over the WebSocket channel
//!
//! Every frame is `{"type": "...", "payload": {...}}`; owner-authored
//! client frames additionally carry `session_id` and `owner_token` at the
//! top level.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use kifulab_core::tree::{GameWire, JsonMap};

use crate::supervisor::{EngineStatusWire, PvLine};

/// Incoming frame envelope; the payload stays raw until the router knows
/// the type.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub owner_token: Option<String>,
}

// ---- client payloads ------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameNewPayload {
    pub title: Option<String>,
    pub initial_sfen: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameLoadPayload {
    pub game_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GameSavePayload {
    pub title: Option<String>,
    pub meta: Option<JsonMap>,
    pub ui_state: Option<JsonMap>,
    pub current_node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlayMovePayload {
    pub from_node_id: String,
    pub move_usi: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JumpPayload {
    pub node_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReorderPayload {
    pub parent_id: String,
    pub ordered_child_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentPayload {
    pub node_id: String,
    #[serde(default)]
    pub comment: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetEnabledPayload {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetMultipvPayload {
    pub multipv: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisStartPayload {
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportTextPayload {
    pub text: String,
    pub title: Option<String>,
}

// ---- server frames --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerCapabilities {
    pub analysis: bool,
    pub analysis_controls: Vec<&'static str>,
    pub import_formats: Vec<&'static str>,
    pub export_formats: Vec<&'static str>,
    pub notes: Vec<String>,
}

impl ServerCapabilities {
    pub fn for_engine(analysis_available: bool) -> Self {
        let mut notes = Vec::new();
        let analysis_controls = if analysis_available {
            vec!["enable", "multipv", "start", "stop"]
        } else {
            notes.push(
                "USI engine analysis is disabled until an engine command is configured".to_string(),
            );
            Vec::new()
        };
        Self {
            analysis: analysis_available,
            analysis_controls,
            import_formats: vec!["usi", "kif", "kif2"],
            export_formats: vec!["usi", "kif", "kif2"],
            notes,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisState {
    pub enabled: bool,
    pub multipv: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct GrantedPayload {
    pub game: GameWire,
    pub server_capabilities: ServerCapabilities,
    pub engine_status: EngineStatusWire,
    pub analysis_state: AnalysisState,
    pub session_id: String,
    pub owner_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisUpdate {
    pub node_id: String,
    pub elapsed_ms: u64,
    pub multipv: u8,
    pub lines: Vec<PvLine>,
    pub bestline: Option<PvLine>,
}

/// Outgoing frame; serializes to the `{"type", "payload"}` envelope
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "session:granted")]
    SessionGranted(Box<GrantedPayload>),
    #[serde(rename = "session:busy")]
    SessionBusy {
        owner_since: Option<String>,
        owner_hint: String,
    },
    #[serde(rename = "session:kicked")]
    SessionKicked { reason: String },
    #[serde(rename = "session:stale")]
    SessionStale { reason: String },
    #[serde(rename = "game:state")]
    GameState { game: Box<GameWire> },
    #[serde(rename = "analysis:update")]
    AnalysisUpdate(AnalysisUpdate),
    #[serde(rename = "analysis:stopped")]
    AnalysisStopped { reason: String },
    #[serde(rename = "toast")]
    Toast { level: ToastLevel, message: String },
}

impl ServerMessage {
    pub fn toast(level: ToastLevel, message: impl Into<String>) -> Self {
        ServerMessage::Toast {
            level,
            message: message.into(),
        }
    }

    pub fn stopped(reason: impl Into<String>) -> Self {
        ServerMessage::AnalysisStopped {
            reason: reason.into(),
        }
    }
}
