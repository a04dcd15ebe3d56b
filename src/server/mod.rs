//! HTTP surface: REST API plus the WebSocket channel

pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use kifulab_core::codec::CodecRegistry;

use crate::store::SqliteStore;
use crate::supervisor::UsiSupervisor;
use crate::sync::SyncHandle;

/// Import bodies are capped to bound parse cost
pub const IMPORT_BODY_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sync: SyncHandle,
    pub store: Arc<SqliteStore>,
    pub codecs: Arc<CodecRegistry>,
    pub supervisor: Arc<UsiSupervisor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(http::healthz))
        .route("/api/games", get(http::list_games).post(http::create_game))
        .route(
            "/api/games/{game_id}",
            get(http::get_game).put(http::update_game).delete(http::delete_game),
        )
        .route("/api/import", post(http::import_game))
        .route("/api/export/{game_id}", get(http::export_game))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(IMPORT_BODY_LIMIT))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
