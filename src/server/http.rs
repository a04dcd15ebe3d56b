//! REST handlers

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use kifulab_core::codec::{EmitOptions, Format};

use super::AppState;
use crate::wire::GameSavePayload;

const MAX_LIST_LIMIT: u32 = 100;

/// API error with the `{detail}` body shape
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            detail: detail.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        error!(target: "kifulab::http", "internal error: {:#}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

pub async fn healthz(State(state): State<AppState>) -> Json<Value> {
    let current_game_id = state.store.last_game_id().ok().flatten();
    Json(json!({
        "ok": true,
        "engine": state.supervisor.status_wire(),
        "current_game_id": current_game_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    limit: Option<u32>,
    offset: Option<u32>,
}

pub async fn list_games(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(50);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ApiError::bad_request(format!(
            "limit must be between 1 and {}",
            MAX_LIST_LIMIT
        )));
    }
    let offset = params.offset.unwrap_or(0);
    let (items, total) = state
        .store
        .list_games(limit, offset)
        .map_err(ApiError::internal)?;
    Ok(Json(json!({
        "items": items,
        "total": total,
        "limit": limit,
        "offset": offset,
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateGameBody {
    title: Option<String>,
    initial_sfen: Option<String>,
}

pub async fn create_game(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    // An empty or non-JSON body means "all defaults".
    let body: CreateGameBody = serde_json::from_slice(&body).unwrap_or_default();
    let game = state
        .sync
        .create_game(body.title, body.initial_sfen)
        .await
        .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?;
    Ok(Json(json!({ "game": game })))
}

pub async fn get_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let game = state
        .store
        .get_game_with_tree(&game_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("game not found"))?;
    Ok(Json(json!({ "game": game.to_wire() })))
}

pub async fn update_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(payload): Json<GameSavePayload>,
) -> Result<Json<Value>, ApiError> {
    let updated = state
        .sync
        .update_game(game_id, payload)
        .await
        .map_err(|e| ApiError::bad_request(format!("{:#}", e)))?
        .ok_or_else(|| ApiError::not_found("game not found"))?;
    Ok(Json(json!({ "game": updated })))
}

pub async fn delete_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state
        .store
        .delete_game(&game_id)
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(ApiError::not_found("game not found"));
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
struct ImportBody {
    text: String,
    title: Option<String>,
}

/// Accepts `{"text": "...", "title": "..."}` or a raw text body
pub async fn import_game(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (text, title) = if content_type.contains("application/json") {
        let parsed: ImportBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid JSON body: {}", e)))?;
        (parsed.text, parsed.title)
    } else {
        (String::from_utf8_lossy(&body).into_owned(), None)
    };
    if text.trim().is_empty() {
        return Err(ApiError::bad_request("text is required"));
    }

    let imported = state
        .sync
        .import_text(text, title)
        .await
        .map_err(ApiError::internal)?;
    match imported {
        Ok((format, game)) => Ok(Json(json!({
            "format": format,
            "game_id": game.game_id,
            "game": game,
        }))),
        Err(err) => Err(ApiError::bad_request(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    format: Option<String>,
}

pub async fn export_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(params): Query<ExportParams>,
) -> Result<Response, ApiError> {
    let format: Format = params
        .format
        .as_deref()
        .unwrap_or("usi")
        .parse()
        .map_err(|_| ApiError::bad_request("format must be usi|kif|kif2"))?;

    let game = state
        .store
        .get_game_with_tree(&game_id)
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("game not found"))?;

    let text = state
        .codecs
        .emit(format, &game, &EmitOptions::default())
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let filename = format!("{}.{}", game_id, format.extension());
    let response = (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        text,
    )
        .into_response();
    Ok(response)
}
