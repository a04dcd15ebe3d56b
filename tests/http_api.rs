//! REST surface tests, driven through the router without a listener.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::spawn_harness;
use kifulab::server::{self, AppState};
use kifulab::supervisor::UsiSupervisor;
use kifulab_config::EngineSettings;
use kifulab_core::codec::CodecRegistry;

fn test_app() -> (Router, common::Harness) {
    let harness = spawn_harness(EngineSettings::default());
    let state = AppState {
        sync: harness.sync.clone(),
        store: Arc::clone(&harness.store),
        codecs: Arc::new(CodecRegistry::standard()),
        supervisor: Arc::new(UsiSupervisor::new(EngineSettings::default())),
    };
    (server::router(state), harness)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn healthz_reports_engine_state() {
    let (app, _harness) = test_app();
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["engine"]["enabled"], false);
    assert_eq!(body["engine"]["status"], "not_configured");
}

#[tokio::test]
async fn games_crud_round_trip() {
    let (app, harness) = test_app();

    // Create
    let response = app
        .clone()
        .oneshot(
            Request::post("/api/games")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"title": "rest game"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response).await;
    let game_id = created["game"]["game_id"].as_str().unwrap().to_string();
    assert_eq!(created["game"]["title"], "rest game");

    // Read
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/games/{}", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let fetched = body_json(response).await;
    assert_eq!(fetched["game"]["game_id"], game_id.as_str());

    // Update title
    let response = app
        .clone()
        .oneshot(
            Request::put(format!("/api/games/{}", game_id))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"title": "renamed"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let updated = body_json(response).await;
    assert_eq!(updated["game"]["title"], "renamed");

    // List includes both the harness game and the new one
    let response = app
        .clone()
        .oneshot(Request::get("/api/games?limit=10").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let listed = body_json(response).await;
    assert_eq!(listed["total"], 2);

    // Delete
    let response = app
        .clone()
        .oneshot(
            Request::delete(format!("/api/games/{}", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .oneshot(
            Request::get(format!("/api/games/{}", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    drop(harness);
}

#[tokio::test]
async fn list_games_rejects_oversized_limits() {
    let (app, _harness) = test_app();
    let response = app
        .clone()
        .oneshot(Request::get("/api/games?limit=101").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["detail"].as_str().unwrap().contains("limit"));

    let response = app
        .oneshot(Request::get("/api/games?limit=abc").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_game_is_404() {
    let (app, _harness) = test_app();
    for request in [
        Request::get("/api/games/nope").body(Body::empty()).unwrap(),
        Request::delete("/api/games/nope").body(Body::empty()).unwrap(),
        Request::get("/api/export/nope").body(Body::empty()).unwrap(),
    ] {
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

#[tokio::test]
async fn import_autodetects_and_export_round_trips() {
    let (app, _harness) = test_app();

    let response = app
        .clone()
        .oneshot(
            Request::post("/api/import")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"text": "position startpos moves 7g7f 3c3d", "title": "imported"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let imported = body_json(response).await;
    assert_eq!(imported["format"], "usi");
    let game_id = imported["game_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/export/{}?format=usi", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = body_text(response).await;
    assert_eq!(text, "position startpos moves 7g7f 3c3d");

    // KIF export of the same game carries the move table marker.
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/export/{}?format=kif", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let text = body_text(response).await;
    assert!(text.contains("手数----指手"));

    // Unknown format tag
    let response = app
        .oneshot(
            Request::get(format!("/api/export/{}?format=sgf", game_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn import_rejects_undetectable_text() {
    let (app, _harness) = test_app();
    let response = app
        .oneshot(
            Request::post("/api/import")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json!({"text": "not a kifu at all"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["detail"].as_str().unwrap().contains("detect"));
}

#[tokio::test]
async fn import_accepts_raw_text_bodies() {
    let (app, _harness) = test_app();
    let response = app
        .oneshot(
            Request::post("/api/import")
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Body::from("position startpos moves 2g2f"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["format"], "usi");
}
