pub mod ws;

use crate::ai::{AiJobRequest, Engine};
use crate::config::ServerConfig;
use crate::metrics::metrics;
use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/ai/preflight", get(ai_preflight))
        .route("/rooms", post(create_room))
        .route("/rooms/{id}", get(get_room))
        .route("/rooms/{id}/prompt-preview", get(prompt_preview))
        .route("/rooms/{id}/ai-patch", post(ai_patch))
        .route("/rooms/{id}/personal-board", get(personal_board))
        .route("/rooms/{id}/personal-board/ai-patch", post(personal_ai_patch))
        .route("/rooms/{id}/transcribe", post(transcribe))
        .route(
            "/personalization/context",
            get(get_personal_context).post(append_personal_context),
        )
        .route("/ws", get(ws::ws_upgrade))
        .layer(cors)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(engine)
}

/// Bind the first free port in `[port, port + span)`.
pub async fn bind_with_scan(config: &ServerConfig) -> anyhow::Result<tokio::net::TcpListener> {
    let span = config.port_scan_span.max(1);
    for offset in 0..span {
        let port = config.port.saturating_add(offset);
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => {
                if offset > 0 {
                    tracing::warn!(port, "configured port busy, scanned forward");
                }
                return Ok(listener);
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(err) => return Err(err.into()),
        }
    }
    anyhow::bail!(
        "no free port in [{}, {})",
        config.port,
        config.port as u32 + span as u32
    )
}

pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let listener = bind_with_scan(&engine.config.server).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, instance = %engine.instance_id, "senseboard listening");
    axum::serve(listener, router(engine))
        .await
        .context("server error")
}

async fn health(State(engine): State<Arc<Engine>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "now": Utc::now(),
        "instanceStartedAt": engine.started_at,
        "instanceId": engine.instance_id,
    }))
}

async fn metrics_text() -> impl IntoResponse {
    metrics().render()
}

async fn ai_preflight(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    match engine.ai_preflight().await {
        Ok(provider) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true, "provider": provider })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ok": false, "error": err.joined })),
        ),
    }
}

async fn create_room(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let (room_id, handle) = engine.rooms.create().await;
    let room = handle.lock().await;
    Json(serde_json::json!({ "roomId": room_id, "room": &*room }))
}

async fn get_room(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let handle = engine.rooms.get_or_create(&id).await;
    let room = handle.lock().await;
    Json(serde_json::json!({ "room": &*room }))
}

async fn prompt_preview(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    Json(engine.prompt_preview(&id).await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiPatchBody {
    reason: Option<String>,
    regenerate: Option<bool>,
    window_seconds: Option<u64>,
    name: Option<String>,
}

impl AiPatchBody {
    fn request(&self) -> AiJobRequest {
        use crate::ai::input::AiReason;
        let reason = match self.reason.as_deref() {
            Some("tick") => AiReason::Tick,
            Some("regenerate") => AiReason::Regenerate,
            _ => AiReason::Manual,
        };
        AiJobRequest {
            reason,
            regenerate: self.regenerate.unwrap_or(false) || reason == AiReason::Regenerate,
            window_seconds: self
                .window_seconds
                .unwrap_or(crate::ai::DEFAULT_WINDOW_SECONDS),
            transcript_chunk_count: None,
        }
    }
}

async fn ai_patch(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<AiPatchBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let request = body.request();
    let regenerate = request.regenerate;
    let window_seconds = request.window_seconds;

    let receiver = engine.schedule_ai_patch(&id, request).await;
    let outcome = receiver
        .await
        .unwrap_or_else(|_| crate::ai::AiPatchOutcome::skipped("ai_error"));

    engine
        .schedule_deferred_personal(&id, regenerate, None, window_seconds)
        .await;

    Json(outcome)
}

async fn personal_board(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("name").filter(|n| !n.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "name query parameter is required" })),
        )
            .into_response();
    };
    let state = engine.personal_board(&id, name).await;
    Json(serde_json::json!({ "board": state.board, "updatedAt": state.updated_at }))
        .into_response()
}

async fn personal_ai_patch(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    body: Option<Json<AiPatchBody>>,
) -> impl IntoResponse {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let Some(name) = body.name.clone().filter(|n| !n.trim().is_empty()) else {
        return Json(serde_json::json!({ "applied": false, "reason": "missing_name" }));
    };
    // Queued, not awaited: clients poll the personal-board endpoint.
    let _ = engine
        .schedule_personal_patch(&id, &name, body.request())
        .await;
    Json(serde_json::json!({ "applied": false, "reason": "queued" }))
}

async fn transcribe(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut audio: Option<(Vec<u8>, String)> = None;
    let mut speaker = "Speaker".to_string();

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("audio") => {
                let mime = field
                    .content_type()
                    .unwrap_or("audio/webm")
                    .to_string();
                match field.bytes().await {
                    Ok(bytes) => audio = Some((bytes.to_vec(), mime)),
                    Err(_) => {
                        return (
                            StatusCode::BAD_REQUEST,
                            Json(serde_json::json!({ "error": "unreadable audio field" })),
                        )
                            .into_response()
                    }
                }
            }
            Some("speaker") => {
                if let Ok(value) = field.text().await {
                    let trimmed = value.trim().to_string();
                    if !trimmed.is_empty() {
                        speaker = trimmed;
                    }
                }
            }
            _ => {}
        }
    }

    let Some((bytes, mime)) = audio else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "audio field is required" })),
        )
            .into_response();
    };

    let outcome = engine.handle_transcribe(&id, &speaker, &bytes, &mime).await;
    let status = if outcome.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(outcome)).into_response()
}

async fn get_personal_context(
    State(engine): State<Arc<Engine>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(name) = params.get("name").filter(|n| !n.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "name query parameter is required" })),
        )
            .into_response();
    };
    match engine.personalization.get_profile(name).await {
        Ok(profile) => Json(serde_json::json!({ "profile": profile })).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AppendContextBody {
    name: String,
    text: String,
}

async fn append_personal_context(
    State(engine): State<Arc<Engine>>,
    Json(body): Json<AppendContextBody>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() || body.text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "name and text are required" })),
        )
            .into_response();
    }
    match engine
        .personalization
        .append_context(&body.name, &body.text)
        .await
    {
        Ok(profile) => Json(serde_json::json!({ "profile": profile })).into_response(),
        Err(err) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Agent;
    use crate::transcribe::TranscriptionRouter;

    fn engine() -> Arc<Engine> {
        Engine::for_tests(Agent::default(), TranscriptionRouter::new(vec![]))
    }

    #[tokio::test]
    async fn create_room_returns_uppercase_id_and_empty_members() {
        let engine = engine();
        let (room_id, handle) = engine.rooms.create().await;
        assert!(room_id.len() >= 6);
        assert_eq!(room_id, room_id.to_uppercase());
        let room = handle.lock().await;
        assert_eq!(room.id, room_id);
        assert!(room.members.is_empty());
    }

    #[tokio::test]
    async fn ai_patch_body_maps_reasons() {
        let body = AiPatchBody {
            reason: Some("regenerate".into()),
            regenerate: None,
            window_seconds: Some(120),
            name: None,
        };
        let request = body.request();
        assert!(request.regenerate);
        assert_eq!(request.window_seconds, 120);

        let body = AiPatchBody::default();
        let request = body.request();
        assert_eq!(request.reason, crate::ai::input::AiReason::Manual);
        assert!(!request.regenerate);
    }

    #[tokio::test]
    async fn bind_with_scan_skips_busy_ports() {
        // Occupy a port, then ask the scanner to start there.
        let taken = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ServerConfig {
            port,
            port_scan_span: 4,
        };
        let listener = bind_with_scan(&config).await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn router_builds() {
        let _ = router(engine());
    }
}
