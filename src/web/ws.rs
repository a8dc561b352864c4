//! WebSocket protocol: `client:ack` handshake, client message dispatch into
//! the room engine, snapshot fan-out.

use crate::ai::Engine;
use crate::error::ClientMessageError;
use crate::metrics::metrics;
use crate::room::registry::SocketHandle;
use crate::room::{apply_client_message, ClientMessage, Member};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub const WS_PROTOCOL: &str = "senseboard-ws-v1";

fn error_frame(message: &str) -> String {
    serde_json::json!({ "type": "room:error", "message": message }).to_string()
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let room_id = params.get("roomId").map(String::as_str).unwrap_or("");
    let name = params.get("name").map(String::as_str).unwrap_or("");
    if room_id.trim().is_empty() || name.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(serde_json::json!({ "error": "roomId and name are required" })),
        )
            .into_response();
    }
    let room_id = room_id.trim().to_uppercase();
    let name = name.trim().to_string();
    ws.on_upgrade(move |socket| handle_ws(engine, socket, room_id, name))
}

async fn handle_ws(engine: Arc<Engine>, socket: WebSocket, room_id: String, name: String) {
    let (mut sink, mut stream) = socket.split();

    let handle = engine.rooms.get_or_create(&room_id).await;
    let member: Member = {
        let mut room = handle.lock().await;
        room.join(&name, Utc::now())
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let socket_id = uuid::Uuid::new_v4().to_string();
    engine
        .rooms
        .attach_socket(
            &room_id,
            SocketHandle {
                id: socket_id.clone(),
                member_id: member.id.clone(),
                tx: tx.clone(),
            },
        )
        .await;
    engine.rooms.broadcast_snapshot(&room_id).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let mut acked = false;
    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let parsed: Result<ClientMessage, _> = serde_json::from_str(&text);
        let msg = match parsed {
            Ok(msg) => msg,
            Err(_) => {
                let _ = tx.send(error_frame(&ClientMessageError::InvalidPayload.to_string()));
                continue;
            }
        };

        if let ClientMessage::Ack { protocol, .. } = &msg {
            acked = true;
            if protocol != WS_PROTOCOL {
                tracing::debug!(protocol, "client acked with unexpected protocol");
            }
            let _ = tx.send(
                serde_json::json!({
                    "type": "server:ack",
                    "protocol": WS_PROTOCOL,
                    "roomId": room_id,
                    "memberId": member.id,
                    "receivedAt": Utc::now(),
                })
                .to_string(),
            );
            continue;
        }

        if !acked {
            let _ = tx.send(error_frame(
                &ClientMessageError::HandshakeRequired.to_string(),
            ));
            continue;
        }

        let applied = {
            let mut room = handle.lock().await;
            let applied = apply_client_message(&mut room, &member, &msg, Utc::now());
            // Any accepted input wakes an idle room.
            if applied.is_ok()
                && !room.ai_config.frozen
                && room.ai_config.status == crate::room::AiStatus::Idle
            {
                room.ai_config.status = crate::room::AiStatus::Listening;
            }
            applied
        };
        match applied {
            Ok(applied) => {
                metrics()
                    .ws_messages_total
                    .with_label_values(&[applied.kind])
                    .inc();
                if applied.broadcast {
                    engine.rooms.broadcast_snapshot(&room_id).await;
                }
                engine.record_activity(&room_id).await;
                if applied.schedule_tick {
                    let chunk_count = { handle.lock().await.transcript_chunks.len() };
                    engine.schedule_tick(&room_id, chunk_count).await;
                    engine
                        .schedule_deferred_personal(
                            &room_id,
                            false,
                            Some(chunk_count),
                            crate::ai::DEFAULT_WINDOW_SECONDS,
                        )
                        .await;
                }
            }
            Err(err) => {
                let _ = tx.send(error_frame(&err.to_string()));
            }
        }
    }

    engine.rooms.detach_socket(&room_id, &socket_id).await;
    {
        let mut room = handle.lock().await;
        room.leave(&member.id);
    }
    engine.rooms.broadcast_snapshot(&room_id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_frame_shape() {
        let frame = error_frame("Invalid websocket message payload.");
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "room:error");
        assert!(value["message"]
            .as_str()
            .unwrap()
            .contains("Invalid websocket message"));
    }

    #[test]
    fn handshake_error_message_is_explicit() {
        let frame = error_frame("Handshake required: send client:ack before other messages.");
        assert!(frame.contains("Handshake required"));
    }
}
