//! WebSocket connection handler
//!
//! One task per connection: it forwards parsed frames to the synchronizer
//! as intents and multiplexes two outbound sources — the broadcast channel
//! (state and analysis fan-out) and the connection's targeted queue
//! (grants, kicks, stale rejections, toasts). Slow observers that lag the
//! broadcast just skip; they never block the owner.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{Sink, SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::AppState;
use crate::sync::{Intent, OutboundFrame};
use crate::wire::{ClientEnvelope, ServerMessage, ToastLevel};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection_loop(socket, state))
}

async fn send_message(
    sink: &mut (impl Sink<Message, Error = axum::Error> + Unpin),
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(message).map_err(axum::Error::new)?;
    sink.send(Message::Text(payload.into())).await
}

async fn connection_loop(socket: WebSocket, state: AppState) {
    let conn_id = state.sync.new_conn_id();
    debug!(target: "kifulab::ws", "connection {} opened", conn_id);

    let (out_tx, mut out_rx) = tokio::sync::mpsc::unbounded_channel::<OutboundFrame>();
    let mut broadcast_rx = state.sync.subscribe();
    state.sync.send(Intent::Connected {
        conn_id,
        sender: out_tx,
    });

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEnvelope>(&text) {
                            Ok(envelope) => {
                                state.sync.send(Intent::Frame { conn_id, envelope });
                            }
                            Err(err) => {
                                let toast = ServerMessage::toast(
                                    ToastLevel::Error,
                                    format!("invalid JSON frame: {}", err),
                                );
                                if send_message(&mut sink, &toast).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        debug!(target: "kifulab::ws", "connection {} read error: {}", conn_id, err);
                        break;
                    }
                    _ => {}
                }
            }

            targeted = out_rx.recv() => {
                match targeted {
                    Some(OutboundFrame::Message(message)) => {
                        if send_message(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    None => break,
                }
            }

            event = broadcast_rx.recv() => {
                match event {
                    Ok(message) => {
                        if send_message(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "kifulab::ws",
                            "connection {} lagged, skipped {} events", conn_id, skipped
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    state.sync.send(Intent::Disconnected { conn_id });
    debug!(target: "kifulab::ws", "connection {} closed", conn_id);
}
