//! `/api/ws` (§6): a single duplex stream carrying three event kinds —
//! periodic cost snapshots, routing previews requested by the client,
//! and capability-change notices — so a dashboard can stay current
//! without polling every `/api/*` endpoint.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AppState;
use crate::router::Intent;

pub async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    Cost { factors: atmosphere_core::CostFactors },
    CapabilityCount { online: usize },
    RoutePreview { cap_id: String, node_id: String, score: f64 },
    Error { message: String },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    RouteIntent { intent: String },
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut cost_rx = state.cost.subscribe();
    let mut tick = tokio::time::interval(Duration::from_secs(30));
    tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            biased;

            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_message(&state, &text) {
                            if socket.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(%err, "websocket read error");
                        break;
                    }
                }
            }

            Ok(factors) = cost_rx.recv() => {
                let event = ServerEvent::Cost { factors };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }

            _ = tick.tick() => {
                let event = ServerEvent::CapabilityCount { online: state.registry.len() };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn handle_client_message(state: &AppState, text: &str) -> Option<String> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            return Some(
                serde_json::to_string(&ServerEvent::Error { message: format!("malformed command: {err}") })
                    .unwrap_or_default(),
            )
        }
    };
    let ClientCommand::RouteIntent { intent } = command;
    let event = match state.route(&Intent::NaturalLanguage(intent)) {
        Ok(result) => ServerEvent::RoutePreview {
            cap_id: result.chosen_cap.cap_id,
            node_id: result.chosen_cap.node_id,
            score: result.score,
        },
        Err(err) => ServerEvent::Error { message: err.to_string() },
    };
    Some(serde_json::to_string(&event).unwrap_or_default())
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).unwrap_or_default();
    socket.send(Message::Text(text)).await
}
