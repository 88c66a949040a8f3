// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Signaling over `/ws`: offers, trickled candidates and detection results for the
//! clients a socket negotiated or subscribed to.

use axum::extract::ws::{Message, WebSocket};
use opentelemetry::{global, KeyValue};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use detkit_api::{ClientMessage, ServerMessage};

use crate::gateway::{GatewayError, GatewayEvent};
use crate::state::AppState;

static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
const DEFAULT_MAX_WS_MESSAGE_BYTES: usize = 1024 * 1024; // 1 MiB

fn max_ws_message_bytes() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        std::env::var("DK_WEBSOCKET_MAX_MESSAGE_BYTES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_MAX_WS_MESSAGE_BYTES)
    })
}

/// Returns `Err(())` when the connection should be closed.
///
/// The `Sync` bound on `T` is required because the reference crosses an `.await`.
async fn send_json_message<T: Serialize + Sync>(
    socket: &mut WebSocket,
    message: &T,
    message_type: &str,
) -> Result<(), ()> {
    match serde_json::to_string(message) {
        Ok(json) => {
            if socket.send(Message::Text(json.into())).await.is_err() {
                warn!("Failed to send WebSocket {}", message_type);
                Err(())
            } else {
                Ok(())
            }
        },
        Err(e) => {
            error!(error = %e, "Failed to serialize {}", message_type);
            Err(())
        },
    }
}

#[derive(Clone)]
struct WebSocketMetrics {
    connections_gauge: opentelemetry::metrics::Gauge<u64>,
    messages_counter: opentelemetry::metrics::Counter<u64>,
    errors_counter: opentelemetry::metrics::Counter<u64>,
}

impl WebSocketMetrics {
    fn shared() -> Self {
        static METRICS: OnceLock<WebSocketMetrics> = OnceLock::new();
        METRICS
            .get_or_init(|| {
                let meter = global::meter("dkit_websocket");
                Self {
                    connections_gauge: meter
                        .u64_gauge("websocket.connections.active")
                        .with_description("Number of active WebSocket connections")
                        .build(),
                    messages_counter: meter
                        .u64_counter("websocket.messages")
                        .with_description("Total WebSocket messages")
                        .build(),
                    errors_counter: meter
                        .u64_counter("websocket.errors")
                        .with_description("WebSocket errors")
                        .build(),
                }
            })
            .clone()
    }
}

/// What one socket is responsible for.
struct Connection {
    socket_id: String,
    /// Clients this socket negotiated; removed from the gateway when it closes.
    owned: HashSet<String>,
    /// Clients whose events are relayed to this socket.
    watched: HashSet<String>,
}

impl Connection {
    fn resolve(&self, client_id: Option<String>) -> String {
        client_id.unwrap_or_else(|| self.socket_id.clone())
    }

    fn wants(&self, event: &GatewayEvent) -> bool {
        self.watched.contains(event.client_id())
    }
}

fn error_reply(client_id: Option<String>, message: impl Into<String>) -> ServerMessage {
    ServerMessage::Error { client_id, message: message.into() }
}

async fn dispatch(
    message: ClientMessage,
    conn: &mut Connection,
    app_state: &AppState,
) -> Option<ServerMessage> {
    match message {
        ClientMessage::Offer { offer, client_id } => {
            let client_id = conn.resolve(client_id);
            // Watch first: local candidates can be gathered before the answer is ready.
            conn.watched.insert(client_id.clone());
            match app_state.gateway.handle_offer(&client_id, &offer).await {
                Ok(answer) => {
                    conn.owned.insert(client_id.clone());
                    Some(ServerMessage::Answer { client_id, answer })
                },
                Err(e) => {
                    warn!(%client_id, error = %e, "Offer over WebSocket failed");
                    Some(error_reply(Some(client_id), e.to_string()))
                },
            }
        },
        ClientMessage::IceCandidate { candidate, client_id } => {
            let client_id = conn.resolve(client_id);
            match app_state.gateway.handle_candidate(&client_id, candidate).await {
                Ok(outcome) => {
                    debug!(%client_id, ?outcome, "Candidate handled");
                    None
                },
                Err(GatewayError::UnknownClient(_)) => None,
                Err(e) => Some(error_reply(Some(client_id), e.to_string())),
            }
        },
        ClientMessage::GetMetrics => {
            Some(ServerMessage::Metrics { metrics: app_state.metrics.snapshot() })
        },
        ClientMessage::StartStream { client_id } => {
            let client_id = conn.resolve(client_id);
            conn.watched.insert(client_id.clone());
            Some(ServerMessage::StreamStarted { client_id })
        },
    }
}

/// Returns false if the connection should break.
async fn handle_client_message(
    socket: &mut WebSocket,
    text: &str,
    conn: &mut Connection,
    app_state: &AppState,
    metrics: &WebSocketMetrics,
) -> bool {
    metrics.messages_counter.add(1, &[KeyValue::new("direction", "inbound")]);

    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, message_len = text.len(), "Failed to parse WebSocket message");
            metrics.errors_counter.add(1, &[KeyValue::new("error_type", "parse_error")]);
            let reply = error_reply(None, format!("Invalid message: {e}"));
            return send_json_message(socket, &reply, "error response").await.is_ok();
        },
    };

    if let Some(reply) = dispatch(message, conn, app_state).await {
        metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
        if send_json_message(socket, &reply, "reply").await.is_err() {
            metrics.errors_counter.add(1, &[KeyValue::new("error_type", "send_error")]);
            return false;
        }
    }

    true
}

fn relay(event: GatewayEvent, conn: &mut Connection) -> Option<ServerMessage> {
    match event {
        GatewayEvent::LocalCandidate { client_id, candidate } => {
            Some(ServerMessage::IceCandidate { client_id, candidate })
        },
        GatewayEvent::Detection { client_id, result } => {
            Some(ServerMessage::DetectionResult { client_id, result })
        },
        GatewayEvent::Closed { client_id } => {
            conn.owned.remove(&client_id);
            None
        },
    }
}

#[allow(clippy::cognitive_complexity)]
pub async fn handle_websocket(mut socket: WebSocket, app_state: Arc<AppState>) {
    let socket_id = uuid::Uuid::new_v4().to_string();
    info!(%socket_id, "WebSocket connection established");

    let metrics = WebSocketMetrics::shared();
    let active = ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    metrics.connections_gauge.record(active, &[]);

    // Subscribe before greeting so nothing published after the welcome is missed.
    let mut event_rx = app_state.gateway.subscribe();
    let mut conn = Connection { socket_id, owned: HashSet::new(), watched: HashSet::new() };

    let welcome = ServerMessage::Welcome { client_id: conn.socket_id.clone(), mode: app_state.mode };
    let mut open = send_json_message(&mut socket, &welcome, "welcome").await.is_ok();

    while open {
        tokio::select! {
            Some(msg) = socket.recv() => {
                match msg {
                    Ok(Message::Text(text)) => {
                        let max_len = max_ws_message_bytes();
                        if text.len() > max_len {
                            warn!(message_len = text.len(), max_len, "Rejected WebSocket message: too large");
                            metrics
                                .errors_counter
                                .add(1, &[KeyValue::new("error_type", "message_too_large")]);
                            let reply = error_reply(
                                None,
                                format!("WebSocket message too large (max {max_len} bytes)"),
                            );
                            let _ = send_json_message(&mut socket, &reply, "error response").await;
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }

                        open = handle_client_message(&mut socket, &text, &mut conn, &app_state, &metrics).await;
                    }
                    Ok(Message::Binary(data)) => {
                        // Media never travels over this socket.
                        debug!(len = data.len(), "Ignoring binary WebSocket message");
                    }
                    Ok(Message::Close(_)) => {
                        info!(socket_id = %conn.socket_id, "WebSocket connection closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "WebSocket error");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "connection_error")]);
                        break;
                    }
                    _ => {}
                }
            },

            event_result = event_rx.recv() => {
                let event = match event_result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket event receiver lagged; dropping events to catch up");
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "recv_lagged")]);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Gateway event channel closed; terminating connection");
                        break;
                    }
                };

                if !conn.wants(&event) {
                    continue;
                }
                if let Some(message) = relay(event, &mut conn) {
                    metrics.messages_counter.add(1, &[KeyValue::new("direction", "outbound")]);
                    if send_json_message(&mut socket, &message, "event").await.is_err() {
                        metrics.errors_counter.add(1, &[KeyValue::new("error_type", "send_error")]);
                        break;
                    }
                }
            }
            else => break,
        }
    }

    for client_id in conn.owned.drain() {
        app_state.gateway.remove_client(&client_id).await;
    }

    let prev = ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
    metrics.connections_gauge.record(prev.saturating_sub(1), &[]);
    info!(socket_id = %conn.socket_id, "WebSocket connection terminated");
}
