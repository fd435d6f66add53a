//! WebSocket upgrade handler and per-connection event loop.
//!
//! Per-connection state machine: Connecting (awaiting `auth` within the
//! grace period) -> Active (inbound loop) -> Closed (cascade cleanup).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::AppState;

use super::events::{InboundEvent, OutboundEvent};
use super::router::SessionInfo;

/// Close codes (4000-range for application-level).
const CLOSE_PROTOCOL_ERROR: u16 = 4000;
const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
const CLOSE_AUTH_FAILED: u16 = 4004;
const CLOSE_TIMEOUT: u16 = 4009;

pub fn router() -> Router<AppState> {
    Router::new().route("/gateway", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let auth_timeout = Duration::from_secs(state.router.config().auth_timeout_secs);

    // Connecting: the first event must be `auth`, within the grace period.
    let token = match time::timeout(auth_timeout, read_credential(&mut ws_rx)).await {
        Ok(Ok(token)) => token,
        Ok(Err(reason)) => {
            tracing::debug!(%reason, "handshake failed");
            let _ = send_close(&mut ws_tx, CLOSE_NOT_AUTHENTICATED, reason).await;
            return;
        }
        Err(_elapsed) => {
            let _ = send_close(&mut ws_tx, CLOSE_TIMEOUT, "Authentication timeout").await;
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let session = match state.router.connect(&token, out_tx).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(%e, "connect rejected");
            let _ = send_close(&mut ws_tx, CLOSE_AUTH_FAILED, &e.to_string()).await;
            return;
        }
    };

    let ready = OutboundEvent::Ready {
        connection_id: session.connection_id.clone(),
        user_id: session.user_id.clone(),
        rooms: session.rooms.clone(),
        heartbeat_interval_ms: state.router.config().heartbeat_interval_ms,
    };
    let ready_json = serde_json::to_string(&ready).unwrap();
    if ws_tx.send(Message::Text(ready_json.into())).await.is_err() {
        state.router.disconnect(&session.connection_id).await;
        return;
    }

    run_session(&state, &session, ws_tx, ws_rx, out_rx).await;

    // Closed: rooms first, then registry, then presence — the router owns
    // the ordering.
    state.router.disconnect(&session.connection_id).await;

    tracing::info!(
        connection_id = %session.connection_id,
        user_id = %session.user_id,
        "session ended"
    );
}

/// Read frames until the client presents a credential. Anything else in the
/// Connecting state is a protocol violation.
async fn read_credential(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<String, &'static str> {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(_) => return Err("read error"),
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err("client closed"),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => continue,
        };
        return match serde_json::from_str::<InboundEvent>(&text) {
            Ok(InboundEvent::Auth { token }) => Ok(token),
            Ok(_) => Err("expected auth"),
            Err(_) => Err("invalid JSON"),
        };
    }
    Err("connection closed before auth")
}

/// Active state: inbound frames, outbound queue, heartbeat enforcement.
async fn run_session(
    state: &AppState,
    session: &SessionInfo,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut out_rx: mpsc::UnboundedReceiver<Arc<OutboundEvent>>,
) {
    // Client must heartbeat within 1.5x the advertised interval.
    let heartbeat_deadline =
        Duration::from_millis(state.router.config().heartbeat_interval_ms * 3 / 2);
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a frame. Processed inline, so one connection's
            // events keep their order.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event: InboundEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "Malformed event").await;
                                break;
                            }
                        };
                        if matches!(event, InboundEvent::Heartbeat) {
                            got_heartbeat = true;
                        }
                        let name = event.name();
                        match state
                            .router
                            .handle_event(&session.connection_id, &session.user_id, event)
                            .await
                        {
                            Ok(()) => {}
                            Err(e) if e.is_fatal() => {
                                tracing::debug!(%e, connection_id = %session.connection_id, "fatal inbound error");
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, &e.to_string()).await;
                                break;
                            }
                            Err(e) => {
                                // Reported to the origin connection only; the
                                // session keeps running.
                                let error = OutboundEvent::Error {
                                    event: name.to_string(),
                                    message: e.to_string(),
                                };
                                let json = serde_json::to_string(&error).unwrap();
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, connection_id = %session.connection_id, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // An event routed to this connection.
            delivery = out_rx.recv() => {
                match delivery {
                    Some(event) => {
                        let json = serde_json::to_string(event.as_ref()).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Registry entry gone: the connection was torn down
                    // elsewhere. Stop delivering immediately.
                    None => break,
                }
            }

            // Heartbeat timeout check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(
                        connection_id = %session.connection_id,
                        "heartbeat timeout, closing connection"
                    );
                    let _ = send_close(&mut ws_tx, CLOSE_TIMEOUT, "Heartbeat timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
