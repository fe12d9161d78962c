// =============================================================================
// Client WebSocket — /ws tick feed
// =============================================================================
//
// Clients connect to `/ws?token=<bearer>`; an invalid or expired token
// closes the socket with code 1008 right after the upgrade. Each connection
// gets a distributor client whose bounded queue this writer drains. Slow
// consumers are killed by the distributor and closed here with 1009; server
// shutdown closes with 4000.
//
// Heartbeats: a protocol Ping every `ping_interval`; a client that neither
// pongs nor sends anything within the deadline is dropped.
// =============================================================================

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::AppCtx;
use crate::distributor::{close_codes, handle_client_frame};

/// Frames drained per writer wakeup.
const DRAIN_BATCH: usize = 64;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<AppCtx>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    // Resolve the token before the upgrade; the socket still opens so the
    // 1008 close code reaches the client.
    let account = query
        .token
        .as_deref()
        .and_then(|token| ctx.sessions.validate(token).ok());
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, account))
}

async fn handle_socket(mut socket: WebSocket, ctx: Arc<AppCtx>, account: Option<String>) {
    let Some(account_id) = account else {
        warn!("ws connection rejected: invalid token");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_codes::AUTH_FAILURE,
                reason: Cow::from("invalid or expired token"),
            })))
            .await;
        return;
    };

    let client = ctx.distributor.register(&account_id);
    let client_id = client.id;
    info!(client = client_id, account = %account_id, "ws client joined");

    let cfg = ctx.distributor.config().clone();
    let slow_grace_ms = cfg.slow_grace_ms;
    let mut ping = tokio::time::interval(Duration::from_secs(cfg.ping_interval_secs));
    ping.tick().await; // the immediate first tick is a no-op
    let pong_deadline = Duration::from_secs(cfg.ping_interval_secs + cfg.pong_deadline_secs);
    let mut last_heard = Instant::now();

    let close = loop {
        tokio::select! {
            _ = client.wake.notified() => {
                if client.is_killed() {
                    break if ctx.supervisor.is_shutting_down() {
                        (close_codes::SERVER_SHUTDOWN, "server shutdown")
                    } else {
                        (close_codes::SLOW_CONSUMER, "slow consumer")
                    };
                }
                let frames = client.drain(DRAIN_BATCH);
                let mut failed = false;
                for frame in frames {
                    if socket.send(Message::Text(frame.to_json())).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break (close_codes::NORMAL, "send failed");
                }
                // More frames may remain past the batch.
                if client.queued() > 0 {
                    client.wake.notify_one();
                }
            }
            _ = ping.tick() => {
                if last_heard.elapsed() > pong_deadline {
                    warn!(client = client_id, "ws heartbeat timeout");
                    break (close_codes::NORMAL, "heartbeat timeout");
                }
                if socket.send(Message::Ping(Vec::new())).await.is_err() {
                    break (close_codes::NORMAL, "ping failed");
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_heard = Instant::now();
                        handle_client_frame(&client, &text, slow_grace_ms);
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_heard = Instant::now();
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break (close_codes::NORMAL, "pong failed");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client = client_id, "ws client left");
                        break (close_codes::NORMAL, "client close");
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_heard = Instant::now();
                    }
                    Some(Err(e)) => {
                        debug!(client = client_id, error = %e, "ws receive error");
                        break (close_codes::NORMAL, "receive error");
                    }
                }
            }
        }
    };

    let (code, reason) = close;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: Cow::from(reason),
        })))
        .await;
    ctx.distributor.unregister(client_id);
    info!(client = client_id, code, reason, "ws client disconnected");
}
