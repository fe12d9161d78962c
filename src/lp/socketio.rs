// =============================================================================
// Socket.IO-style WebSocket adapter
// =============================================================================
//
// The provider speaks the Engine.IO v3 framing: an HTTP polling request
// yields a session id and ping interval, the transport is then upgraded to a
// WebSocket with probe frames, and quote events arrive as `42["<event>",{…}]`
// text frames. The adapter answers server pings ("2") with pongs ("3") at
// the advertised interval and reconnects forever with exponential backoff.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, SocketIoConfig};
use crate::errors::{CoreError, CoreResult};
use crate::lp::{
    reconnect_delay, AdapterShared, AdapterState, AdapterStatus, LpAdapter, LpExecution, LpOrder,
};
use crate::types::Quote;

/// Parameters the handshake advertises.
#[derive(Debug, Clone, Deserialize)]
struct Handshake {
    sid: String,
    #[serde(rename = "pingInterval", default = "default_ping_interval")]
    ping_interval_ms: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

/// Provider quote payload inside the `42["quote",{…}]` event.
#[derive(Debug, Deserialize)]
struct WireQuote {
    symbol: String,
    bid: f64,
    ask: f64,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    seq: Option<u64>,
    #[serde(default)]
    stale: bool,
}

enum Command {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    Close,
}

pub struct SocketIoAdapter {
    shared: Arc<AdapterShared>,
    cfg: SocketIoConfig,
    connect_timeout: Duration,
    http: reqwest::Client,
    cmd_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SocketIoAdapter {
    pub fn new(
        adapter_cfg: &AdapterConfig,
        cfg: SocketIoConfig,
        quote_tx: mpsc::Sender<Quote>,
    ) -> Self {
        let shared = Arc::new(AdapterShared::new(adapter_cfg.id.clone(), quote_tx));
        shared.add_subscription_intent(&adapter_cfg.symbols);
        Self {
            shared,
            cfg,
            connect_timeout: Duration::from_secs(adapter_cfg.connect_timeout_secs),
            http: reqwest::Client::new(),
            cmd_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Engine.IO polling handshake: returns the session id and ping interval.
    async fn handshake(&self) -> CoreResult<Handshake> {
        let mut url = format!(
            "{}/socket.io/?EIO=3&transport=polling",
            self.cfg.base_url.trim_end_matches('/')
        );
        if let Some(token) = &self.cfg.auth_token {
            url.push_str(&format!("&token={token}"));
        }

        let resp = tokio::time::timeout(self.connect_timeout, self.http.get(&url).send())
            .await
            .map_err(|_| CoreError::Timeout("socket.io polling handshake".into()))?
            .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CoreError::AuthRejected(format!(
                "handshake returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(CoreError::ConnectFailed(format!(
                "handshake returned {}",
                resp.status()
            )));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| CoreError::ReadError(e.to_string()))?;

        // Body is length-prefixed: `97:0{"sid":…}`. The JSON document starts
        // at the first brace.
        let json_start = body
            .find('{')
            .ok_or_else(|| CoreError::MalformedMessage(format!("handshake body: {body}")))?;
        let handshake: Handshake = serde_json::from_str(&body[json_start..])
            .map_err(|e| CoreError::MalformedMessage(format!("handshake json: {e}")))?;
        Ok(handshake)
    }

    fn ws_url(&self, sid: &str) -> String {
        let ws_base = self
            .cfg
            .base_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let mut url = format!("{ws_base}/socket.io/?EIO=3&transport=websocket&sid={sid}");
        if let Some(token) = &self.cfg.auth_token {
            url.push_str(&format!("&token={token}"));
        }
        url
    }

    /// One connection lifetime: upgrade, subscribe, stream until failure.
    async fn run_connection(
        shared: &Arc<AdapterShared>,
        cfg: &SocketIoConfig,
        ws_url: &str,
        ping_interval: Duration,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> CoreResult<()> {
        let (mut ws, _resp) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;
        shared.set_state(AdapterState::Connected);

        // Engine.IO upgrade: probe, expect ack, then commit.
        ws.send(Message::Text("2probe".into()))
            .await
            .map_err(|e| CoreError::WriteError(e.to_string()))?;
        match ws.next().await {
            Some(Ok(Message::Text(text))) if text == "3probe" => {}
            other => {
                return Err(CoreError::UnexpectedMessage(format!(
                    "expected 3probe, got {other:?}"
                )))
            }
        }
        ws.send(Message::Text("5".into()))
            .await
            .map_err(|e| CoreError::WriteError(e.to_string()))?;
        shared.set_state(AdapterState::LoggedIn);

        // Re-announce the standing subscription intent.
        let symbols = shared.subscribed.read().clone();
        if !symbols.is_empty() {
            let frame = format!(
                "42[\"subscribe\",{}]",
                serde_json::json!({ "symbols": symbols })
            );
            ws.send(Message::Text(frame))
                .await
                .map_err(|e| CoreError::WriteError(e.to_string()))?;
        }
        shared.set_state(AdapterState::Streaming);
        info!(adapter = %shared.id, symbols = symbols.len(), "socket.io adapter streaming");

        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            Self::handle_frame(shared, cfg, &text, &mut ws).await?;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws.send(Message::Pong(data))
                                .await
                                .map_err(|e| CoreError::WriteError(e.to_string()))?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(CoreError::ReadError("provider closed stream".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            return Err(CoreError::ReadError(e.to_string()));
                        }
                    }
                }
                _ = ping.tick() => {
                    ws.send(Message::Text("2".into()))
                        .await
                        .map_err(|e| CoreError::WriteError(e.to_string()))?;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Subscribe(symbols)) => {
                            let frame = format!(
                                "42[\"subscribe\",{}]",
                                serde_json::json!({ "symbols": symbols })
                            );
                            ws.send(Message::Text(frame))
                                .await
                                .map_err(|e| CoreError::WriteError(e.to_string()))?;
                        }
                        Some(Command::Unsubscribe(symbols)) => {
                            let frame = format!(
                                "42[\"unsubscribe\",{}]",
                                serde_json::json!({ "symbols": symbols })
                            );
                            ws.send(Message::Text(frame))
                                .await
                                .map_err(|e| CoreError::WriteError(e.to_string()))?;
                        }
                        Some(Command::Close) | None => {
                            let _ = ws.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame<S>(
        shared: &Arc<AdapterShared>,
        cfg: &SocketIoConfig,
        text: &str,
        ws: &mut S,
    ) -> CoreResult<()>
    where
        S: SinkExt<Message> + Unpin,
        <S as futures_util::Sink<Message>>::Error: std::fmt::Display,
    {
        // Engine.IO ping from the server side; answer immediately.
        if text == "2" {
            ws.send(Message::Text("3".into()))
                .await
                .map_err(|e| CoreError::WriteError(e.to_string()))?;
            return Ok(());
        }
        // "3" pong, "40" namespace ack, "41" namespace close.
        if !text.starts_with("42") {
            return Ok(());
        }

        let payload: serde_json::Value = match serde_json::from_str(&text[2..]) {
            Ok(v) => v,
            Err(e) => {
                debug!(adapter = %shared.id, error = %e, "unparseable event frame");
                return Ok(());
            }
        };
        let Some(event) = payload.get(0).and_then(|v| v.as_str()) else {
            return Ok(());
        };
        if event != cfg.quote_event {
            return Ok(());
        }
        let Some(body) = payload.get(1) else {
            return Ok(());
        };
        match serde_json::from_value::<WireQuote>(body.clone()) {
            Ok(wire) => {
                let (now_ms, now_ns) = crate::lp::now_ms_ns();
                let quote = Quote {
                    symbol: wire.symbol,
                    bid: wire.bid,
                    ask: wire.ask,
                    source: shared.id.clone(),
                    source_seq: wire.seq,
                    source_time_ms: wire.ts.unwrap_or(now_ms),
                    recv_time_ns: now_ns,
                    stale: wire.stale,
                };
                if quote.is_well_formed() {
                    shared.publish_quote(quote);
                }
            }
            Err(e) => {
                debug!(adapter = %shared.id, error = %e, "quote payload did not match schema");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LpAdapter for SocketIoAdapter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn protocol(&self) -> &'static str {
        "socketio"
    }

    async fn connect(&self) -> CoreResult<()> {
        if self.shared.state() == AdapterState::Streaming {
            return Ok(());
        }
        self.shared.set_state(AdapterState::Connecting);

        // First attempt inline so credential failures surface to the caller.
        let handshake = match self.handshake().await {
            Ok(h) => h,
            Err(e) => {
                self.shared.record_error(&e);
                self.shared.set_state(if e.is_retryable_transport() {
                    AdapterState::Disconnected
                } else {
                    AdapterState::Error
                });
                return Err(e);
            }
        };

        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
        *self.cmd_tx.lock() = Some(cmd_tx);

        let shared = self.shared.clone();
        let cfg = self.cfg.clone();
        let connect_timeout = self.connect_timeout;
        let http = self.http.clone();
        let first_url = self.ws_url(&handshake.sid);
        let first_interval = Duration::from_millis(handshake.ping_interval_ms);

        let task = tokio::spawn(async move {
            let mut attempt: u64 = 0;
            let mut url = first_url;
            let mut ping_interval = first_interval;
            loop {
                match Self::run_connection(&shared, &cfg, &url, ping_interval, &mut cmd_rx).await {
                    Ok(()) => {
                        shared.set_state(AdapterState::Disconnected);
                        return; // deliberate close
                    }
                    Err(e) => {
                        shared.record_error(&e);
                        if !e.is_retryable_transport() {
                            shared.set_state(AdapterState::Error);
                            return;
                        }
                        shared.set_state(AdapterState::Disconnected);
                        attempt += 1;
                        shared
                            .reconnect_attempts
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        let delay = reconnect_delay(attempt);
                        warn!(
                            adapter = %shared.id,
                            attempt,
                            delay_s = delay.as_secs_f64(),
                            error = %e,
                            "socket.io reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }

                // Fresh handshake for every reconnect: the old sid is dead.
                let mut hs_url = format!(
                    "{}/socket.io/?EIO=3&transport=polling",
                    cfg.base_url.trim_end_matches('/')
                );
                if let Some(token) = &cfg.auth_token {
                    hs_url.push_str(&format!("&token={token}"));
                }
                let handshake = tokio::time::timeout(connect_timeout, async {
                    let resp = http.get(&hs_url).send().await.ok()?;
                    let body = resp.text().await.ok()?;
                    let start = body.find('{')?;
                    serde_json::from_str::<Handshake>(&body[start..]).ok()
                })
                .await;
                match handshake {
                    Ok(Some(h)) => {
                        ping_interval = Duration::from_millis(h.ping_interval_ms);
                        let ws_base = cfg
                            .base_url
                            .trim_end_matches('/')
                            .replacen("https://", "wss://", 1)
                            .replacen("http://", "ws://", 1);
                        url = format!(
                            "{ws_base}/socket.io/?EIO=3&transport=websocket&sid={}",
                            h.sid
                        );
                        if let Some(token) = &cfg.auth_token {
                            url.push_str(&format!("&token={token}"));
                        }
                    }
                    _ => {
                        // Keep the previous URL; the next loop fails fast and
                        // backs off again.
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        if let Some(tx) = self.cmd_tx.lock().take() {
            let _ = tx.send(Command::Close);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            // Give the close frame a moment, then make sure the task is gone.
            tokio::time::sleep(Duration::from_millis(100)).await;
            task.abort();
        }
        self.shared.set_state(AdapterState::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> CoreResult<()> {
        let added = self.shared.add_subscription_intent(symbols);
        if added.is_empty() {
            return Ok(());
        }
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(Command::Subscribe(added));
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> CoreResult<()> {
        self.shared.remove_subscription_intent(symbols);
        if let Some(tx) = self.cmd_tx.lock().as_ref() {
            let _ = tx.send(Command::Unsubscribe(symbols.to_vec()));
        }
        Ok(())
    }

    async fn place(&self, order: LpOrder) -> CoreResult<LpExecution> {
        Err(CoreError::UnexpectedMessage(format!(
            "adapter {} is quote-only, cannot place {}",
            self.shared.id, order.cl_ord_id
        )))
    }

    fn status(&self) -> AdapterStatus {
        self.shared.status(self.protocol())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_body_parses_past_length_prefix() {
        let body = r#"97:0{"sid":"abc123","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":60000}"#;
        let start = body.find('{').unwrap();
        let hs: Handshake = serde_json::from_str(&body[start..]).unwrap();
        assert_eq!(hs.sid, "abc123");
        assert_eq!(hs.ping_interval_ms, 25_000);
    }

    #[test]
    fn wire_quote_deserializes() {
        let json = r#"{"symbol":"EURUSD","bid":1.0900,"ask":1.0902,"ts":1700000000000,"seq":42}"#;
        let q: WireQuote = serde_json::from_str(json).unwrap();
        assert_eq!(q.symbol, "EURUSD");
        assert_eq!(q.seq, Some(42));
        assert!(!q.stale);
    }

    #[test]
    fn event_frame_shape() {
        let text = r#"42["quote",{"symbol":"EURUSD","bid":1.09,"ask":1.091}]"#;
        assert!(text.starts_with("42"));
        let payload: serde_json::Value = serde_json::from_str(&text[2..]).unwrap();
        assert_eq!(payload[0].as_str(), Some("quote"));
        assert!(payload[1]["bid"].as_f64().unwrap() > 1.0);
    }
}
