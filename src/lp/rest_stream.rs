// =============================================================================
// REST streaming adapter — chunked line-delimited JSON reader
// =============================================================================
//
// The provider exposes a long-lived HTTP response whose body is one JSON
// event per line. Connection requests are HMAC-SHA256 signed with the
// provider credentials. The adapter reconnects forever with exponential
// backoff and re-sends its symbol list on every connect (subscription is
// part of the request query).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{AdapterConfig, RestStreamConfig};
use crate::errors::{CoreError, CoreResult};
use crate::lp::{
    reconnect_delay, AdapterShared, AdapterState, AdapterStatus, LpAdapter, LpExecution, LpOrder,
};
use crate::types::Quote;

type HmacSha256 = Hmac<Sha256>;

/// One line of the stream.
#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    bid: Option<f64>,
    #[serde(default)]
    ask: Option<f64>,
    #[serde(default)]
    ts: Option<i64>,
    #[serde(default)]
    seq: Option<u64>,
}

pub struct RestStreamAdapter {
    shared: Arc<AdapterShared>,
    cfg: RestStreamConfig,
    connect_timeout: Duration,
    http: reqwest::Client,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    stop_tx: Mutex<Option<tokio::sync::watch::Sender<bool>>>,
}

impl RestStreamAdapter {
    pub fn new(
        adapter_cfg: &AdapterConfig,
        cfg: RestStreamConfig,
        quote_tx: mpsc::Sender<Quote>,
    ) -> Self {
        let shared = Arc::new(AdapterShared::new(adapter_cfg.id.clone(), quote_tx));
        shared.add_subscription_intent(&adapter_cfg.symbols);
        Self {
            shared,
            cfg,
            connect_timeout: Duration::from_secs(adapter_cfg.connect_timeout_secs),
            http: reqwest::Client::new(),
            task: Mutex::new(None),
            stop_tx: Mutex::new(None),
        }
    }

    /// Build the signed streaming URL for the current subscription intent.
    fn stream_url(cfg: &RestStreamConfig, symbols: &[String]) -> String {
        let ts = chrono::Utc::now().timestamp_millis();
        let mut query = format!("symbols={}&ts={ts}", symbols.join(","));
        if let (Some(key), Some(secret)) = (&cfg.api_key, &cfg.api_secret) {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC accepts any key size");
            mac.update(query.as_bytes());
            let signature = hex::encode(mac.finalize().into_bytes());
            query.push_str(&format!("&key={key}&signature={signature}"));
        }
        let sep = if cfg.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}{query}", cfg.url)
    }

    /// One connection lifetime: stream lines until failure or stop.
    async fn run_stream(
        shared: &Arc<AdapterShared>,
        http: &reqwest::Client,
        url: &str,
        connect_timeout: Duration,
        stop_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) -> CoreResult<()> {
        shared.set_state(AdapterState::Connecting);
        let resp = tokio::time::timeout(connect_timeout, http.get(url).send())
            .await
            .map_err(|_| CoreError::Timeout("stream connect".into()))?
            .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED
            || resp.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CoreError::AuthRejected(format!(
                "stream returned {}",
                resp.status()
            )));
        }
        if !resp.status().is_success() {
            return Err(CoreError::ConnectFailed(format!(
                "stream returned {}",
                resp.status()
            )));
        }
        shared.set_state(AdapterState::Streaming);
        info!(adapter = %shared.id, "rest stream connected");

        let mut body = resp.bytes_stream();
        let mut line_buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            tokio::select! {
                chunk = body.next() => {
                    match chunk {
                        Some(Ok(bytes)) => {
                            for byte in bytes {
                                if byte == b'\n' {
                                    Self::handle_line(shared, &line_buf);
                                    line_buf.clear();
                                } else {
                                    line_buf.push(byte);
                                }
                            }
                        }
                        Some(Err(e)) => return Err(CoreError::ReadError(e.to_string())),
                        None => return Err(CoreError::ReadError("stream ended".into())),
                    }
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn handle_line(shared: &Arc<AdapterShared>, line: &[u8]) {
        let line = match std::str::from_utf8(line) {
            Ok(s) => s.trim(),
            Err(_) => return,
        };
        if line.is_empty() {
            return;
        }
        let event: WireEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                debug!(adapter = %shared.id, error = %e, "unparseable stream line");
                return;
            }
        };
        if event.kind != "quote" {
            return;
        }
        let (Some(symbol), Some(bid), Some(ask)) = (event.symbol, event.bid, event.ask) else {
            debug!(adapter = %shared.id, "quote event missing fields");
            return;
        };
        let (now_ms, now_ns) = crate::lp::now_ms_ns();
        let quote = Quote {
            symbol,
            bid,
            ask,
            source: shared.id.clone(),
            source_seq: event.seq,
            source_time_ms: event.ts.unwrap_or(now_ms),
            recv_time_ns: now_ns,
            stale: false,
        };
        if quote.is_well_formed() {
            shared.publish_quote(quote);
        }
    }
}

#[async_trait]
impl LpAdapter for RestStreamAdapter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn protocol(&self) -> &'static str {
        "rest-stream"
    }

    async fn connect(&self) -> CoreResult<()> {
        if self.shared.state() == AdapterState::Streaming {
            return Ok(());
        }

        // First attempt inline so credential failures surface to the caller.
        let url = Self::stream_url(&self.cfg, &self.shared.subscribed.read().clone());
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);

        let probe = {
            let shared = self.shared.clone();
            let http = self.http.clone();
            let connect_timeout = self.connect_timeout;
            let resp = tokio::time::timeout(connect_timeout, http.get(&url).send())
                .await
                .map_err(|_| CoreError::Timeout("stream connect".into()))
                .and_then(|r| r.map_err(|e| CoreError::ConnectFailed(e.to_string())));
            match resp {
                Ok(resp)
                    if resp.status() == reqwest::StatusCode::UNAUTHORIZED
                        || resp.status() == reqwest::StatusCode::FORBIDDEN =>
                {
                    let err = CoreError::AuthRejected(format!("stream returned {}", resp.status()));
                    shared.record_error(&err);
                    shared.set_state(AdapterState::Error);
                    return Err(err);
                }
                Ok(_) => Ok(()),
                Err(e) => {
                    shared.record_error(&e);
                    shared.set_state(AdapterState::Disconnected);
                    Err(e)
                }
            }
        };
        probe?;

        *self.stop_tx.lock() = Some(stop_tx);
        let shared = self.shared.clone();
        let cfg = self.cfg.clone();
        let http = self.http.clone();
        let connect_timeout = self.connect_timeout;

        let task = tokio::spawn(async move {
            let mut attempt: u64 = 0;
            loop {
                let url = Self::stream_url(&cfg, &shared.subscribed.read().clone());
                match Self::run_stream(&shared, &http, &url, connect_timeout, &mut stop_rx).await {
                    Ok(()) => {
                        shared.set_state(AdapterState::Disconnected);
                        return; // deliberate stop
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
                            "rest stream reconnecting"
                        );
                        tokio::time::sleep(delay).await;
                        if *stop_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        if let Some(tx) = self.stop_tx.lock().take() {
            let _ = tx.send(true);
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            tokio::time::sleep(Duration::from_millis(100)).await;
            task.abort();
        }
        self.shared.set_state(AdapterState::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> CoreResult<()> {
        // Subscription is part of the connect query; adding symbols forces a
        // reconnect with the widened list.
        let added = self.shared.add_subscription_intent(symbols);
        if !added.is_empty() && self.shared.state() == AdapterState::Streaming {
            self.disconnect().await?;
            self.connect().await?;
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> CoreResult<()> {
        self.shared.remove_subscription_intent(symbols);
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

    fn shared() -> (Arc<AdapterShared>, mpsc::Receiver<Quote>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(AdapterShared::new("lp-rest", tx)), rx)
    }

    #[test]
    fn quote_line_is_published() {
        let (shared, mut rx) = shared();
        let line = br#"{"type":"quote","symbol":"EURUSD","bid":1.0900,"ask":1.0902,"ts":1700000000000,"seq":9}"#;
        RestStreamAdapter::handle_line(&shared, line);
        let q = rx.try_recv().unwrap();
        assert_eq!(q.symbol, "EURUSD");
        assert_eq!(q.source_seq, Some(9));
    }

    #[test]
    fn non_quote_and_garbage_lines_are_ignored() {
        let (shared, mut rx) = shared();
        RestStreamAdapter::handle_line(&shared, br#"{"type":"heartbeat"}"#);
        RestStreamAdapter::handle_line(&shared, b"not-json-at-all");
        RestStreamAdapter::handle_line(&shared, b"");
        // Missing ask: dropped.
        RestStreamAdapter::handle_line(&shared, br#"{"type":"quote","symbol":"EURUSD","bid":1.09}"#);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stream_url_is_signed_when_credentials_present() {
        let cfg = RestStreamConfig {
            url: "https://stream.example.com/v1/quotes".into(),
            api_key: Some("key-1".into()),
            api_secret: Some("secret".into()),
        };
        let url = RestStreamAdapter::stream_url(&cfg, &["EURUSD".into(), "USDJPY".into()]);
        assert!(url.contains("symbols=EURUSD,USDJPY"));
        assert!(url.contains("key=key-1"));
        assert!(url.contains("signature="));
    }

    #[test]
    fn stream_url_without_credentials_is_unsigned() {
        let cfg = RestStreamConfig {
            url: "https://stream.example.com/v1/quotes?fmt=jsonl".into(),
            api_key: None,
            api_secret: None,
        };
        let url = RestStreamAdapter::stream_url(&cfg, &["EURUSD".into()]);
        assert!(url.contains("?fmt=jsonl&symbols=EURUSD"));
        assert!(!url.contains("signature="));
    }
}
