// =============================================================================
// Distributor — authenticated tick fan-out with per-client backpressure
// =============================================================================
//
// Each connected client owns a bounded send queue drained by its socket
// writer task. The aggregator's publish path only ever does a non-blocking
// enqueue here; a slow client degrades alone:
//
//   OK    queue has room, ticks enqueue normally
//   SLOW  queue full; newest-wins per-symbol coalescing replaces queued
//         ticks, the oldest other-symbol tick is dropped when there is
//         nothing to coalesce
//   KILL  still full after `slow_grace`; the connection is closed with the
//         slow-consumer close code (1009)
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::DistributorConfig;
use crate::ohlc::Bar;
use crate::types::Tick;

/// WebSocket close codes used by the hub.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const AUTH_FAILURE: u16 = 1008;
    pub const SLOW_CONSUMER: u16 = 1009;
    pub const SERVER_SHUTDOWN: u16 = 4000;
}

/// Congestion state of one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Congestion {
    Ok,
    Slow,
    Kill,
}

/// One outbound frame. Ticks stay structured until the writer serializes
/// them so the queue can coalesce per symbol.
#[derive(Debug, Clone)]
pub enum OutFrame {
    Tick(Tick),
    Bar(Bar),
    Subscribed(Vec<String>),
    Unsubscribed(Vec<String>),
    Pong,
}

impl OutFrame {
    pub fn to_json(&self) -> String {
        match self {
            Self::Tick(t) => json!({
                "type": "tick",
                "symbol": t.symbol,
                "bid": t.bid,
                "ask": t.ask,
                "spread": t.spread,
                "timestamp": t.timestamp_ms,
                "lp": t.sources.first().cloned().unwrap_or_default(),
            })
            .to_string(),
            Self::Bar(b) => json!({
                "type": "bar",
                "symbol": b.symbol,
                "timeframe": b.timeframe.label(),
                "open_time": b.open_time_ms,
                "open": b.open,
                "high": b.high,
                "low": b.low,
                "close": b.close,
                "volume": b.volume,
            })
            .to_string(),
            Self::Subscribed(channels) => {
                json!({ "type": "subscribed", "channels": channels }).to_string()
            }
            Self::Unsubscribed(channels) => {
                json!({ "type": "unsubscribed", "channels": channels }).to_string()
            }
            Self::Pong => json!({ "type": "pong" }).to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client state
// ---------------------------------------------------------------------------

struct SlowState {
    since: Instant,
}

pub struct ClientState {
    pub id: u64,
    pub account_id: String,
    /// `None` means the wildcard subscription (`*`).
    subscriptions: RwLock<Option<HashSet<String>>>,
    queue: Mutex<VecDeque<OutFrame>>,
    queue_capacity: usize,
    slow: Mutex<Option<SlowState>>,
    killed: AtomicBool,
    /// Wakes the socket writer when frames or a kill are pending.
    pub wake: Notify,
    pub dropped_frames: AtomicU64,
}

impl ClientState {
    fn new(id: u64, account_id: String, queue_capacity: usize) -> Self {
        Self {
            id,
            account_id,
            subscriptions: RwLock::new(Some(HashSet::new())),
            queue: Mutex::new(VecDeque::with_capacity(64)),
            queue_capacity,
            slow: Mutex::new(None),
            killed: AtomicBool::new(false),
            wake: Notify::new(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn congestion(&self) -> Congestion {
        if self.is_killed() {
            Congestion::Kill
        } else if self.slow.lock().is_some() {
            Congestion::Slow
        } else {
            Congestion::Ok
        }
    }

    fn wants(&self, symbol: &str) -> bool {
        match self.subscriptions.read().as_ref() {
            None => true, // wildcard
            Some(set) => set.contains(symbol),
        }
    }

    /// Apply a subscribe frame. `*` switches to the wildcard.
    pub fn subscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.write();
        if channels.iter().any(|c| c == "*") {
            *subs = None;
            return;
        }
        match subs.as_mut() {
            Some(set) => {
                for c in channels {
                    set.insert(c.clone());
                }
            }
            None => {} // already wildcard
        }
    }

    pub fn unsubscribe(&self, channels: &[String]) {
        let mut subs = self.subscriptions.write();
        if channels.iter().any(|c| c == "*") {
            *subs = Some(HashSet::new());
            return;
        }
        if let Some(set) = subs.as_mut() {
            for c in channels {
                set.remove(c);
            }
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drain up to `max` frames for the writer.
    pub fn drain(&self, max: usize) -> Vec<OutFrame> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        let drained: Vec<OutFrame> = queue.drain(..n).collect();
        if queue.len() < self.queue_capacity {
            // Writer caught up; clear the congestion clock.
            *self.slow.lock() = None;
        }
        drained
    }

    /// Non-blocking enqueue implementing the congestion policy. Returns the
    /// state after the attempt.
    fn push(&self, frame: OutFrame, slow_grace_ms: u64) -> Congestion {
        if self.is_killed() {
            return Congestion::Kill;
        }
        let mut queue = self.queue.lock();
        if queue.len() < self.queue_capacity {
            queue.push_back(frame);
            drop(queue);
            self.wake.notify_one();
            return Congestion::Ok;
        }

        // Queue full: the client is officially slow.
        let since = {
            let mut slow = self.slow.lock();
            slow.get_or_insert_with(|| SlowState {
                since: Instant::now(),
            })
            .since
        };

        if since.elapsed().as_millis() as u64 >= slow_grace_ms {
            drop(queue);
            self.kill();
            return Congestion::Kill;
        }

        // Newest-wins per symbol: replace the queued tick for this symbol,
        // or evict the oldest tick of some other symbol.
        if let OutFrame::Tick(ref tick) = frame {
            let same = queue.iter().position(
                |f| matches!(f, OutFrame::Tick(t) if t.symbol == tick.symbol),
            );
            match same {
                Some(idx) => {
                    queue.remove(idx);
                }
                None => {
                    let oldest_tick = queue
                        .iter()
                        .position(|f| matches!(f, OutFrame::Tick(_)));
                    match oldest_tick {
                        Some(idx) => {
                            queue.remove(idx);
                        }
                        None => {
                            queue.pop_front();
                        }
                    }
                }
            }
            queue.push_back(frame);
        }
        // Non-tick frames are simply dropped when the queue is full.
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.wake.notify_one();
        Congestion::Slow
    }

    pub fn kill(&self) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            warn!(client = self.id, account = %self.account_id, "slow consumer killed");
        }
        self.wake.notify_one();
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct DistributorSnapshot {
    pub clients: usize,
    pub slow_clients: usize,
    pub frames_dropped: u64,
}

pub struct Distributor {
    cfg: DistributorConfig,
    clients: RwLock<Vec<Arc<ClientState>>>,
    next_id: AtomicU64,
}

impl Distributor {
    pub fn new(cfg: DistributorConfig) -> Self {
        Self {
            cfg,
            clients: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.cfg
    }

    pub fn register(&self, account_id: &str) -> Arc<ClientState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(ClientState::new(
            id,
            account_id.to_string(),
            self.cfg.client_queue_capacity,
        ));
        self.clients.write().push(client.clone());
        info!(client = id, account = account_id, "subscriber connected");
        client
    }

    pub fn unregister(&self, client_id: u64) {
        let mut clients = self.clients.write();
        if let Some(idx) = clients.iter().position(|c| c.id == client_id) {
            let client = clients.swap_remove(idx);
            debug!(client = client.id, "subscriber removed");
        }
    }

    /// Fan a tick out to every subscriber of its symbol. Never blocks.
    pub fn publish_tick(&self, tick: &Tick) {
        let clients = self.clients.read();
        for client in clients.iter() {
            if client.is_killed() || !client.wants(&tick.symbol) {
                continue;
            }
            client.push(OutFrame::Tick(tick.clone()), self.cfg.slow_grace_ms);
        }
    }

    /// Fan a finalized OHLC bar out to subscribers of the symbol.
    pub fn publish_bar(&self, bar: &Bar) {
        let clients = self.clients.read();
        for client in clients.iter() {
            if client.is_killed() || !client.wants(&bar.symbol) {
                continue;
            }
            client.push(OutFrame::Bar(bar.clone()), self.cfg.slow_grace_ms);
        }
    }

    /// Close every connection (server shutdown, code 4000 at the socket).
    pub fn kill_all(&self) {
        for client in self.clients.read().iter() {
            client.kill();
        }
    }

    pub fn snapshot(&self) -> DistributorSnapshot {
        let clients = self.clients.read();
        DistributorSnapshot {
            clients: clients.len(),
            slow_clients: clients
                .iter()
                .filter(|c| c.congestion() != Congestion::Ok)
                .count(),
            frames_dropped: clients
                .iter()
                .map(|c| c.dropped_frames.load(Ordering::Relaxed))
                .sum(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client->server frames
// ---------------------------------------------------------------------------

/// A parsed client frame from the subscription protocol.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
pub enum ClientFrame {
    Action {
        action: String,
        #[serde(default)]
        channels: Vec<String>,
    },
    Typed {
        #[serde(rename = "type")]
        kind: String,
    },
}

/// Apply one inbound text frame; the response (if any) is enqueued.
pub fn handle_client_frame(client: &ClientState, text: &str, slow_grace_ms: u64) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            debug!(client = client.id, error = %e, "unparseable client frame");
            return;
        }
    };
    match frame {
        ClientFrame::Action { action, channels } => match action.as_str() {
            "subscribe" => {
                client.subscribe(&channels);
                client.push(OutFrame::Subscribed(channels), slow_grace_ms);
            }
            "unsubscribe" => {
                client.unsubscribe(&channels);
                client.push(OutFrame::Unsubscribed(channels), slow_grace_ms);
            }
            other => debug!(client = client.id, action = other, "unknown action"),
        },
        ClientFrame::Typed { kind } => {
            if kind == "ping" {
                client.push(OutFrame::Pong, slow_grace_ms);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, seq: u64) -> Tick {
        Tick {
            symbol: symbol.into(),
            bid: 1.09,
            ask: 1.0902,
            spread: 0.0002,
            timestamp_ms: seq as i64,
            sources: vec!["lp-a".into()],
            seq,
        }
    }

    fn hub(queue: usize, grace_ms: u64) -> Distributor {
        Distributor::new(DistributorConfig {
            client_queue_capacity: queue,
            slow_grace_ms: grace_ms,
            ping_interval_secs: 30,
            pong_deadline_secs: 10,
        })
    }

    #[test]
    fn subscription_filtering() {
        let hub = hub(100, 1_000);
        let client = hub.register("acc-1");
        client.subscribe(&["EURUSD".into()]);

        hub.publish_tick(&tick("EURUSD", 1));
        hub.publish_tick(&tick("USDJPY", 2));
        assert_eq!(client.queued(), 1);

        client.subscribe(&["*".into()]);
        hub.publish_tick(&tick("USDJPY", 3));
        assert_eq!(client.queued(), 2);

        client.unsubscribe(&["*".into()]);
        hub.publish_tick(&tick("USDJPY", 4));
        assert_eq!(client.queued(), 2);
    }

    #[test]
    fn tick_frame_schema() {
        let frame = OutFrame::Tick(tick("EURUSD", 7));
        let value: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(value["type"], "tick");
        assert_eq!(value["symbol"], "EURUSD");
        assert_eq!(value["lp"], "lp-a");
        assert!(value["bid"].as_f64().unwrap() > 1.0);
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn queue_caps_and_coalesces_newest_wins() {
        let hub = hub(3, 60_000);
        let client = hub.register("acc-1");
        client.subscribe(&["*".into()]);

        for seq in 1..=3 {
            hub.publish_tick(&tick("EURUSD", seq));
        }
        assert_eq!(client.queued(), 3);
        assert_eq!(client.congestion(), Congestion::Ok);

        // Queue full: the EURUSD tick coalesces (old replaced by new).
        hub.publish_tick(&tick("EURUSD", 4));
        assert_eq!(client.queued(), 3);
        assert_eq!(client.congestion(), Congestion::Slow);

        let frames = client.drain(10);
        let seqs: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                OutFrame::Tick(t) => Some(t.seq),
                _ => None,
            })
            .collect();
        // Seq 1 was replaced by 4; per-symbol order is preserved.
        assert_eq!(seqs, vec![2, 3, 4]);
    }

    #[test]
    fn coalescing_prefers_same_symbol_then_oldest() {
        let hub = hub(2, 60_000);
        let client = hub.register("acc-1");
        client.subscribe(&["*".into()]);

        hub.publish_tick(&tick("EURUSD", 1));
        hub.publish_tick(&tick("USDJPY", 2));
        // Full; GBPUSD has nothing to coalesce with, so the oldest queued
        // tick (EURUSD) is evicted.
        hub.publish_tick(&tick("GBPUSD", 3));

        let frames = client.drain(10);
        let symbols: Vec<&str> = frames
            .iter()
            .filter_map(|f| match f {
                OutFrame::Tick(t) => Some(t.symbol.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(symbols, vec!["USDJPY", "GBPUSD"]);
    }

    #[test]
    fn slow_consumer_killed_after_grace() {
        let hub = hub(2, 0); // zero grace: kill on the first congested push
        let client = hub.register("acc-1");
        client.subscribe(&["*".into()]);

        hub.publish_tick(&tick("EURUSD", 1));
        hub.publish_tick(&tick("EURUSD", 2));
        assert_eq!(client.congestion(), Congestion::Ok);
        hub.publish_tick(&tick("EURUSD", 3));
        assert_eq!(client.congestion(), Congestion::Kill);
        assert!(client.is_killed());
    }

    #[test]
    fn burst_keeps_queue_bounded_and_ordered() {
        let hub = hub(1_000, 60_000);
        let client = hub.register("acc-1");
        client.subscribe(&["*".into()]);

        for seq in 1..=2_000u64 {
            hub.publish_tick(&tick("EURUSD", seq));
        }
        assert!(client.queued() <= 1_000);

        let frames = client.drain(2_000);
        let seqs: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                OutFrame::Tick(t) => Some(t.seq),
                _ => None,
            })
            .collect();
        // Whatever was dropped, the survivors are strictly increasing and
        // the newest tick survived.
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seqs.last().unwrap(), 2_000);
    }

    #[test]
    fn drain_clears_slow_state() {
        let hub = hub(2, 60_000);
        let client = hub.register("acc-1");
        client.subscribe(&["*".into()]);
        for seq in 1..=3 {
            hub.publish_tick(&tick("EURUSD", seq));
        }
        assert_eq!(client.congestion(), Congestion::Slow);
        client.drain(10);
        assert_eq!(client.congestion(), Congestion::Ok);
    }

    #[test]
    fn client_frames_subscribe_and_ping() {
        let hub = hub(100, 1_000);
        let client = hub.register("acc-1");

        handle_client_frame(
            &client,
            r#"{"action":"subscribe","channels":["EURUSD","USDJPY"]}"#,
            1_000,
        );
        let frames = client.drain(10);
        assert!(matches!(&frames[0], OutFrame::Subscribed(c) if c.len() == 2));
        assert!(client.wants("EURUSD"));
        assert!(!client.wants("GBPUSD"));

        handle_client_frame(&client, r#"{"type":"ping"}"#, 1_000);
        let frames = client.drain(10);
        assert!(matches!(frames[0], OutFrame::Pong));
        let json = frames[0].to_json();
        assert_eq!(json, r#"{"type":"pong"}"#);

        handle_client_frame(
            &client,
            r#"{"action":"unsubscribe","channels":["USDJPY"]}"#,
            1_000,
        );
        assert!(!client.wants("USDJPY"));
        assert!(client.wants("EURUSD"));
    }

    #[test]
    fn unregister_removes_client() {
        let hub = hub(10, 1_000);
        let client = hub.register("acc-1");
        assert_eq!(hub.snapshot().clients, 1);
        hub.unregister(client.id);
        assert_eq!(hub.snapshot().clients, 0);
    }
}
