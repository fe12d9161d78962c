// =============================================================================
// LP Adapter Layer — pluggable liquidity-provider sessions
// =============================================================================
//
// Every adapter owns its socket and session state, publishes normalized
// quotes onto a shared bounded channel, and accepts A-Book orders. The
// supervisor drives the connect/reconnect lifecycle; adapters report their
// state machine position through `AdapterStatus`.
//
// State machine:
//   Disconnected -> Connecting -> Connected -> LoggedIn -> Streaming
//   any -> Error (terminal until the supervisor re-arms to Disconnected)
// =============================================================================

pub mod fix;
pub mod rest_stream;
pub mod socketio;

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{CoreError, CoreResult};
use crate::types::{Quote, Side, TimeInForce};

// ---------------------------------------------------------------------------
// Adapter state machine
// ---------------------------------------------------------------------------

/// Connection lifecycle state common to all adapter protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    LoggedIn = 3,
    Streaming = 4,
    Error = 5,
}

impl AdapterState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::LoggedIn,
            4 => Self::Streaming,
            5 => Self::Error,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::LoggedIn => "LOGGED_IN",
            Self::Streaming => "STREAMING",
            Self::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Status snapshot reported to the supervisor and `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct AdapterStatus {
    pub id: String,
    pub protocol: String,
    pub state: AdapterState,
    pub subscribed_symbols: usize,
    /// Milliseconds since epoch of the last quote produced, 0 if none.
    pub last_quote_ms: i64,
    pub last_error: Option<String>,
    pub reconnect_attempts: u64,
    pub quotes_dropped: u64,
}

// ---------------------------------------------------------------------------
// Order entry types (A-Book)
// ---------------------------------------------------------------------------

/// Order forwarded to an external provider.
#[derive(Debug, Clone)]
pub struct LpOrder {
    /// Client order id, unique per attempt.
    pub cl_ord_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    /// None for market orders.
    pub limit_price: Option<f64>,
    pub tif: TimeInForce,
}

/// Execution report returned by a provider.
#[derive(Debug, Clone, Serialize)]
pub struct LpExecution {
    pub cl_ord_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    /// Cumulative filled volume.
    pub filled_volume: f64,
    pub avg_price: f64,
    /// Fully filled, partially filled, or rejected.
    pub status: LpExecStatus,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LpExecStatus {
    Filled,
    PartiallyFilled,
    Rejected,
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// A session to one liquidity provider. Implementations own their transport
/// exclusively; all methods are safe to call from the supervisor task.
#[async_trait]
pub trait LpAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn protocol(&self) -> &'static str;

    /// Establish the session. Idempotent; returns once the session reaches a
    /// terminal state (streaming or failed). A non-retryable error
    /// (`AuthRejected`, `SequenceTooLow`) must be surfaced as-is so the
    /// supervisor can stop re-arming.
    async fn connect(&self) -> CoreResult<()>;

    /// Tear the session down, sending the protocol's farewell when one
    /// exists (FIX Logout). Idempotent.
    async fn disconnect(&self) -> CoreResult<()>;

    /// Add symbols to the subscription intent and request provider streams.
    /// Intent survives reconnects; the adapter resubscribes on its own.
    async fn subscribe(&self, symbols: &[String]) -> CoreResult<()>;

    async fn unsubscribe(&self, symbols: &[String]) -> CoreResult<()>;

    /// A-Book order entry. Resolves with the provider's execution report or
    /// a timeout error after the configured place timeout.
    async fn place(&self, order: LpOrder) -> CoreResult<LpExecution>;

    fn status(&self) -> AdapterStatus;
}

// ---------------------------------------------------------------------------
// Shared adapter plumbing
// ---------------------------------------------------------------------------

/// State cell shared between an adapter's public handle and its I/O tasks.
/// Tracks the state machine, subscription intent, and drop counters.
pub struct AdapterShared {
    pub id: String,
    state: AtomicU8,
    pub subscribed: RwLock<Vec<String>>,
    pub last_error: RwLock<Option<String>>,
    pub last_quote_ms: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub quotes_dropped: AtomicU64,
    quote_tx: mpsc::Sender<Quote>,
}

impl AdapterShared {
    pub fn new(id: impl Into<String>, quote_tx: mpsc::Sender<Quote>) -> Self {
        Self {
            id: id.into(),
            state: AtomicU8::new(AdapterState::Disconnected as u8),
            subscribed: RwLock::new(Vec::new()),
            last_error: RwLock::new(None),
            last_quote_ms: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            quotes_dropped: AtomicU64::new(0),
            quote_tx,
        }
    }

    pub fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: AdapterState) {
        let prev = self.state.swap(state as u8, Ordering::SeqCst);
        if prev != state as u8 {
            debug!(adapter = %self.id, from = %AdapterState::from_u8(prev), to = %state, "adapter state");
        }
    }

    pub fn record_error(&self, err: &CoreError) {
        *self.last_error.write() = Some(format!("{}: {err}", err.kind()));
    }

    /// Publish a quote onto the shared channel. The channel is bounded; when
    /// the aggregator falls behind, this source's quote is dropped and
    /// counted rather than blocking the I/O loop.
    pub fn publish_quote(&self, quote: Quote) {
        self.last_quote_ms
            .store(quote.source_time_ms.max(0) as u64, Ordering::Relaxed);
        if let Err(e) = self.quote_tx.try_send(quote) {
            let dropped = self.quotes_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % 1000 == 1 {
                warn!(adapter = %self.id, dropped, error = %e, "quote channel congested, dropping");
            }
        }
    }

    /// Merge new symbols into the subscription intent; returns the symbols
    /// that were not already present.
    pub fn add_subscription_intent(&self, symbols: &[String]) -> Vec<String> {
        let mut subscribed = self.subscribed.write();
        let mut added = Vec::new();
        for sym in symbols {
            if !subscribed.contains(sym) {
                subscribed.push(sym.clone());
                added.push(sym.clone());
            }
        }
        added
    }

    pub fn remove_subscription_intent(&self, symbols: &[String]) {
        let mut subscribed = self.subscribed.write();
        subscribed.retain(|s| !symbols.contains(s));
    }

    pub fn status(&self, protocol: &'static str) -> AdapterStatus {
        AdapterStatus {
            id: self.id.clone(),
            protocol: protocol.to_string(),
            state: self.state(),
            subscribed_symbols: self.subscribed.read().len(),
            last_quote_ms: self.last_quote_ms.load(Ordering::Relaxed) as i64,
            last_error: self.last_error.read().clone(),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            quotes_dropped: self.quotes_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Exponential reconnect backoff shared by the WebSocket and REST adapters:
/// base 3 s, doubling, capped at 30 s, with a little jitter so that several
/// adapters do not reconnect in lockstep.
pub fn reconnect_delay(attempt: u64) -> std::time::Duration {
    use rand::Rng;
    let base = 3.0_f64 * 2.0_f64.powi(attempt.min(8) as i32);
    let capped = base.min(30.0);
    let jitter = rand::thread_rng().gen_range(0.0..0.5);
    std::time::Duration::from_secs_f64(capped + jitter)
}

/// Current wall-clock in (milliseconds, nanoseconds) since epoch, used to
/// stamp quote receive times.
pub fn now_ms_ns() -> (i64, i64) {
    let now = chrono::Utc::now();
    (
        now.timestamp_millis(),
        now.timestamp_nanos_opt().unwrap_or(now.timestamp_millis() * 1_000_000),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> (AdapterShared, mpsc::Receiver<Quote>) {
        let (tx, rx) = mpsc::channel(4);
        (AdapterShared::new("lp-test", tx), rx)
    }

    fn quote(sym: &str) -> Quote {
        Quote {
            symbol: sym.into(),
            bid: 1.0,
            ask: 1.0002,
            source: "lp-test".into(),
            source_seq: None,
            source_time_ms: 1_700_000_000_000,
            recv_time_ns: 0,
            stale: false,
        }
    }

    #[test]
    fn state_transitions_round_trip() {
        let (shared, _rx) = shared();
        assert_eq!(shared.state(), AdapterState::Disconnected);
        shared.set_state(AdapterState::Connecting);
        shared.set_state(AdapterState::Streaming);
        assert_eq!(shared.state(), AdapterState::Streaming);
        shared.set_state(AdapterState::Error);
        assert_eq!(shared.state(), AdapterState::Error);
    }

    #[test]
    fn publish_counts_drops_when_channel_full() {
        let (shared, _rx) = shared();
        for _ in 0..4 {
            shared.publish_quote(quote("EURUSD"));
        }
        assert_eq!(shared.quotes_dropped.load(Ordering::Relaxed), 0);
        // Channel capacity is 4; the fifth publish must drop.
        shared.publish_quote(quote("EURUSD"));
        assert_eq!(shared.quotes_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn subscription_intent_deduplicates() {
        let (shared, _rx) = shared();
        let added = shared.add_subscription_intent(&["EURUSD".into(), "USDJPY".into()]);
        assert_eq!(added.len(), 2);
        let added = shared.add_subscription_intent(&["EURUSD".into(), "GBPUSD".into()]);
        assert_eq!(added, vec!["GBPUSD".to_string()]);
        shared.remove_subscription_intent(&["EURUSD".into()]);
        assert_eq!(shared.subscribed.read().len(), 2);
    }

    #[test]
    fn backoff_is_capped() {
        assert!(reconnect_delay(0).as_secs_f64() >= 3.0);
        assert!(reconnect_delay(20).as_secs_f64() <= 30.5);
    }
}

/// Convenience alias used by the supervisor.
pub type SharedAdapter = Arc<dyn LpAdapter>;
