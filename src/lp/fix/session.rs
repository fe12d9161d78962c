// =============================================================================
// FIX 4.4 session — sequence numbers, heartbeats, gap recovery
// =============================================================================
//
// One session per provider. Writes are serialized through a single writer
// task; outgoing sequence numbers are assigned under the send lock and
// persisted to disk per SenderCompID/TargetCompID pair so a restart resumes
// where the previous process stopped.
//
// Gap recovery: an incoming message ahead of the expected sequence is parked
// in a bounded buffer for `gap_timeout` (out-of-order delivery tolerance),
// then a ResendRequest is issued for the missing range. Replayed messages
// with PossDupFlag=Y that duplicate already-processed sequences are dropped.
// A gap wider than `max_gap` terminates the session.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::codec::{self, msg_type, tags, FixMessage};
use crate::config::FixSessionConfig;
use crate::errors::{CoreError, CoreResult};
use crate::lp::{AdapterShared, LpExecStatus, LpExecution};
use crate::types::{Quote, Side};

/// Upper bound on messages parked while waiting out a sequence gap.
const GAP_BUFFER_MAX: usize = 1_000;

// ---------------------------------------------------------------------------
// Sequence store
// ---------------------------------------------------------------------------

/// Persists `(next outgoing, last processed incoming)` sequence numbers per
/// session, atomic tmp + rename like every other state file in this process.
pub struct SeqStore {
    path: PathBuf,
}

impl SeqStore {
    pub fn new(dir: &str, sender: &str, target: &str) -> Self {
        Self {
            path: PathBuf::from(dir).join(format!("{sender}_{target}.seq")),
        }
    }

    /// Load persisted sequence numbers; a missing file starts the session at
    /// `(1, 0)` — next outgoing 1, nothing yet received.
    pub fn load(&self) -> (u64, u64) {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let mut parts = content.trim().split(':');
                let out = parts.and_next_u64(1);
                let inc = parts.and_next_u64(0);
                debug!(path = %self.path.display(), out, inc, "sequence file loaded");
                (out, inc)
            }
            Err(_) => (1, 0),
        }
    }

    pub fn save(&self, next_out: u64, last_in: u64) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::WriteError(format!("seq dir: {e}")))?;
        }
        let tmp = self.path.with_extension("seq.tmp");
        std::fs::write(&tmp, format!("{next_out}:{last_in}"))
            .map_err(|e| CoreError::WriteError(format!("seq tmp write: {e}")))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| CoreError::WriteError(format!("seq rename: {e}")))?;
        Ok(())
    }

    pub fn reset(&self) -> CoreResult<()> {
        self.save(1, 0)
    }
}

trait NextU64 {
    fn and_next_u64(&mut self, default: u64) -> u64;
}

impl<'a> NextU64 for std::str::Split<'a, char> {
    fn and_next_u64(&mut self, default: u64) -> u64 {
        self.next().and_then(|s| s.parse().ok()).unwrap_or(default)
    }
}

// ---------------------------------------------------------------------------
// Pending order bookkeeping
// ---------------------------------------------------------------------------

struct PendingOrder {
    respond: oneshot::Sender<LpExecution>,
    /// Running cumulative fill across partial ExecutionReports.
    cum_volume: f64,
    avg_price: f64,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Why the session's read loop ended. Distinguishes retryable transport
/// failures from credential-class errors the supervisor must not retry.
#[derive(Debug, Clone)]
pub enum SessionEnd {
    Transport(CoreError),
    Fatal(CoreError),
}

pub struct FixSession {
    pub cfg: FixSessionConfig,
    shared: Arc<AdapterShared>,
    seq_store: SeqStore,

    /// Next outgoing sequence number; guarded together with the writer queue
    /// so assignment order equals wire order.
    send_state: Mutex<SendState>,
    /// Last processed incoming sequence number.
    in_seq: Mutex<u64>,

    logged_in_tx: watch::Sender<bool>,
    pub logged_in_rx: watch::Receiver<bool>,

    pending_orders: Mutex<HashMap<String, PendingOrder>>,
    /// MDReqID -> symbol for in-flight subscriptions.
    md_requests: Mutex<HashMap<String, String>>,
    /// Request ids the provider rejected; no retries for these.
    md_rejected: Mutex<Vec<String>>,
    /// Last known bid/ask per symbol, combined from incremental updates.
    book: Mutex<HashMap<String, (Option<f64>, Option<f64>)>>,

    last_recv: Mutex<Instant>,
    last_sent: Mutex<Instant>,
}

struct SendState {
    next_seq: u64,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl FixSession {
    pub fn new(cfg: FixSessionConfig, shared: Arc<AdapterShared>) -> Self {
        let seq_store = SeqStore::new(&cfg.seq_dir, &cfg.sender_comp_id, &cfg.target_comp_id);
        let (next_out, last_in) = if cfg.reset_on_logon {
            (1, 0)
        } else {
            seq_store.load()
        };
        let (logged_in_tx, logged_in_rx) = watch::channel(false);
        Self {
            cfg,
            shared,
            seq_store,
            send_state: Mutex::new(SendState {
                next_seq: next_out,
                writer: None,
            }),
            in_seq: Mutex::new(last_in),
            logged_in_tx,
            logged_in_rx,
            pending_orders: Mutex::new(HashMap::new()),
            md_requests: Mutex::new(HashMap::new()),
            md_rejected: Mutex::new(Vec::new()),
            book: Mutex::new(HashMap::new()),
            last_recv: Mutex::new(Instant::now()),
            last_sent: Mutex::new(Instant::now()),
        }
    }

    pub fn is_logged_in(&self) -> bool {
        *self.logged_in_rx.borrow()
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Attach the writer side after a fresh TCP connect.
    pub fn attach_writer(&self, mut write_half: OwnedWriteHalf) -> tokio::task::JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        self.send_state.lock().writer = Some(tx);
        let adapter = self.shared.id.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(adapter = %adapter, error = %e, "fix write failed");
                    break;
                }
            }
            debug!(adapter = %adapter, "fix writer task ended");
        })
    }

    pub fn detach_writer(&self) {
        self.send_state.lock().writer = None;
        let _ = self.logged_in_tx.send(false);
    }

    /// Assign a sequence number, encode, enqueue, persist. The single lock
    /// guarantees wire order matches sequence order.
    pub fn send(&self, msg_type: &str, body: &[(u32, String)]) -> CoreResult<()> {
        let mut state = self.send_state.lock();
        let seq = state.next_seq;
        let bytes = codec::encode(
            msg_type,
            seq,
            &self.cfg.sender_comp_id,
            &self.cfg.target_comp_id,
            body,
        );
        let writer = state
            .writer
            .as_ref()
            .ok_or_else(|| CoreError::WriteError("session not connected".into()))?;
        writer
            .send(bytes)
            .map_err(|_| CoreError::WriteError("writer task gone".into()))?;
        state.next_seq = seq + 1;
        let next = state.next_seq;
        drop(state);

        *self.last_sent.lock() = Instant::now();
        self.seq_store.save(next, *self.in_seq.lock())?;
        Ok(())
    }

    pub fn send_logon(&self) -> CoreResult<()> {
        let mut body = vec![
            (tags::ENCRYPT_METHOD, "0".to_string()),
            (tags::HEART_BT_INT, self.cfg.heartbeat_secs.to_string()),
        ];
        if self.cfg.reset_on_logon {
            body.push((tags::RESET_SEQ_NUM_FLAG, "Y".to_string()));
        }
        if let Some(user) = &self.cfg.username {
            body.push((tags::USERNAME, user.clone()));
        }
        if let Some(pass) = &self.cfg.password {
            body.push((tags::PASSWORD, pass.clone()));
        }
        self.send(msg_type::LOGON, &body)
    }

    pub fn send_logout(&self, text: &str) -> CoreResult<()> {
        self.send(msg_type::LOGOUT, &[(tags::TEXT, text.to_string())])
    }

    /// MarketDataRequest (35=V), snapshot + updates, bid and offer entries.
    pub fn send_market_data_request(&self, symbol: &str) -> CoreResult<String> {
        let md_req_id = format!("md-{}-{}", symbol, uuid::Uuid::new_v4().simple());
        let body = vec![
            (tags::MD_REQ_ID, md_req_id.clone()),
            (tags::SUBSCRIPTION_REQUEST_TYPE, "1".to_string()),
            (tags::MARKET_DEPTH, "1".to_string()),
            (tags::NO_MD_ENTRY_TYPES, "2".to_string()),
            (tags::MD_ENTRY_TYPE, "0".to_string()),
            (tags::MD_ENTRY_TYPE, "1".to_string()),
            (tags::NO_RELATED_SYM, "1".to_string()),
            (tags::SYMBOL, symbol.to_string()),
        ];
        self.send(msg_type::MARKET_DATA_REQUEST, &body)?;
        self.md_requests
            .lock()
            .insert(md_req_id.clone(), symbol.to_string());
        Ok(md_req_id)
    }

    /// Unsubscribe (SubscriptionRequestType=2) for a symbol.
    pub fn send_market_data_unsubscribe(&self, symbol: &str) -> CoreResult<()> {
        let md_req_id = format!("md-stop-{}-{}", symbol, uuid::Uuid::new_v4().simple());
        let body = vec![
            (tags::MD_REQ_ID, md_req_id),
            (tags::SUBSCRIPTION_REQUEST_TYPE, "2".to_string()),
            (tags::MARKET_DEPTH, "1".to_string()),
            (tags::NO_RELATED_SYM, "1".to_string()),
            (tags::SYMBOL, symbol.to_string()),
        ];
        self.send(msg_type::MARKET_DATA_REQUEST, &body)
    }

    /// NewOrderSingle (35=D). The returned receiver resolves with the
    /// terminal ExecutionReport.
    pub fn send_new_order_single(
        &self,
        cl_ord_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        limit_price: Option<f64>,
        tif: &str,
    ) -> CoreResult<oneshot::Receiver<LpExecution>> {
        let transact_time = chrono::Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string();
        let mut body = vec![
            (tags::CL_ORD_ID, cl_ord_id.to_string()),
            (tags::SYMBOL, symbol.to_string()),
            (
                tags::SIDE,
                match side {
                    Side::Buy => "1".to_string(),
                    Side::Sell => "2".to_string(),
                },
            ),
            (tags::TRANSACT_TIME, transact_time),
            (tags::ORDER_QTY, format!("{volume}")),
        ];
        match limit_price {
            Some(px) => {
                body.push((tags::ORD_TYPE, "2".to_string()));
                body.push((tags::PRICE, format!("{px}")));
            }
            None => body.push((tags::ORD_TYPE, "1".to_string())),
        }
        body.push((tags::TIME_IN_FORCE, tif.to_string()));

        let (respond, rx) = oneshot::channel();
        self.pending_orders.lock().insert(
            cl_ord_id.to_string(),
            PendingOrder {
                respond,
                cum_volume: 0.0,
                avg_price: 0.0,
            },
        );
        self.send(msg_type::NEW_ORDER_SINGLE, &body)?;
        Ok(rx)
    }

    // -------------------------------------------------------------------------
    // Read loop
    // -------------------------------------------------------------------------

    /// Drive the session until it ends. Handles sequencing, admin messages,
    /// market data, and execution reports. Returns why the session ended.
    pub async fn run_reader(self: Arc<Self>, mut read_half: OwnedReadHalf) -> SessionEnd {
        let mut buf: Vec<u8> = Vec::with_capacity(16 * 1024);
        let mut chunk = [0u8; 8 * 1024];
        let mut gap: Option<GapState> = None;
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut test_request_outstanding = false;

        loop {
            tokio::select! {
                read = read_half.read(&mut chunk) => {
                    match read {
                        Ok(0) => {
                            return SessionEnd::Transport(CoreError::ReadError(
                                "provider closed connection".into(),
                            ));
                        }
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            *self.last_recv.lock() = Instant::now();
                            test_request_outstanding = false;
                            loop {
                                match codec::extract_message(&mut buf) {
                                    Ok(Some(msg)) => {
                                        if let Some(end) = self.handle_sequenced(msg, &mut gap) {
                                            return end;
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(adapter = %self.shared.id, error = %e, "dropping malformed fix data");
                                        buf.clear();
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            return SessionEnd::Transport(CoreError::ReadError(e.to_string()));
                        }
                    }
                }
                _ = tick.tick() => {
                    // Gap timer: after gap_timeout with the gap still open,
                    // request the missing range once.
                    if let Some(state) = gap.as_mut() {
                        if !state.resend_sent
                            && state.since.elapsed() >= Duration::from_millis(self.cfg.gap_timeout_ms)
                        {
                            let end_seq = state.first_buffered().saturating_sub(1);
                            info!(
                                adapter = %self.shared.id,
                                begin = state.expected,
                                end = end_seq,
                                "sequence gap persisted, requesting resend"
                            );
                            let body = vec![
                                (tags::BEGIN_SEQ_NO, state.expected.to_string()),
                                (tags::END_SEQ_NO, end_seq.to_string()),
                            ];
                            if let Err(e) = self.send(msg_type::RESEND_REQUEST, &body) {
                                return SessionEnd::Transport(e);
                            }
                            state.resend_sent = true;
                        }
                    }

                    // Heartbeat / liveness management.
                    let idle_sent = self.last_sent.lock().elapsed();
                    let idle_recv = self.last_recv.lock().elapsed();
                    let hb = Duration::from_secs(self.cfg.heartbeat_secs);

                    if idle_sent >= hb {
                        if let Err(e) = self.send(msg_type::HEARTBEAT, &[]) {
                            return SessionEnd::Transport(e);
                        }
                    }
                    if idle_recv >= hb * 2 {
                        return SessionEnd::Transport(CoreError::ReadError(format!(
                            "no data for {}s, counterparty presumed dead",
                            idle_recv.as_secs()
                        )));
                    }
                    if idle_recv >= hb + hb / 5 && !test_request_outstanding {
                        let body = vec![(
                            tags::TEST_REQ_ID,
                            format!("probe-{}", chrono::Utc::now().timestamp_millis()),
                        )];
                        if let Err(e) = self.send(msg_type::TEST_REQUEST, &body) {
                            return SessionEnd::Transport(e);
                        }
                        test_request_outstanding = true;
                    }
                }
            }
        }
    }

    /// Sequence-validate one message and apply it, draining any parked
    /// messages that become contiguous. Returns `Some` to end the session.
    fn handle_sequenced(
        &self,
        msg: FixMessage,
        gap: &mut Option<GapState>,
    ) -> Option<SessionEnd> {
        let seq = match msg.seq_num() {
            Some(s) => s,
            None => {
                warn!(adapter = %self.shared.id, "message without MsgSeqNum dropped");
                return None;
            }
        };

        // A hard SequenceReset (GapFillFlag absent/N) realigns regardless of
        // its own sequence number.
        if msg.msg_type() == Some(msg_type::SEQUENCE_RESET)
            && msg.get(tags::GAP_FILL_FLAG) != Some("Y")
        {
            if let Some(new_seq) = msg.get_parsed::<u64>(tags::NEW_SEQ_NO) {
                info!(adapter = %self.shared.id, new_seq, "hard sequence reset");
                *self.in_seq.lock() = new_seq.saturating_sub(1);
                *gap = None;
                let _ = self
                    .seq_store
                    .save(self.send_state.lock().next_seq, new_seq.saturating_sub(1));
            }
            return None;
        }

        let expected = *self.in_seq.lock() + 1;

        if seq < expected {
            if msg.is_poss_dup() {
                debug!(adapter = %self.shared.id, seq, expected, "duplicate replay dropped");
                return None;
            }
            return Some(SessionEnd::Fatal(CoreError::SessionFatal(format!(
                "incoming sequence {seq} below expected {expected} without PossDupFlag"
            ))));
        }

        if seq > expected {
            let width = seq - expected;
            if width > self.cfg.max_gap {
                return Some(SessionEnd::Fatal(CoreError::SessionFatal(format!(
                    "sequence gap of {width} exceeds max_gap {}",
                    self.cfg.max_gap
                ))));
            }
            let state = gap.get_or_insert_with(|| GapState::new(expected));
            if state.buffer.len() >= GAP_BUFFER_MAX {
                return Some(SessionEnd::Fatal(CoreError::SessionFatal(
                    "gap buffer overflow".into(),
                )));
            }
            debug!(adapter = %self.shared.id, seq, expected, "message parked behind gap");
            state.buffer.insert(seq, msg);
            return None;
        }

        // seq == expected.
        if let Some(end) = self.apply(&msg) {
            return Some(end);
        }
        self.advance_in_seq(seq);

        // Drain contiguous parked messages.
        if let Some(state) = gap.as_mut() {
            let mut next = seq + 1;
            while let Some(parked) = state.buffer.remove(&next) {
                if let Some(end) = self.apply(&parked) {
                    return Some(end);
                }
                self.advance_in_seq(next);
                next += 1;
            }
            if state.buffer.is_empty() {
                *gap = None;
            } else {
                // Still holes ahead; rebase the gap window.
                state.expected = next;
                state.since = Instant::now();
                state.resend_sent = false;
            }
        }
        None
    }

    fn advance_in_seq(&self, seq: u64) {
        *self.in_seq.lock() = seq;
        let next_out = self.send_state.lock().next_seq;
        if let Err(e) = self.seq_store.save(next_out, seq) {
            warn!(adapter = %self.shared.id, error = %e, "failed to persist sequence numbers");
        }
    }

    // -------------------------------------------------------------------------
    // Message application
    // -------------------------------------------------------------------------

    fn apply(&self, msg: &FixMessage) -> Option<SessionEnd> {
        match msg.msg_type() {
            Some(msg_type::LOGON) => {
                info!(adapter = %self.shared.id, "fix logon acknowledged");
                let _ = self.logged_in_tx.send(true);
                None
            }
            Some(msg_type::HEARTBEAT) => None,
            Some(msg_type::TEST_REQUEST) => {
                let mut body = Vec::new();
                if let Some(id) = msg.get(tags::TEST_REQ_ID) {
                    body.push((tags::TEST_REQ_ID, id.to_string()));
                }
                if let Err(e) = self.send(msg_type::HEARTBEAT, &body) {
                    return Some(SessionEnd::Transport(e));
                }
                None
            }
            Some(msg_type::RESEND_REQUEST) => {
                // We do not replay application messages; gap-fill the range.
                let next_out = self.send_state.lock().next_seq;
                let body = vec![
                    (tags::GAP_FILL_FLAG, "Y".to_string()),
                    (tags::NEW_SEQ_NO, next_out.to_string()),
                ];
                if let Err(e) = self.send(msg_type::SEQUENCE_RESET, &body) {
                    return Some(SessionEnd::Transport(e));
                }
                None
            }
            Some(msg_type::SEQUENCE_RESET) => {
                // GapFill variant (hard reset handled before sequencing).
                if let Some(new_seq) = msg.get_parsed::<u64>(tags::NEW_SEQ_NO) {
                    debug!(adapter = %self.shared.id, new_seq, "gap fill");
                    *self.in_seq.lock() = new_seq.saturating_sub(1);
                }
                None
            }
            Some(msg_type::REJECT) => {
                warn!(
                    adapter = %self.shared.id,
                    ref_seq = msg.get(tags::REF_SEQ_NUM).unwrap_or("?"),
                    text = msg.get(tags::TEXT).unwrap_or(""),
                    "session-level reject"
                );
                None
            }
            Some(msg_type::LOGOUT) => {
                let text = msg.get(tags::TEXT).unwrap_or("").to_string();
                let lower = text.to_lowercase();
                if !self.is_logged_in() {
                    // Logout instead of a Logon ack: classify the refusal.
                    let err = if lower.contains("seq") && lower.contains("low") {
                        CoreError::SequenceTooLow(text)
                    } else {
                        CoreError::AuthRejected(text)
                    };
                    return Some(SessionEnd::Fatal(err));
                }
                info!(adapter = %self.shared.id, text = %text, "provider logout");
                Some(SessionEnd::Transport(CoreError::ReadError(format!(
                    "provider logout: {text}"
                ))))
            }
            Some(msg_type::MARKET_DATA_SNAPSHOT) => {
                self.apply_md_snapshot(msg);
                None
            }
            Some(msg_type::MARKET_DATA_INCREMENTAL) => {
                self.apply_md_incremental(msg);
                None
            }
            Some(msg_type::MARKET_DATA_REQUEST_REJECT) => {
                let req_id = msg.get(tags::MD_REQ_ID).unwrap_or("?").to_string();
                warn!(
                    adapter = %self.shared.id,
                    md_req_id = %req_id,
                    reason = msg.get(tags::MD_REQ_REJ_REASON).unwrap_or("?"),
                    text = msg.get(tags::TEXT).unwrap_or(""),
                    "market data request rejected, no retry"
                );
                self.md_requests.lock().remove(&req_id);
                self.md_rejected.lock().push(req_id);
                None
            }
            Some(msg_type::EXECUTION_REPORT) => {
                self.apply_execution_report(msg);
                None
            }
            Some(other) => {
                debug!(adapter = %self.shared.id, msg_type = other, "unhandled message type");
                None
            }
            None => {
                warn!(adapter = %self.shared.id, "message without MsgType");
                None
            }
        }
    }

    /// MarketDataSnapshot (35=W): both Bid (269=0) and Offer (269=1) entries
    /// are required; one-sided snapshots are rejected and counted.
    fn apply_md_snapshot(&self, msg: &FixMessage) {
        let symbol = match msg.get(tags::SYMBOL) {
            Some(s) => s.to_string(),
            None => return,
        };

        let mut bid = None;
        let mut ask = None;
        let mut entry_type: Option<&str> = None;
        for (tag, value) in msg.fields_from(tags::NO_MD_ENTRIES) {
            match *tag {
                tags::MD_ENTRY_TYPE => entry_type = Some(value.as_str()),
                tags::MD_ENTRY_PX => {
                    let px: Option<f64> = value.parse().ok();
                    match entry_type {
                        Some("0") => bid = px,
                        Some("1") => ask = px,
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        match (bid, ask) {
            (Some(bid), Some(ask)) => {
                self.book.lock().insert(symbol.clone(), (Some(bid), Some(ask)));
                self.publish(symbol, bid, ask, msg);
            }
            _ => {
                warn!(adapter = %self.shared.id, symbol = %symbol, "one-sided snapshot rejected");
            }
        }
    }

    /// MarketDataIncrementalRefresh (35=X): sides arrive independently; a
    /// quote is published once both sides are known for the symbol.
    fn apply_md_incremental(&self, msg: &FixMessage) {
        let mut symbol: Option<String> = None;
        let mut entry_type: Option<String> = None;

        let mut updates: Vec<(String, &str, f64)> = Vec::new();
        for (tag, value) in msg.fields_from(tags::NO_MD_ENTRIES) {
            match *tag {
                tags::MD_UPDATE_ACTION => {
                    entry_type = None;
                }
                tags::MD_ENTRY_TYPE => entry_type = Some(value.clone()),
                tags::SYMBOL => symbol = Some(value.clone()),
                tags::MD_ENTRY_PX => {
                    if let (Some(sym), Some(et), Ok(px)) =
                        (symbol.clone(), entry_type.as_deref(), value.parse::<f64>())
                    {
                        updates.push((sym, if et == "0" { "bid" } else { "ask" }, px));
                    }
                }
                _ => {}
            }
        }

        for (sym, side, px) in updates {
            let ready = {
                let mut book = self.book.lock();
                let entry = book.entry(sym.clone()).or_insert((None, None));
                if side == "bid" {
                    entry.0 = Some(px);
                } else {
                    entry.1 = Some(px);
                }
                match entry {
                    (Some(bid), Some(ask)) => Some((*bid, *ask)),
                    _ => None,
                }
            };
            if let Some((bid, ask)) = ready {
                self.publish(sym, bid, ask, msg);
            }
        }
    }

    fn publish(&self, symbol: String, bid: f64, ask: f64, msg: &FixMessage) {
        let (now_ms, now_ns) = crate::lp::now_ms_ns();
        let quote = Quote {
            symbol,
            bid,
            ask,
            source: self.shared.id.clone(),
            source_seq: msg.seq_num(),
            source_time_ms: parse_sending_time(msg.get(tags::SENDING_TIME)).unwrap_or(now_ms),
            recv_time_ns: now_ns,
            stale: false,
        };
        if quote.is_well_formed() {
            self.shared.publish_quote(quote);
        }
    }

    fn apply_execution_report(&self, msg: &FixMessage) {
        let cl_ord_id = match msg.get(tags::CL_ORD_ID) {
            Some(id) => id.to_string(),
            None => return,
        };
        let ord_status = msg.get(tags::ORD_STATUS).unwrap_or("");
        let cum_qty: f64 = msg.get_parsed(tags::CUM_QTY).unwrap_or(0.0);
        let avg_px: f64 = msg.get_parsed(tags::AVG_PX).unwrap_or(0.0);

        let mut pending = self.pending_orders.lock();
        let Some(entry) = pending.get_mut(&cl_ord_id) else {
            debug!(adapter = %self.shared.id, cl_ord_id = %cl_ord_id, "execution report for unknown order");
            return;
        };

        // Partial fills accumulate; CumQty is authoritative.
        entry.cum_volume = cum_qty.max(entry.cum_volume);
        if avg_px > 0.0 {
            entry.avg_price = avg_px;
        }

        // 2 = Filled, 8 = Rejected, 4 = Canceled are terminal.
        let terminal = matches!(ord_status, "2" | "8" | "4");
        if !terminal {
            debug!(
                adapter = %self.shared.id,
                cl_ord_id = %cl_ord_id,
                cum_qty = entry.cum_volume,
                "partial execution report"
            );
            return;
        }

        let entry = pending.remove(&cl_ord_id).expect("checked above");
        let side = match msg.get(tags::SIDE) {
            Some("2") => Side::Sell,
            _ => Side::Buy,
        };
        let execution = LpExecution {
            cl_ord_id: cl_ord_id.clone(),
            order_id: msg.get(tags::ORDER_ID).unwrap_or("").to_string(),
            symbol: msg.get(tags::SYMBOL).unwrap_or("").to_string(),
            side,
            filled_volume: entry.cum_volume,
            avg_price: entry.avg_price,
            status: match ord_status {
                "2" => LpExecStatus::Filled,
                "8" => LpExecStatus::Rejected,
                _ => {
                    if entry.cum_volume > 0.0 {
                        LpExecStatus::PartiallyFilled
                    } else {
                        LpExecStatus::Rejected
                    }
                }
            },
            reject_reason: msg.get(tags::TEXT).map(|s| s.to_string()),
        };
        let _ = entry.respond.send(execution);
    }

    /// Fail all in-flight orders, e.g. on disconnect.
    pub fn fail_pending_orders(&self) {
        let mut pending = self.pending_orders.lock();
        for (cl_ord_id, entry) in pending.drain() {
            let _ = entry.respond.send(LpExecution {
                cl_ord_id,
                order_id: String::new(),
                symbol: String::new(),
                side: Side::Buy,
                filled_volume: entry.cum_volume,
                avg_price: entry.avg_price,
                status: LpExecStatus::Rejected,
                reject_reason: Some("session disconnected".into()),
            });
        }
    }
}

struct GapState {
    expected: u64,
    buffer: BTreeMap<u64, FixMessage>,
    since: Instant,
    resend_sent: bool,
}

impl GapState {
    fn new(expected: u64) -> Self {
        Self {
            expected,
            buffer: BTreeMap::new(),
            since: Instant::now(),
            resend_sent: false,
        }
    }

    fn first_buffered(&self) -> u64 {
        self.buffer.keys().next().copied().unwrap_or(self.expected)
    }
}

/// Parse FIX SendingTime ("yyyyMMdd-HH:mm:ss.SSS") into epoch ms.
fn parse_sending_time(value: Option<&str>) -> Option<i64> {
    let value = value?;
    let parsed = chrono::NaiveDateTime::parse_from_str(value, "%Y%m%d-%H:%M:%S%.3f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(value, "%Y%m%d-%H:%M:%S"))
        .ok()?;
    Some(parsed.and_utc().timestamp_millis())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FixSessionConfig;
    use tokio::sync::mpsc;

    fn test_cfg(dir: &std::path::Path) -> FixSessionConfig {
        FixSessionConfig {
            host: "localhost".into(),
            port: 0,
            sender_comp_id: "HELIOS".into(),
            target_comp_id: "LP1".into(),
            heartbeat_secs: 30,
            reset_on_logon: false,
            username: None,
            password: None,
            seq_dir: dir.to_string_lossy().into_owned(),
            gap_timeout_ms: 500,
            max_gap: 2_000,
            logon_timeout_secs: 15,
        }
    }

    fn session(dir: &std::path::Path) -> (Arc<FixSession>, mpsc::Receiver<Quote>) {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::new(AdapterShared::new("lp-fix", tx));
        (Arc::new(FixSession::new(test_cfg(dir), shared)), rx)
    }

    fn incoming(
        session: &Arc<FixSession>,
        seq: u64,
        msg_type_str: &str,
        body: &[(u32, String)],
    ) -> FixMessage {
        let raw = codec::encode(
            msg_type_str,
            seq,
            &session.cfg.target_comp_id,
            &session.cfg.sender_comp_id,
            body,
        );
        codec::parse_message(&raw).unwrap()
    }

    fn snapshot_body(symbol: &str, bid: f64, ask: f64) -> Vec<(u32, String)> {
        vec![
            (tags::MD_REQ_ID, "md-1".to_string()),
            (tags::SYMBOL, symbol.to_string()),
            (tags::NO_MD_ENTRIES, "2".to_string()),
            (tags::MD_ENTRY_TYPE, "0".to_string()),
            (tags::MD_ENTRY_PX, bid.to_string()),
            (tags::MD_ENTRY_TYPE, "1".to_string()),
            (tags::MD_ENTRY_PX, ask.to_string()),
        ]
    }

    #[test]
    fn seq_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeqStore::new(&dir.path().to_string_lossy(), "A", "B");
        assert_eq!(store.load(), (1, 0));
        store.save(42, 17).unwrap();
        assert_eq!(store.load(), (42, 17));
        store.reset().unwrap();
        assert_eq!(store.load(), (1, 0));
    }

    #[tokio::test]
    async fn snapshot_with_both_sides_publishes_quote() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = session(dir.path());
        let mut gap = None;
        let msg = incoming(
            &session,
            1,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.0900, 1.0902),
        );
        assert!(session.handle_sequenced(msg, &mut gap).is_none());
        let quote = rx.try_recv().unwrap();
        assert_eq!(quote.symbol, "EURUSD");
        assert!((quote.bid - 1.0900).abs() < 1e-9);
        assert!((quote.ask - 1.0902).abs() < 1e-9);
        assert_eq!(quote.source_seq, Some(1));
    }

    #[tokio::test]
    async fn one_sided_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = session(dir.path());
        let mut gap = None;
        let body = vec![
            (tags::SYMBOL, "EURUSD".to_string()),
            (tags::NO_MD_ENTRIES, "1".to_string()),
            (tags::MD_ENTRY_TYPE, "0".to_string()),
            (tags::MD_ENTRY_PX, "1.0900".to_string()),
        ];
        let msg = incoming(&session, 1, msg_type::MARKET_DATA_SNAPSHOT, &body);
        assert!(session.handle_sequenced(msg, &mut gap).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gap_parks_messages_and_replay_processes_once() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = session(dir.path());
        let mut gap = None;

        // Seq 1 processes normally.
        let msg = incoming(
            &session,
            1,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.0900, 1.0902),
        );
        session.handle_sequenced(msg, &mut gap);
        assert!(rx.try_recv().is_ok());

        // Seq 5 arrives: parked, nothing published.
        let ahead = incoming(
            &session,
            5,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.0950, 1.0952),
        );
        session.handle_sequenced(ahead, &mut gap);
        assert!(gap.is_some());
        assert!(rx.try_recv().is_err());

        // Replay 2..4 (PossDup), then everything drains through 5.
        for seq in 2..=4 {
            let mut body = snapshot_body("EURUSD", 1.0910 + seq as f64 * 0.001, 1.0912 + seq as f64 * 0.001);
            body.push((tags::POSS_DUP_FLAG, "Y".to_string()));
            let replay = incoming(&session, seq, msg_type::MARKET_DATA_SNAPSHOT, &body);
            session.handle_sequenced(replay, &mut gap);
        }
        assert!(gap.is_none());
        // 2, 3, 4 and the parked 5 all published exactly once.
        let mut published = 0;
        while rx.try_recv().is_ok() {
            published += 1;
        }
        assert_eq!(published, 4);
        assert_eq!(*session.in_seq.lock(), 5);

        // Re-replay of an already processed sequence is dropped.
        let mut body = snapshot_body("EURUSD", 1.2000, 1.2002);
        body.push((tags::POSS_DUP_FLAG, "Y".to_string()));
        let dup = incoming(&session, 3, msg_type::MARKET_DATA_SNAPSHOT, &body);
        assert!(session.handle_sequenced(dup, &mut gap).is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_gap_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _rx) = session(dir.path());
        let mut gap = None;
        let msg = incoming(
            &session,
            5_000,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.0900, 1.0902),
        );
        match session.handle_sequenced(msg, &mut gap) {
            Some(SessionEnd::Fatal(CoreError::SessionFatal(_))) => {}
            other => panic!("expected fatal session end, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lower_sequence_without_poss_dup_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _rx) = session(dir.path());
        let mut gap = None;
        for seq in 1..=3u64 {
            let msg = incoming(
                &session,
                seq,
                msg_type::MARKET_DATA_SNAPSHOT,
                &snapshot_body("EURUSD", 1.09, 1.0902),
            );
            session.handle_sequenced(msg, &mut gap);
        }
        let stale = incoming(
            &session,
            2,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.09, 1.0902),
        );
        assert!(matches!(
            session.handle_sequenced(stale, &mut gap),
            Some(SessionEnd::Fatal(CoreError::SessionFatal(_)))
        ));
    }

    #[tokio::test]
    async fn hard_sequence_reset_realigns() {
        let dir = tempfile::tempdir().unwrap();
        let (session, mut rx) = session(dir.path());
        let mut gap = None;
        let reset = incoming(
            &session,
            999,
            msg_type::SEQUENCE_RESET,
            &[(tags::NEW_SEQ_NO, "50".to_string())],
        );
        session.handle_sequenced(reset, &mut gap);
        assert_eq!(*session.in_seq.lock(), 49);

        let msg = incoming(
            &session,
            50,
            msg_type::MARKET_DATA_SNAPSHOT,
            &snapshot_body("EURUSD", 1.09, 1.0902),
        );
        session.handle_sequenced(msg, &mut gap);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn logout_before_logon_classifies_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _rx) = session(dir.path());
        let mut gap = None;
        let logout = incoming(
            &session,
            1,
            msg_type::LOGOUT,
            &[(tags::TEXT, "invalid credentials".to_string())],
        );
        assert!(matches!(
            session.handle_sequenced(logout, &mut gap),
            Some(SessionEnd::Fatal(CoreError::AuthRejected(_)))
        ));

        let (session, _rx) = self::session(dir.path());
        let mut gap = None;
        let logout = incoming(
            &session,
            1,
            msg_type::LOGOUT,
            &[(tags::TEXT, "MsgSeqNum too low".to_string())],
        );
        assert!(matches!(
            session.handle_sequenced(logout, &mut gap),
            Some(SessionEnd::Fatal(CoreError::SequenceTooLow(_)))
        ));
    }

    #[tokio::test]
    async fn execution_report_partial_then_filled() {
        let dir = tempfile::tempdir().unwrap();
        let (session, _rx) = session(dir.path());

        // Register a pending order without a wire writer.
        let (respond, mut exec_rx) = oneshot::channel();
        session.pending_orders.lock().insert(
            "ord-1".to_string(),
            PendingOrder {
                respond,
                cum_volume: 0.0,
                avg_price: 0.0,
            },
        );

        let partial = incoming(
            &session,
            1,
            msg_type::EXECUTION_REPORT,
            &[
                (tags::CL_ORD_ID, "ord-1".to_string()),
                (tags::ORDER_ID, "X-77".to_string()),
                (tags::SYMBOL, "EURUSD".to_string()),
                (tags::SIDE, "1".to_string()),
                (tags::ORD_STATUS, "1".to_string()), // partially filled
                (tags::CUM_QTY, "0.4".to_string()),
                (tags::AVG_PX, "1.0902".to_string()),
            ],
        );
        let mut gap = None;
        session.handle_sequenced(partial, &mut gap);
        assert!(exec_rx.try_recv().is_err());

        let filled = incoming(
            &session,
            2,
            msg_type::EXECUTION_REPORT,
            &[
                (tags::CL_ORD_ID, "ord-1".to_string()),
                (tags::ORDER_ID, "X-77".to_string()),
                (tags::SYMBOL, "EURUSD".to_string()),
                (tags::SIDE, "1".to_string()),
                (tags::ORD_STATUS, "2".to_string()), // filled
                (tags::CUM_QTY, "1.0".to_string()),
                (tags::AVG_PX, "1.0903".to_string()),
            ],
        );
        session.handle_sequenced(filled, &mut gap);
        let exec = exec_rx.try_recv().unwrap();
        assert_eq!(exec.status, LpExecStatus::Filled);
        assert!((exec.filled_volume - 1.0).abs() < 1e-9);
        assert!((exec.avg_price - 1.0903).abs() < 1e-9);
        assert_eq!(exec.order_id, "X-77");
    }

    #[test]
    fn sending_time_parses() {
        let ms = parse_sending_time(Some("20240105-13:45:30.123")).unwrap();
        assert!(ms > 1_700_000_000_000);
        assert!(parse_sending_time(Some("garbage")).is_none());
    }
}
