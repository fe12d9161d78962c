// =============================================================================
// Quote Aggregator — per-symbol best bid / best ask across sources
// =============================================================================
//
// Runs as a single task over its per-symbol state, which keeps tick
// sequencing correct without fine-grained locking. For every accepted quote
// the best bid is the maximum over healthy, non-stale sources and the best
// ask the minimum; ties break by configured source priority, then by older
// receive timestamp (a stable feed beats a flapping one).
//
// Publication order per tick: tick store append, engine SL/TP reaction,
// OHLC bucketing, then distributor fan-out — so a client triggering on a
// tick sees the fill no later than the tick itself.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::distributor::Distributor;
use crate::engine::EngineHandle;
use crate::ohlc::OhlcAggregator;
use crate::symbols::SymbolRegistry;
use crate::tick_store::TickStore;
use crate::types::{Quote, Tick};

// ---------------------------------------------------------------------------
// Shared counters (read by /health)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct AggregatorStats {
    pub quotes_seen: AtomicU64,
    pub outliers_dropped: AtomicU64,
    pub gaps_detected: AtomicU64,
    pub ticks_published: AtomicU64,
    /// Milliseconds since epoch of the last published tick.
    pub last_tick_ms: AtomicU64,
    /// Symbols currently without any healthy source.
    pub no_quote: RwLock<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorSnapshot {
    pub quotes_seen: u64,
    pub outliers_dropped: u64,
    pub gaps_detected: u64,
    pub ticks_published: u64,
    pub last_tick_ms: u64,
    pub no_quote_symbols: Vec<String>,
}

impl AggregatorStats {
    pub fn snapshot(&self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            quotes_seen: self.quotes_seen.load(Ordering::Relaxed),
            outliers_dropped: self.outliers_dropped.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            ticks_published: self.ticks_published.load(Ordering::Relaxed),
            last_tick_ms: self.last_tick_ms.load(Ordering::Relaxed),
            no_quote_symbols: self.no_quote.read().clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Core state machine
// ---------------------------------------------------------------------------

struct SourceQuote {
    bid: f64,
    ask: f64,
    recv_time_ns: i64,
    last_seen: Instant,
    priority: u32,
}

struct SymbolBook {
    sources: HashMap<String, SourceQuote>,
    last_source_seq: HashMap<String, u64>,
    /// Last published best (bid, ask); None before the first tick.
    published: Option<(f64, f64)>,
    last_mid: Option<f64>,
    seq: u64,
    last_ts_ms: i64,
    no_quote: bool,
}

impl SymbolBook {
    fn new() -> Self {
        Self {
            sources: HashMap::new(),
            last_source_seq: HashMap::new(),
            published: None,
            last_mid: None,
            seq: 0,
            last_ts_ms: 0,
            no_quote: false,
        }
    }
}

/// The selection core, synchronous and directly testable. The async task in
/// [`run_aggregator`] wires it to channels and downstream consumers.
pub struct AggregatorCore {
    cfg: AggregatorConfig,
    registry: Arc<SymbolRegistry>,
    /// Adapter id -> priority; lower wins ties.
    priorities: HashMap<String, u32>,
    books: HashMap<String, SymbolBook>,
    pub stats: Arc<AggregatorStats>,
}

impl AggregatorCore {
    pub fn new(
        cfg: AggregatorConfig,
        registry: Arc<SymbolRegistry>,
        priorities: HashMap<String, u32>,
    ) -> Self {
        Self {
            cfg,
            registry,
            priorities,
            books: HashMap::new(),
            stats: Arc::new(AggregatorStats::default()),
        }
    }

    /// Validate and absorb one quote; returns a tick when the best changed.
    pub fn process_quote(&mut self, quote: Quote, now_ms: i64) -> Option<Tick> {
        self.stats.quotes_seen.fetch_add(1, Ordering::Relaxed);

        let Ok(spec) = self.registry.require(&quote.symbol) else {
            self.stats.outliers_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %quote.symbol, source = %quote.source, "quote for unknown symbol dropped");
            return None;
        };
        let pip_size = spec.pip_size;
        let max_spread = self.cfg.max_spread_pips * pip_size;
        let sanity = self.cfg.sanity_band_pct / 100.0;
        let min_change = self.cfg.min_change_pips * pip_size;

        if !quote.is_well_formed() || quote.stale {
            self.stats.outliers_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if quote.ask - quote.bid > max_spread {
            self.stats.outliers_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(symbol = %quote.symbol, source = %quote.source, spread = quote.ask - quote.bid, "spread over cap, dropped");
            return None;
        }

        let book = self
            .books
            .entry(quote.symbol.clone())
            .or_insert_with(SymbolBook::new);

        // Sanity band vs the last published mid.
        let mid = (quote.bid + quote.ask) / 2.0;
        if let Some(last_mid) = book.last_mid {
            if last_mid > 0.0 && ((mid - last_mid) / last_mid).abs() > sanity {
                self.stats.outliers_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %quote.symbol,
                    source = %quote.source,
                    mid,
                    last_mid,
                    "quote outside sanity band, dropped"
                );
                return None;
            }
        }

        // Source sequence gap detection: the gap is logged and counted; the
        // owning adapter recovers on its own (FIX resend).
        if let Some(seq) = quote.source_seq {
            if let Some(prev) = book.last_source_seq.get(&quote.source) {
                if seq > prev + 1 {
                    self.stats.gaps_detected.fetch_add(1, Ordering::Relaxed);
                    info!(
                        symbol = %quote.symbol,
                        source = %quote.source,
                        from = prev,
                        to = seq,
                        "source sequence gap"
                    );
                }
            }
            book.last_source_seq.insert(quote.source.clone(), seq);
        }

        let priority = self
            .priorities
            .get(&quote.source)
            .copied()
            .unwrap_or(u32::MAX);
        book.sources.insert(
            quote.source.clone(),
            SourceQuote {
                bid: quote.bid,
                ask: quote.ask,
                recv_time_ns: quote.recv_time_ns,
                last_seen: Instant::now(),
                priority,
            },
        );

        Self::recompute(
            &self.stats,
            &quote.symbol,
            book,
            self.cfg.staleness_ms,
            min_change,
            now_ms,
        )
    }

    /// Periodic staleness sweep: sources that went silent are excluded and
    /// the best recomputed immediately (failover). Returns ticks to publish.
    pub fn sweep(&mut self, now_ms: i64) -> Vec<Tick> {
        let mut out = Vec::new();
        for (symbol, book) in self.books.iter_mut() {
            let min_change = self
                .registry
                .get(symbol)
                .map(|s| self.cfg.min_change_pips * s.pip_size)
                .unwrap_or(0.0);
            if let Some(tick) = Self::recompute(
                &self.stats,
                symbol,
                book,
                self.cfg.staleness_ms,
                min_change,
                now_ms,
            ) {
                out.push(tick);
            }
        }
        out
    }

    fn recompute(
        stats: &Arc<AggregatorStats>,
        symbol: &str,
        book: &mut SymbolBook,
        staleness_ms: u64,
        min_change: f64,
        now_ms: i64,
    ) -> Option<Tick> {
        let staleness = Duration::from_millis(staleness_ms);

        let mut best_bid: Option<(&String, &SourceQuote)> = None;
        let mut best_ask: Option<(&String, &SourceQuote)> = None;
        for (id, src) in &book.sources {
            if src.last_seen.elapsed() > staleness {
                continue;
            }
            best_bid = Some(match best_bid {
                None => (id, src),
                Some(cur) => {
                    if better(src.bid, cur.1.bid, src, cur.1, true) {
                        (id, src)
                    } else {
                        cur
                    }
                }
            });
            best_ask = Some(match best_ask {
                None => (id, src),
                Some(cur) => {
                    if better(src.ask, cur.1.ask, src, cur.1, false) {
                        (id, src)
                    } else {
                        cur
                    }
                }
            });
        }

        let (Some((bid_src, bid_quote)), Some((ask_src, ask_quote))) = (best_bid, best_ask) else {
            if !book.no_quote {
                book.no_quote = true;
                warn!(symbol = %symbol, "no healthy source, symbol marked no-quote");
                let mut list = stats.no_quote.write();
                if !list.iter().any(|s| s == symbol) {
                    list.push(symbol.to_string());
                }
            }
            return None;
        };

        if book.no_quote {
            book.no_quote = false;
            info!(symbol = %symbol, "quotes restored");
            stats.no_quote.write().retain(|s| s != symbol);
        }

        // A crossed top across sources (bid over another source's ask) would
        // violate the bid <= ask contract; fall back to the best-bid
        // source's own book until the sources agree again.
        let (bid, ask, crossed) = if bid_quote.bid > ask_quote.ask + 1e-12 {
            debug!(symbol = %symbol, bid_src = %bid_src, ask_src = %ask_src, "crossed sources");
            (bid_quote.bid, bid_quote.ask, true)
        } else {
            (bid_quote.bid, ask_quote.ask, false)
        };

        // Publish only when the top moved by at least min_change (default 0:
        // any change).
        if let Some((prev_bid, prev_ask)) = book.published {
            let bid_moved = (bid - prev_bid).abs();
            let ask_moved = (ask - prev_ask).abs();
            if bid_moved < min_change.max(f64::EPSILON) && ask_moved < min_change.max(f64::EPSILON)
            {
                return None;
            }
        }

        book.seq += 1;
        // Clamp: monotonic non-decreasing timestamps per symbol.
        let ts = now_ms.max(book.last_ts_ms + 1);
        book.last_ts_ms = ts;
        book.published = Some((bid, ask));
        book.last_mid = Some((bid + ask) / 2.0);

        let mut sources = vec![bid_src.clone()];
        if !crossed && ask_src != bid_src {
            sources.push(ask_src.clone());
        }

        stats.ticks_published.fetch_add(1, Ordering::Relaxed);
        stats.last_tick_ms.store(ts.max(0) as u64, Ordering::Relaxed);

        Some(Tick {
            symbol: symbol.to_string(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ms: ts,
            sources,
            seq: book.seq,
        })
    }

    /// Whether a symbol currently has no healthy source.
    pub fn is_no_quote(&self, symbol: &str) -> bool {
        self.books.get(symbol).map(|b| b.no_quote).unwrap_or(true)
    }
}

/// Price comparison with priority and age tie-breaks. `want_high` selects
/// max (bids) vs min (asks).
fn better(candidate: f64, current: f64, cand_src: &SourceQuote, cur_src: &SourceQuote, want_high: bool) -> bool {
    let eps = 1e-12;
    let diff = candidate - current;
    if diff.abs() > eps {
        return if want_high { diff > 0.0 } else { diff < 0.0 };
    }
    // Equal price: lower priority number wins, then the older receive stamp.
    if cand_src.priority != cur_src.priority {
        return cand_src.priority < cur_src.priority;
    }
    cand_src.recv_time_ns < cur_src.recv_time_ns
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// How often the staleness sweep runs.
const SWEEP_INTERVAL_MS: u64 = 500;

/// Drive the aggregator until the quote channel closes. Each published tick
/// flows through store -> engine -> OHLC -> distributor, in that order.
pub async fn run_aggregator(
    mut core: AggregatorCore,
    mut quote_rx: mpsc::Receiver<Quote>,
    tick_store: Arc<TickStore>,
    engine: EngineHandle,
    ohlc: Arc<OhlcAggregator>,
    distributor: Arc<Distributor>,
) {
    info!("aggregator started");
    let mut sweep = tokio::time::interval(Duration::from_millis(SWEEP_INTERVAL_MS));

    loop {
        tokio::select! {
            quote = quote_rx.recv() => {
                match quote {
                    Some(quote) => {
                        let now_ms = chrono::Utc::now().timestamp_millis();
                        if let Some(tick) = core.process_quote(quote, now_ms) {
                            publish(&tick, &tick_store, &engine, &ohlc, &distributor).await;
                        }
                    }
                    None => {
                        info!("quote channel closed, aggregator stopping");
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                for tick in core.sweep(now_ms) {
                    publish(&tick, &tick_store, &engine, &ohlc, &distributor).await;
                }
            }
        }
    }
}

async fn publish(
    tick: &Tick,
    tick_store: &Arc<TickStore>,
    engine: &EngineHandle,
    ohlc: &Arc<OhlcAggregator>,
    distributor: &Arc<Distributor>,
) {
    tick_store.append(tick.clone());
    // Engine reaction (SL/TP, pending triggers) completes before fan-out.
    engine.apply_tick(tick.clone()).await;
    for bar in ohlc.on_tick(tick) {
        distributor.publish_bar(&bar);
    }
    distributor.publish_tick(tick);
}
