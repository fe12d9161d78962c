// =============================================================================
// Order Router — A-Book / B-Book / C-Book policy + net-exposure hedger
// =============================================================================
//
// Routing decision per order: per-account override first (demo accounts are
// always B-Book), then the per-symbol override, then the global mode. C-Book
// consults the account's classification: winners route externally, losers
// stay on the internal book. Classification is pluggable and re-runs on a
// schedule.
//
// The hedger watches the internal book's signed net exposure per symbol and
// sends an offsetting external order once the configured threshold is
// crossed, so B-Book risk stays bounded.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::engine::{Account, EngineHandle, MarketFill, MarketOrderRequest, Position};
use crate::errors::{CoreError, CoreResult};
use crate::lp::{LpAdapter, LpOrder};
use crate::types::{ExecutionMode, Side, TimeInForce};

/// Which book an account's orders belong to under C-Book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookAssignment {
    ABook,
    BBook,
}

/// Pluggable account classifier for C-Book.
pub trait Classifier: Send + Sync {
    fn classify(&self, account: &Account, closed: &[Position]) -> BookAssignment;
}

/// Default classifier: consistent winners are pushed to the external book.
pub struct StatsClassifier {
    /// Win-rate over the recent window that marks a winner.
    pub win_rate_threshold: f64,
    /// Closed trades examined.
    pub window: usize,
    /// Below this many closed trades the account stays B-Book.
    pub min_trades: usize,
    /// Alternative trigger: positive net P&L on at least this much volume.
    pub volume_threshold: f64,
}

impl Default for StatsClassifier {
    fn default() -> Self {
        Self {
            win_rate_threshold: 0.55,
            window: 20,
            min_trades: 10,
            volume_threshold: 5.0,
        }
    }
}

impl Classifier for StatsClassifier {
    fn classify(&self, _account: &Account, closed: &[Position]) -> BookAssignment {
        if closed.len() < self.min_trades {
            return BookAssignment::BBook;
        }
        let window = &closed[closed.len().saturating_sub(self.window)..];
        let wins = window.iter().filter(|p| p.realized_pnl > 0.0).count();
        let win_rate = wins as f64 / window.len() as f64;
        let net_pnl: f64 = window.iter().map(|p| p.realized_pnl).sum();
        let traded: f64 = window.iter().map(|p| p.opened_volume).sum();

        if win_rate >= self.win_rate_threshold
            || (net_pnl > 0.0 && traded >= self.volume_threshold)
        {
            BookAssignment::ABook
        } else {
            BookAssignment::BBook
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct Router {
    cfg: RwLock<RouterConfig>,
    engine: EngineHandle,
    adapters: HashMap<String, Arc<dyn LpAdapter>>,
    classifier: Box<dyn Classifier>,
    classifications: RwLock<HashMap<String, BookAssignment>>,
    /// Net volume already hedged externally, per symbol (signed, broker
    /// perspective).
    hedged: RwLock<HashMap<String, f64>>,
}

impl Router {
    pub fn new(
        cfg: RouterConfig,
        engine: EngineHandle,
        adapters: HashMap<String, Arc<dyn LpAdapter>>,
        classifier: Box<dyn Classifier>,
    ) -> Self {
        Self {
            cfg: RwLock::new(cfg),
            engine,
            adapters,
            classifier,
            classifications: RwLock::new(HashMap::new()),
            hedged: RwLock::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.cfg.read().mode
    }

    /// Admin switch of the global execution mode.
    pub fn set_mode(&self, mode: ExecutionMode) {
        info!(mode = %mode, "execution mode switched");
        self.cfg.write().mode = mode;
    }

    /// Resolve the book for one order.
    fn decide(&self, account: &Account, symbol: &str) -> BookAssignment {
        // Demo accounts never reach a real provider.
        if account.demo {
            return BookAssignment::BBook;
        }
        let cfg = self.cfg.read();
        let mode = cfg
            .symbol_overrides
            .get(symbol)
            .copied()
            .unwrap_or(cfg.mode);
        drop(cfg);
        match mode {
            ExecutionMode::Bbook => BookAssignment::BBook,
            ExecutionMode::Abook => BookAssignment::ABook,
            ExecutionMode::Cbook => self
                .classifications
                .read()
                .get(&account.id)
                .copied()
                .unwrap_or(BookAssignment::BBook),
        }
    }

    fn abook_adapter(&self) -> CoreResult<Arc<dyn LpAdapter>> {
        let id = self
            .cfg
            .read()
            .abook_adapter
            .clone()
            .ok_or_else(|| CoreError::InvalidConfig("no abook_adapter configured".into()))?;
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::InvalidConfig(format!("unknown abook adapter {id}")))
    }

    /// Route a market order according to policy.
    pub async fn place_market(&self, req: MarketOrderRequest) -> CoreResult<MarketFill> {
        let account = self.engine.shared.accounts.require(&req.account_id)?;
        match self.decide(&account, &req.symbol) {
            BookAssignment::BBook => {
                debug!(account = %req.account_id, symbol = %req.symbol, "routed b-book");
                self.engine.market(req).await
            }
            BookAssignment::ABook => {
                debug!(account = %req.account_id, symbol = %req.symbol, "routed a-book");
                let adapter = self.abook_adapter()?;
                let order = LpOrder {
                    cl_ord_id: Uuid::new_v4().to_string(),
                    symbol: req.symbol.clone(),
                    side: req.side,
                    volume: req.volume,
                    limit_price: None,
                    tif: TimeInForce::Ioc,
                };
                let exec = adapter.place(order).await?;
                if exec.filled_volume <= 0.0 {
                    return Err(CoreError::NoLiquidity(req.symbol));
                }
                // Mirror the external fill for bookkeeping.
                self.engine
                    .mirror_fill(
                        &req.account_id,
                        &req.symbol,
                        req.side,
                        exec.filled_volume,
                        exec.avg_price,
                        &exec.order_id,
                        req.stop_loss,
                        req.take_profit,
                    )
                    .await
            }
        }
    }

    // -------------------------------------------------------------------------
    // C-Book reclassification
    // -------------------------------------------------------------------------

    /// Re-run the classifier over every account.
    pub fn reclassify(&self) {
        let accounts = self.engine.shared.accounts.all();
        let mut out = HashMap::new();
        for account in &accounts {
            let closed = self.engine.shared.closed_for(&account.id, 500);
            let assignment = self.classifier.classify(account, &closed);
            if assignment == BookAssignment::ABook {
                debug!(account = %account.id, "classified a-book");
            }
            out.insert(account.id.clone(), assignment);
        }
        let winners = out
            .values()
            .filter(|a| **a == BookAssignment::ABook)
            .count();
        info!(accounts = accounts.len(), winners, "reclassification complete");
        *self.classifications.write() = out;
    }

    /// Periodic reclassification loop.
    pub async fn run_reclassifier(self: Arc<Self>) {
        let interval_secs = self.cfg.read().reclassify_interval_secs;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.tick().await; // immediate first pass
        loop {
            self.reclassify();
            ticker.tick().await;
        }
    }

    // -------------------------------------------------------------------------
    // Net-exposure hedger
    // -------------------------------------------------------------------------

    /// Signed client net exposure per symbol (positive = clients are net
    /// long against the book).
    pub fn net_exposure(&self) -> HashMap<String, f64> {
        let positions = self.engine.shared.positions.read();
        let mut net: HashMap<String, f64> = HashMap::new();
        for pos in positions.values() {
            // Mirrored A-Book positions are already hedged externally.
            if pos.hedge_ticket.is_some() {
                continue;
            }
            *net.entry(pos.symbol.clone()).or_insert(0.0) += pos.side.sign() * pos.volume;
        }
        net
    }

    /// One hedging pass: for every symbol whose unhedged residual exceeds
    /// the threshold, send an offsetting external order.
    pub async fn hedge_once(&self) {
        let adapter = match self.abook_adapter() {
            Ok(a) => a,
            Err(_) => return, // hedging disabled without an external venue
        };
        let exposures = self.net_exposure();
        let (default_threshold, overrides) = {
            let cfg = self.cfg.read();
            (cfg.hedge_threshold_lots, cfg.hedge_thresholds.clone())
        };

        for (symbol, client_net) in exposures {
            let threshold = overrides.get(&symbol).copied().unwrap_or(default_threshold);
            let hedged = self.hedged.read().get(&symbol).copied().unwrap_or(0.0);
            // Target hedge is the negation of the client net; the residual is
            // what is still uncovered.
            let residual = -client_net - hedged;
            if residual.abs() < threshold {
                continue;
            }
            let side = if residual > 0.0 { Side::Buy } else { Side::Sell };
            let volume = residual.abs();
            info!(symbol = %symbol, client_net, hedged, volume, side = %side, "hedging net exposure");
            let order = LpOrder {
                cl_ord_id: format!("hedge-{}", Uuid::new_v4().simple()),
                symbol: symbol.clone(),
                side,
                volume,
                limit_price: None,
                tif: TimeInForce::Ioc,
            };
            match adapter.place(order).await {
                Ok(exec) => {
                    let signed = side.sign() * exec.filled_volume;
                    *self.hedged.write().entry(symbol).or_insert(0.0) += signed;
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, kind = e.kind(), "hedge order failed");
                }
            }
        }
    }

    /// Periodic hedging loop.
    pub async fn run_hedger(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.hedge_once().await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PositionStatus};
    use crate::types::MarginMode;

    fn closed_position(realized: f64, commission: f64) -> Position {
        Position {
            id: Uuid::new_v4().to_string(),
            account_id: "acc-1".into(),
            symbol: "EURUSD".into(),
            side: Side::Buy,
            volume: 0.0,
            opened_volume: 0.1,
            open_price: 1.09,
            current_price: 1.09,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
            commission,
            swap: 0.0,
            open_time_ms: 0,
            last_update_ms: 0,
            status: PositionStatus::Closed,
            hedge_ticket: None,
            last_eval_price: 1.09,
            close_price: Some(1.09),
            close_time_ms: Some(1),
            close_reason: Some("manual".into()),
            realized_pnl: realized,
            slipped: false,
        }
    }

    fn account(demo: bool) -> Account {
        Account {
            id: "acc-1".into(),
            currency: "USD".into(),
            balance: 10_000.0,
            leverage: 100.0,
            margin_mode: MarginMode::Hedging,
            status: crate::engine::AccountStatus::Open,
            demo,
        }
    }

    #[test]
    fn classifier_needs_history() {
        let classifier = StatsClassifier::default();
        let closed: Vec<Position> = (0..5).map(|_| closed_position(10.0, 0.5)).collect();
        assert_eq!(
            classifier.classify(&account(false), &closed),
            BookAssignment::BBook
        );
    }

    #[test]
    fn classifier_flags_winners() {
        let classifier = StatsClassifier::default();
        // 12 wins out of 15: win rate 0.8.
        let mut closed: Vec<Position> = (0..12).map(|_| closed_position(25.0, 0.5)).collect();
        closed.extend((0..3).map(|_| closed_position(-10.0, 0.5)));
        assert_eq!(
            classifier.classify(&account(false), &closed),
            BookAssignment::ABook
        );
    }

    #[test]
    fn classifier_keeps_losers_internal() {
        let classifier = StatsClassifier::default();
        let mut closed: Vec<Position> = (0..4).map(|_| closed_position(10.0, 0.5)).collect();
        closed.extend((0..11).map(|_| closed_position(-15.0, 0.5)));
        assert_eq!(
            classifier.classify(&account(false), &closed),
            BookAssignment::BBook
        );
    }
}
