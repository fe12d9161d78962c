// =============================================================================
// Position model — open trades, pip P&L, close records
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::symbols::SymbolSpec;
use crate::types::Side;

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    /// Partially closed; remaining volume still open.
    Partial,
    Closed,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::Partial => write!(f, "PARTIAL"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A single tracked position. Mutated only by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    /// Remaining open volume in lots.
    pub volume: f64,
    /// Cumulative volume ever opened into this position; unchanged by
    /// closes, so history keeps the traded size after `volume` reaches 0.
    #[serde(default)]
    pub opened_volume: f64,
    pub open_price: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    /// Commission charged at open (already in the ledger).
    pub commission: f64,
    /// Swap accrued so far (already in the ledger).
    #[serde(default)]
    pub swap: f64,
    pub open_time_ms: i64,
    pub last_update_ms: i64,
    pub status: PositionStatus,
    /// External ticket when the fill was mirrored from an A-Book execution.
    #[serde(default)]
    pub hedge_ticket: Option<String>,
    /// Close-side evaluation price from the previous tick; seeds the
    /// gap-detection for SL/TP fills.
    #[serde(default)]
    pub last_eval_price: f64,
    // -- set on close ------------------------------------------------------
    #[serde(default)]
    pub close_price: Option<f64>,
    #[serde(default)]
    pub close_time_ms: Option<i64>,
    #[serde(default)]
    pub close_reason: Option<String>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub slipped: bool,
}

impl Position {
    /// The side of the book this position closes against.
    pub fn close_price_from(&self, bid: f64, ask: f64) -> f64 {
        match self.side {
            Side::Buy => bid,
            Side::Sell => ask,
        }
    }

    /// Unrealized P&L at `close_price` for `volume` lots:
    ///   BUY:  (price − open) / pip × pip_value × volume
    ///   SELL: (open − price) / pip × pip_value × volume
    pub fn pnl_at(&self, spec: &SymbolSpec, close_price: f64, volume: f64) -> f64 {
        let delta = match self.side {
            Side::Buy => close_price - self.open_price,
            Side::Sell => self.open_price - close_price,
        };
        delta / spec.pip_size * spec.pip_value * volume
    }

    /// Refresh `current_price` / `unrealized_pnl` from a tick.
    pub fn mark(&mut self, spec: &SymbolSpec, bid: f64, ask: f64, now_ms: i64) {
        let price = self.close_price_from(bid, ask);
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(spec, price, self.volume);
        self.last_update_ms = now_ms;
    }

    /// Margin this position consumes:
    ///   volume × contract × price / leverage × margin_rate
    pub fn used_margin(&self, spec: &SymbolSpec, leverage: f64) -> f64 {
        if leverage <= 0.0 {
            return 0.0;
        }
        self.volume * spec.contract_size * self.open_price / leverage * spec.margin_rate
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::SymbolRegistry;

    fn position(side: Side, open: f64, volume: f64) -> Position {
        Position {
            id: "p1".into(),
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            side,
            volume,
            opened_volume: volume,
            open_price: open,
            current_price: open,
            unrealized_pnl: 0.0,
            stop_loss: None,
            take_profit: None,
            commission: 0.0,
            swap: 0.0,
            open_time_ms: 0,
            last_update_ms: 0,
            status: PositionStatus::Open,
            hedge_ticket: None,
            last_eval_price: open,
            close_price: None,
            close_time_ms: None,
            close_reason: None,
            realized_pnl: 0.0,
            slipped: false,
        }
    }

    #[test]
    fn buy_pnl_formula() {
        let registry = SymbolRegistry::builtin();
        let spec = registry.get("EURUSD").unwrap();
        let pos = position(Side::Buy, 1.0902, 0.10);
        // (1.0950 − 1.0902) / 0.0001 × 10 × 0.10 = 48.00
        let pnl = pos.pnl_at(spec, 1.0950, pos.volume);
        assert!((pnl - 48.0).abs() < 1e-6);
    }

    #[test]
    fn sell_pnl_formula() {
        let registry = SymbolRegistry::builtin();
        let spec = registry.get("EURUSD").unwrap();
        let pos = position(Side::Sell, 1.0950, 0.10);
        let pnl = pos.pnl_at(spec, 1.0902, pos.volume);
        assert!((pnl - 48.0).abs() < 1e-6);
    }

    #[test]
    fn pnl_at_open_price_is_zero() {
        let registry = SymbolRegistry::builtin();
        let spec = registry.get("EURUSD").unwrap();
        let pos = position(Side::Buy, 1.0902, 1.0);
        assert!(pos.pnl_at(spec, 1.0902, 1.0).abs() < 1e-9);
    }

    #[test]
    fn close_side_of_book() {
        let long = position(Side::Buy, 1.09, 0.1);
        let short = position(Side::Sell, 1.09, 0.1);
        assert!((long.close_price_from(1.0950, 1.0952) - 1.0950).abs() < 1e-9);
        assert!((short.close_price_from(1.0950, 1.0952) - 1.0952).abs() < 1e-9);
    }

    #[test]
    fn used_margin_formula() {
        let registry = SymbolRegistry::builtin();
        let spec = registry.get("EURUSD").unwrap();
        let pos = position(Side::Buy, 1.0902, 0.10);
        // 0.10 × 100000 × 1.0902 / 100 × 1.0 = 109.02
        let margin = pos.used_margin(spec, 100.0);
        assert!((margin - 109.02).abs() < 1e-6);
    }

    #[test]
    fn mark_updates_unrealized() {
        let registry = SymbolRegistry::builtin();
        let spec = registry.get("EURUSD").unwrap();
        let mut pos = position(Side::Buy, 1.0902, 0.10);
        pos.mark(spec, 1.0950, 1.0952, 123);
        assert!((pos.unrealized_pnl - 48.0).abs() < 1e-6);
        assert_eq!(pos.last_update_ms, 123);
    }
}
