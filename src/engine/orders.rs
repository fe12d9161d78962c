// =============================================================================
// Pending orders — limit / stop / stop-limit / trailing-stop triggers
// =============================================================================
//
// Trigger rules, evaluated on every tick:
//   limit:         BUY fills when ask <= limit; SELL when bid >= limit
//   stop:          BUY fills when ask >= trigger; SELL when bid <= trigger
//   stop_limit:    converts to a resting limit once the stop side trips
//   trailing_stop: the trigger follows favorable movement at a fixed
//                  distance and never loosens
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::{OrderType, Side, TimeInForce};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Expired,
    Rejected,
}

/// A resting order owned by the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub volume: f64,
    #[serde(default)]
    pub limit_price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    /// Trailing distance in price units (trailing-stop orders only).
    #[serde(default)]
    pub trail_distance: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub tif: TimeInForce,
    pub status: OrderStatus,
    pub created_ms: i64,
    /// Stop-limit whose stop side already tripped; now resting as a limit.
    #[serde(default)]
    pub armed: bool,
}

/// What a trigger evaluation decided.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerAction {
    /// Fill now at this price.
    Fill(f64),
    /// Stop-limit tripped: keep resting as a limit.
    Arm,
}

impl PendingOrder {
    /// Evaluate against the current top of book. May mutate trailing state.
    pub fn evaluate(&mut self, bid: f64, ask: f64) -> Option<TriggerAction> {
        match self.order_type {
            OrderType::Limit => self.eval_limit(bid, ask),
            OrderType::Stop => self.eval_stop(bid, ask),
            OrderType::StopLimit => {
                if self.armed {
                    self.eval_limit(bid, ask)
                } else if self.stop_tripped(bid, ask) {
                    self.armed = true;
                    // The freshly armed limit may already be marketable.
                    match self.eval_limit(bid, ask) {
                        Some(action) => Some(action),
                        None => Some(TriggerAction::Arm),
                    }
                } else {
                    None
                }
            }
            OrderType::TrailingStop => {
                self.trail(bid, ask);
                self.eval_stop(bid, ask)
            }
            OrderType::Market => None,
        }
    }

    fn eval_limit(&self, bid: f64, ask: f64) -> Option<TriggerAction> {
        let limit = self.limit_price?;
        match self.side {
            Side::Buy if ask <= limit => Some(TriggerAction::Fill(ask)),
            Side::Sell if bid >= limit => Some(TriggerAction::Fill(bid)),
            _ => None,
        }
    }

    fn stop_tripped(&self, bid: f64, ask: f64) -> bool {
        let Some(trigger) = self.stop_price else {
            return false;
        };
        match self.side {
            Side::Buy => ask >= trigger,
            Side::Sell => bid <= trigger,
        }
    }

    fn eval_stop(&self, bid: f64, ask: f64) -> Option<TriggerAction> {
        if !self.stop_tripped(bid, ask) {
            return None;
        }
        Some(TriggerAction::Fill(match self.side {
            Side::Buy => ask,
            Side::Sell => bid,
        }))
    }

    /// Ratchet the trailing trigger with favorable movement; never loosens.
    fn trail(&mut self, bid: f64, ask: f64) {
        let Some(distance) = self.trail_distance else {
            return;
        };
        match self.side {
            // A BUY trailing stop chases the market down.
            Side::Buy => {
                let candidate = ask + distance;
                match self.stop_price {
                    Some(current) if candidate >= current => {}
                    _ => self.stop_price = Some(candidate),
                }
            }
            // A SELL trailing stop chases the market up.
            Side::Sell => {
                let candidate = bid - distance;
                match self.stop_price {
                    Some(current) if candidate <= current => {}
                    _ => self.stop_price = Some(candidate),
                }
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

    fn order(order_type: OrderType, side: Side) -> PendingOrder {
        PendingOrder {
            id: "o1".into(),
            account_id: "acc".into(),
            symbol: "EURUSD".into(),
            order_type,
            side,
            volume: 0.1,
            limit_price: None,
            stop_price: None,
            trail_distance: None,
            stop_loss: None,
            take_profit: None,
            tif: TimeInForce::Gtc,
            status: OrderStatus::Pending,
            created_ms: 0,
            armed: false,
        }
    }

    #[test]
    fn buy_limit_fills_when_ask_reaches_limit() {
        let mut o = order(OrderType::Limit, Side::Buy);
        o.limit_price = Some(1.0900);
        assert_eq!(o.evaluate(1.0903, 1.0905), None);
        assert_eq!(o.evaluate(1.0898, 1.0900), Some(TriggerAction::Fill(1.0900)));
        assert_eq!(o.evaluate(1.0890, 1.0892), Some(TriggerAction::Fill(1.0892)));
    }

    #[test]
    fn sell_limit_fills_when_bid_reaches_limit() {
        let mut o = order(OrderType::Limit, Side::Sell);
        o.limit_price = Some(1.0950);
        assert_eq!(o.evaluate(1.0948, 1.0950), None);
        assert_eq!(o.evaluate(1.0950, 1.0952), Some(TriggerAction::Fill(1.0950)));
    }

    #[test]
    fn buy_stop_fills_when_ask_reaches_trigger() {
        let mut o = order(OrderType::Stop, Side::Buy);
        o.stop_price = Some(1.0950);
        assert_eq!(o.evaluate(1.0940, 1.0942), None);
        assert_eq!(o.evaluate(1.0949, 1.0951), Some(TriggerAction::Fill(1.0951)));
    }

    #[test]
    fn sell_stop_fills_when_bid_reaches_trigger() {
        let mut o = order(OrderType::Stop, Side::Sell);
        o.stop_price = Some(1.0880);
        assert_eq!(o.evaluate(1.0890, 1.0892), None);
        assert_eq!(o.evaluate(1.0879, 1.0881), Some(TriggerAction::Fill(1.0879)));
    }

    #[test]
    fn stop_limit_arms_then_rests_as_limit() {
        let mut o = order(OrderType::StopLimit, Side::Buy);
        o.stop_price = Some(1.0950);
        o.limit_price = Some(1.0952);
        // Below the stop: nothing.
        assert_eq!(o.evaluate(1.0940, 1.0942), None);
        assert!(!o.armed);
        // Stop trips, ask over the limit: arm and rest.
        assert_eq!(o.evaluate(1.0953, 1.0955), Some(TriggerAction::Arm));
        assert!(o.armed);
        // Market comes back within the limit: fill.
        assert_eq!(o.evaluate(1.0949, 1.0951), Some(TriggerAction::Fill(1.0951)));
    }

    #[test]
    fn stop_limit_fills_immediately_when_marketable_on_arm() {
        let mut o = order(OrderType::StopLimit, Side::Buy);
        o.stop_price = Some(1.0950);
        o.limit_price = Some(1.0960);
        // Stop trips and the ask is already inside the limit.
        assert_eq!(o.evaluate(1.0950, 1.0952), Some(TriggerAction::Fill(1.0952)));
    }

    #[test]
    fn trailing_stop_ratchets_and_never_loosens() {
        let mut o = order(OrderType::TrailingStop, Side::Buy);
        o.trail_distance = Some(0.0010);
        // First tick seeds the trigger at ask + distance.
        assert_eq!(o.evaluate(1.0900, 1.0902), None);
        assert!((o.stop_price.unwrap() - 1.0912).abs() < 1e-9);
        // Market falls: trigger tightens.
        assert_eq!(o.evaluate(1.0890, 1.0892), None);
        assert!((o.stop_price.unwrap() - 1.0902).abs() < 1e-9);
        // Market rises: trigger must not loosen, and it trips.
        let action = o.evaluate(1.0901, 1.0903);
        assert_eq!(action, Some(TriggerAction::Fill(1.0903)));
        assert!((o.stop_price.unwrap() - 1.0902).abs() < 1e-9);
    }

    #[test]
    fn sell_trailing_stop_chases_up() {
        let mut o = order(OrderType::TrailingStop, Side::Sell);
        o.trail_distance = Some(0.0010);
        o.evaluate(1.0900, 1.0902);
        assert!((o.stop_price.unwrap() - 1.0890).abs() < 1e-9);
        o.evaluate(1.0920, 1.0922);
        assert!((o.stop_price.unwrap() - 1.0910).abs() < 1e-9);
        let action = o.evaluate(1.0909, 1.0911);
        assert_eq!(action, Some(TriggerAction::Fill(1.0909)));
    }
}
