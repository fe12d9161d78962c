// =============================================================================
// Shared types used across the Helios broker backend
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// The opposite direction.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for BUY, -1.0 for SELL.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Pending / market order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MARKET"),
            Self::Limit => write!(f, "LIMIT"),
            Self::Stop => write!(f, "STOP"),
            Self::StopLimit => write!(f, "STOP_LIMIT"),
            Self::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// Time-in-force for pending orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good-till-cancelled.
    Gtc,
    /// Immediate-or-cancel: fill what is possible now, cancel the rest.
    Ioc,
    /// Fill-or-kill: all or nothing.
    Fok,
    /// Expires at the end of the trading day.
    Day,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
            Self::Day => write!(f, "DAY"),
        }
    }
}

/// Where client orders are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    /// Route to the external liquidity provider.
    Abook,
    /// Execute against the internal book.
    Bbook,
    /// Classify per account: winners go A-Book, losers B-Book.
    Cbook,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Bbook
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Abook => write!(f, "ABOOK"),
            Self::Bbook => write!(f, "BBOOK"),
            Self::Cbook => write!(f, "CBOOK"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ABOOK" => Ok(Self::Abook),
            "BBOOK" => Ok(Self::Bbook),
            "CBOOK" => Ok(Self::Cbook),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// How opposing trades on the same symbol interact within one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginMode {
    /// Multiple positions per symbol, including opposing sides.
    Hedging,
    /// A single net position per symbol (VWAP open price).
    Netting,
}

impl Default for MarginMode {
    fn default() -> Self {
        Self::Hedging
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hedging => write!(f, "HEDGING"),
            Self::Netting => write!(f, "NETTING"),
        }
    }
}

// ---------------------------------------------------------------------------
// Quote & Tick
// ---------------------------------------------------------------------------

/// A normalized quote as produced by an LP adapter. Ephemeral — passed by
/// value through channels, never persisted raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    /// Adapter id that produced this quote.
    pub source: String,
    /// Source-side monotonic sequence, when the provider supplies one.
    #[serde(default)]
    pub source_seq: Option<u64>,
    /// Provider timestamp, milliseconds since epoch.
    pub source_time_ms: i64,
    /// Local receive timestamp, nanoseconds since epoch.
    pub recv_time_ns: i64,
    /// Provider flagged the quote as indicative / stale.
    #[serde(default)]
    pub stale: bool,
}

impl Quote {
    /// Basic shape check: positive prices and a non-crossed market.
    pub fn is_well_formed(&self) -> bool {
        self.bid > 0.0 && self.ask > 0.0 && self.bid <= self.ask
    }
}

/// The authoritative aggregated tick for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub spread: f64,
    /// Milliseconds since epoch, clamped monotonic per symbol.
    pub timestamp_ms: i64,
    /// Adapter ids that contributed the best bid / best ask.
    pub sources: Vec<String>,
    /// Per-symbol strictly increasing sequence.
    pub seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_sign() {
        assert_eq!(Side::Buy.opposite(), Side::Sell);
        assert_eq!(Side::Sell.opposite(), Side::Buy);
        assert_eq!(Side::Buy.sign(), 1.0);
        assert_eq!(Side::Sell.sign(), -1.0);
    }

    #[test]
    fn side_parses_case_insensitively() {
        assert_eq!("buy".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!("SELL".parse::<Side>().unwrap(), Side::Sell);
        assert!("hold".parse::<Side>().is_err());
    }

    #[test]
    fn execution_mode_round_trips_serde() {
        let json = serde_json::to_string(&ExecutionMode::Cbook).unwrap();
        assert_eq!(json, "\"CBOOK\"");
        let back: ExecutionMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ExecutionMode::Cbook);
    }

    #[test]
    fn quote_well_formed_rejects_crossed_and_nonpositive() {
        let mut q = Quote {
            symbol: "EURUSD".into(),
            bid: 1.0900,
            ask: 1.0902,
            source: "lp-a".into(),
            source_seq: None,
            source_time_ms: 0,
            recv_time_ns: 0,
            stale: false,
        };
        assert!(q.is_well_formed());
        q.bid = 1.1000;
        assert!(!q.is_well_formed());
        q.bid = -1.0;
        assert!(!q.is_well_formed());
    }
}
