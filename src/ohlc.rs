// =============================================================================
// OHLC Aggregator — tick-to-bar bucketing for M1..D1
// =============================================================================
//
// Ticks are bucket-assigned on their UTC timestamp. Within a bucket:
// open = first, close = last, high/low = running extremes, volume = tick
// count. A bar is finalized when a tick with a timestamp in a later bucket
// arrives. Backdated ticks are clamped into the current bucket — history is
// never rewritten.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Tick;

/// Supported bar intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 7] = [
        Self::M1,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H4,
        Self::D1,
    ];

    pub fn duration_ms(self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M5 => 5 * 60_000,
            Self::M15 => 15 * 60_000,
            Self::M30 => 30 * 60_000,
            Self::H1 => 60 * 60_000,
            Self::H4 => 4 * 60 * 60_000,
            Self::D1 => 24 * 60 * 60_000,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        }
    }
}

impl std::str::FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "M1" | "1M" => Ok(Self::M1),
            "M5" | "5M" => Ok(Self::M5),
            "M15" | "15M" => Ok(Self::M15),
            "M30" | "30M" => Ok(Self::M30),
            "H1" | "1H" => Ok(Self::H1),
            "H4" | "4H" => Ok(Self::H4),
            "D1" | "1D" => Ok(Self::D1),
            other => Err(format!("unknown timeframe: {other}")),
        }
    }
}

/// One OHLC bar. Prices are bid-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bucket start, milliseconds since epoch (UTC).
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Tick count within the bucket.
    pub volume: u64,
    pub closed: bool,
}

struct Series {
    current: Option<Bar>,
    closed: VecDeque<Bar>,
}

impl Series {
    fn new() -> Self {
        Self {
            current: None,
            closed: VecDeque::new(),
        }
    }
}

pub struct OhlcAggregator {
    series: RwLock<HashMap<(String, Timeframe), Series>>,
    /// Closed bars retained per series.
    max_bars: usize,
}

impl OhlcAggregator {
    pub fn new(max_bars: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_bars,
        }
    }

    /// Absorb one tick into every timeframe; returns the bars this tick
    /// finalized (republished on close).
    pub fn on_tick(&self, tick: &Tick) -> Vec<Bar> {
        let mut finalized = Vec::new();
        let mut series_map = self.series.write();

        for tf in Timeframe::ALL {
            let series = series_map
                .entry((tick.symbol.clone(), tf))
                .or_insert_with(Series::new);

            let bucket_ms = tf.duration_ms();
            let mut bucket = tick.timestamp_ms - tick.timestamp_ms.rem_euclid(bucket_ms);
            let price = tick.bid;

            // Backdated tick: clamp into the open bucket, never rewrite.
            if let Some(bar) = series.current.as_ref() {
                if bucket < bar.open_time_ms {
                    bucket = bar.open_time_ms;
                }
            }

            // Later bucket: finalize the open bar first.
            let rolls = series
                .current
                .as_ref()
                .map_or(false, |bar| bucket != bar.open_time_ms);
            if rolls {
                let mut done = series.current.take().expect("checked above");
                done.closed = true;
                finalized.push(done.clone());
                series.closed.push_back(done);
                while series.closed.len() > self.max_bars {
                    series.closed.pop_front();
                }
            }

            match series.current.as_mut() {
                Some(bar) => {
                    bar.high = bar.high.max(price);
                    bar.low = bar.low.min(price);
                    bar.close = price;
                    bar.volume += 1;
                }
                None => {
                    series.current = Some(Bar {
                        symbol: tick.symbol.clone(),
                        timeframe: tf,
                        open_time_ms: bucket,
                        open: price,
                        high: price,
                        low: price,
                        close: price,
                        volume: 1,
                        closed: false,
                    });
                }
            }
        }
        finalized
    }

    /// The most recent `limit` bars, oldest first, the open bar last.
    pub fn bars(&self, symbol: &str, tf: Timeframe, limit: usize) -> Vec<Bar> {
        let series_map = self.series.read();
        let Some(series) = series_map.get(&(symbol.to_string(), tf)) else {
            return Vec::new();
        };
        let mut out: Vec<Bar> = Vec::new();
        let closed_take = limit.saturating_sub(series.current.is_some() as usize);
        let start = series.closed.len().saturating_sub(closed_take);
        out.extend(series.closed.iter().skip(start).cloned());
        if let Some(current) = &series.current {
            out.push(current.clone());
        }
        out
    }
}
