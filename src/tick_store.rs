// =============================================================================
// Tick Store — bounded per-symbol ring buffer with latest-tick cache
// =============================================================================
//
// Single-writer (the aggregator), many-reader (engine, distributor, OHLC,
// REST). Appends and latest-tick lookups are O(1); snapshot reads clone out
// of the ring under a read-preferring lock. An optional archive writes one
// JSON line per tick into day-partitioned files per symbol.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::{TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::types::Tick;

pub struct TickStore {
    buffers: RwLock<HashMap<String, VecDeque<Tick>>>,
    capacity: usize,
    archive: Option<Archive>,
}

struct Archive {
    dir: PathBuf,
    /// Open file handles keyed by (symbol, yyyy-mm-dd).
    files: Mutex<HashMap<(String, String), File>>,
}

impl TickStore {
    pub fn new(capacity: usize, archive_dir: Option<String>) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            capacity,
            archive: archive_dir.map(|dir| Archive {
                dir: PathBuf::from(dir),
                files: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Append one tick. Oldest entries are evicted past the per-symbol cap.
    pub fn append(&self, tick: Tick) {
        if let Some(archive) = &self.archive {
            archive.write(&tick);
        }

        let mut buffers = self.buffers.write();
        let ring = buffers
            .entry(tick.symbol.clone())
            .or_insert_with(|| VecDeque::with_capacity(1024));
        ring.push_back(tick);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Most recent tick for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<Tick> {
        self.buffers
            .read()
            .get(symbol)
            .and_then(|ring| ring.back().cloned())
    }

    /// Latest tick, failing when missing or older than `max_age_ms`.
    pub fn latest_fresh(
        &self,
        symbol: &str,
        max_age_ms: i64,
        now_ms: i64,
    ) -> Result<Tick, CoreError> {
        let tick = self
            .latest(symbol)
            .ok_or_else(|| CoreError::NoLiquidity(symbol.to_string()))?;
        if now_ms - tick.timestamp_ms > max_age_ms {
            return Err(CoreError::StalePrice(symbol.to_string()));
        }
        Ok(tick)
    }

    /// The last `n` ticks, oldest first.
    pub fn last_n(&self, symbol: &str, n: usize) -> Vec<Tick> {
        let buffers = self.buffers.read();
        match buffers.get(symbol) {
            Some(ring) => {
                let start = ring.len().saturating_sub(n);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Ticks with `from_ms <= timestamp < to_ms`, oldest first.
    pub fn range(&self, symbol: &str, from_ms: i64, to_ms: i64) -> Vec<Tick> {
        let buffers = self.buffers.read();
        match buffers.get(symbol) {
            Some(ring) => ring
                .iter()
                .filter(|t| t.timestamp_ms >= from_ms && t.timestamp_ms < to_ms)
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn len(&self, symbol: &str) -> usize {
        self.buffers.read().get(symbol).map(|r| r.len()).unwrap_or(0)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.buffers.read().keys().cloned().collect()
    }
}

impl Archive {
    /// Append one JSONL record to `<dir>/<symbol>/<yyyy-mm-dd>.jsonl`.
    fn write(&self, tick: &Tick) {
        let date = Utc
            .timestamp_millis_opt(tick.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d")
            .to_string();
        let key = (tick.symbol.clone(), date.clone());

        let mut files = self.files.lock();
        if !files.contains_key(&key) {
            // Day rolled over: drop yesterday's handle for this symbol.
            files.retain(|(sym, d), _| sym != &tick.symbol || d == &date);
            let dir = self.dir.join(&tick.symbol);
            if let Err(e) = std::fs::create_dir_all(&dir) {
                warn!(error = %e, "archive dir create failed");
                return;
            }
            let path = dir.join(format!("{date}.jsonl"));
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "archive file opened");
                    files.insert(key.clone(), file);
                }
                Err(e) => {
                    warn!(error = %e, path = %path.display(), "archive open failed");
                    return;
                }
            }
        }

        if let Some(file) = files.get_mut(&key) {
            match serde_json::to_string(tick) {
                Ok(line) => {
                    if let Err(e) = writeln!(file, "{line}") {
                        warn!(error = %e, "archive write failed");
                    }
                }
                Err(e) => warn!(error = %e, "tick serialisation failed"),
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

    fn tick(seq: u64, ts: i64) -> Tick {
        Tick {
            symbol: "EURUSD".into(),
            bid: 1.09 + seq as f64 * 0.0001,
            ask: 1.0902 + seq as f64 * 0.0001,
            spread: 0.0002,
            timestamp_ms: ts,
            sources: vec!["a".into()],
            seq,
        }
    }

    #[test]
    fn append_and_latest() {
        let store = TickStore::new(100, None);
        assert!(store.latest("EURUSD").is_none());
        store.append(tick(1, 1_000));
        store.append(tick(2, 2_000));
        let latest = store.latest("EURUSD").unwrap();
        assert_eq!(latest.seq, 2);
        assert_eq!(store.len("EURUSD"), 2);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let store = TickStore::new(3, None);
        for i in 1..=5 {
            store.append(tick(i, i as i64 * 1_000));
        }
        assert_eq!(store.len("EURUSD"), 3);
        let ticks = store.last_n("EURUSD", 10);
        assert_eq!(ticks.first().unwrap().seq, 3);
        assert_eq!(ticks.last().unwrap().seq, 5);
    }

    #[test]
    fn range_query_filters_by_time() {
        let store = TickStore::new(100, None);
        for i in 1..=5 {
            store.append(tick(i, i as i64 * 1_000));
        }
        let ticks = store.range("EURUSD", 2_000, 4_000);
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].seq, 2);
        assert_eq!(ticks[1].seq, 3);
    }

    #[test]
    fn latest_fresh_maps_missing_and_stale() {
        let store = TickStore::new(100, None);
        assert!(matches!(
            store.latest_fresh("EURUSD", 2_000, 10_000),
            Err(CoreError::NoLiquidity(_))
        ));
        store.append(tick(1, 1_000));
        assert!(matches!(
            store.latest_fresh("EURUSD", 2_000, 10_000),
            Err(CoreError::StalePrice(_))
        ));
        assert!(store.latest_fresh("EURUSD", 2_000, 2_500).is_ok());
    }

    #[test]
    fn archive_writes_day_partitioned_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let store = TickStore::new(100, Some(dir.path().to_string_lossy().into_owned()));
        // 2024-01-05 12:00:00 UTC.
        store.append(tick(1, 1_704_456_000_000));
        store.append(tick(2, 1_704_456_001_000));

        let path = dir.path().join("EURUSD").join("2024-01-05.jsonl");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: Tick = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.seq, 1);
    }
}
