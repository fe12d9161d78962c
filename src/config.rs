// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Helios broker backend. Persistence uses
// an atomic tmp + rename pattern to prevent corruption on crash. All fields
// carry `#[serde(default)]` so that adding new fields never breaks loading an
// older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{ExecutionMode, MarginMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_quote_channel_capacity() -> usize {
    8192
}

fn default_staleness_ms() -> u64 {
    5_000
}

fn default_sanity_band_pct() -> f64 {
    10.0
}

fn default_min_change_pips() -> f64 {
    0.0
}

fn default_max_spread_pips() -> f64 {
    50.0
}

fn default_tick_buffer_capacity() -> usize {
    50_000
}

fn default_client_queue_capacity() -> usize {
    1_000
}

fn default_slow_grace_ms() -> u64 {
    3_000
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_deadline_secs() -> u64 {
    10
}

fn default_max_price_age_ms() -> i64 {
    2_000
}

fn default_margin_call_level() -> f64 {
    100.0
}

fn default_stop_out_level() -> f64 {
    50.0
}

fn default_command_queue_depth() -> usize {
    1_024
}

fn default_swap_time() -> String {
    "22:00".to_string()
}

fn default_swap_triple_weekday() -> u8 {
    2 // Wednesday
}

fn default_broker_utc_offset_minutes() -> i32 {
    0
}

fn default_leverage() -> f64 {
    100.0
}

fn default_balance() -> f64 {
    10_000.0
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_gap_timeout_ms() -> u64 {
    500
}

fn default_max_gap() -> u64 {
    2_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_logon_timeout_secs() -> u64 {
    15
}

fn default_place_timeout_secs() -> u64 {
    5
}

fn default_token_ttl_secs() -> i64 {
    15 * 60
}

fn default_rate_limit_per_sec() -> f64 {
    20.0
}

fn default_reclassify_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_hedge_threshold_lots() -> f64 {
    10.0
}

fn default_seq_dir() -> String {
    "data/fix-seq".to_string()
}

// =============================================================================
// Per-section configs
// =============================================================================

/// FIX 4.4 session parameters for one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSessionConfig {
    pub host: String,
    pub port: u16,
    pub sender_comp_id: String,
    pub target_comp_id: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Send ResetSeqNumFlag=Y on Logon.
    #[serde(default)]
    pub reset_on_logon: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Directory where per-session sequence files are persisted.
    #[serde(default = "default_seq_dir")]
    pub seq_dir: String,
    #[serde(default = "default_gap_timeout_ms")]
    pub gap_timeout_ms: u64,
    /// Incoming sequence gap larger than this terminates the session.
    #[serde(default = "default_max_gap")]
    pub max_gap: u64,
    #[serde(default = "default_logon_timeout_secs")]
    pub logon_timeout_secs: u64,
}

/// Socket.IO-style WebSocket provider parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketIoConfig {
    /// Base URL, e.g. `https://quotes.example.com`.
    pub base_url: String,
    /// Event name carrying quote payloads.
    #[serde(default = "default_quote_event")]
    pub quote_event: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_quote_event() -> String {
    "quote".to_string()
}

/// REST streaming provider parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestStreamConfig {
    /// Full streaming endpoint URL.
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
}

/// Protocol-specific settings for one configured adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum AdapterProtocolConfig {
    Fix(FixSessionConfig),
    Socketio(SocketIoConfig),
    Reststream(RestStreamConfig),
}

/// One liquidity-provider adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Unique adapter id, e.g. `lp-primary`.
    pub id: String,
    /// Lower value wins aggregator tie-breaks.
    #[serde(default)]
    pub priority: u32,
    /// Symbols this adapter subscribes to on connect.
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(flatten)]
    pub protocol: AdapterProtocolConfig,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_place_timeout_secs")]
    pub place_timeout_secs: u64,
}

/// Quote aggregator tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Sources silent for longer than this are excluded from selection.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    /// Reject quotes whose mid deviates from the last published mid by more
    /// than this percentage.
    #[serde(default = "default_sanity_band_pct")]
    pub sanity_band_pct: f64,
    /// Publish only when best bid/ask moved at least this many pips.
    #[serde(default = "default_min_change_pips")]
    pub min_change_pips: f64,
    /// Reject quotes wider than this many pips.
    #[serde(default = "default_max_spread_pips")]
    pub max_spread_pips: f64,
    #[serde(default = "default_quote_channel_capacity")]
    pub quote_channel_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            staleness_ms: default_staleness_ms(),
            sanity_band_pct: default_sanity_band_pct(),
            min_change_pips: default_min_change_pips(),
            max_spread_pips: default_max_spread_pips(),
            quote_channel_capacity: default_quote_channel_capacity(),
        }
    }
}

/// Tick distribution tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    #[serde(default = "default_client_queue_capacity")]
    pub client_queue_capacity: usize,
    /// How long a client may stay congested before eviction.
    #[serde(default = "default_slow_grace_ms")]
    pub slow_grace_ms: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_deadline_secs")]
    pub pong_deadline_secs: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: default_client_queue_capacity(),
            slow_grace_ms: default_slow_grace_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            pong_deadline_secs: default_pong_deadline_secs(),
        }
    }
}

/// Execution-engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Latest tick older than this fails market orders with StalePrice.
    #[serde(default = "default_max_price_age_ms")]
    pub max_price_age_ms: i64,
    /// Margin level (%) below which the account enters margin call.
    #[serde(default = "default_margin_call_level")]
    pub margin_call_level: f64,
    /// Margin level (%) at which losing positions are force-closed.
    #[serde(default = "default_stop_out_level")]
    pub stop_out_level: f64,
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
    /// Broker-time "HH:MM" at which daily swap is charged.
    #[serde(default = "default_swap_time")]
    pub swap_time: String,
    /// Weekday charged triple swap, 0 = Monday .. 6 = Sunday.
    #[serde(default = "default_swap_triple_weekday")]
    pub swap_triple_weekday: u8,
    /// Broker trading-day offset from UTC, minutes. Never applied to price
    /// comparisons — only swap timing and DAY order expiry.
    #[serde(default = "default_broker_utc_offset_minutes")]
    pub broker_utc_offset_minutes: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_price_age_ms: default_max_price_age_ms(),
            margin_call_level: default_margin_call_level(),
            stop_out_level: default_stop_out_level(),
            command_queue_depth: default_command_queue_depth(),
            swap_time: default_swap_time(),
            swap_triple_weekday: default_swap_triple_weekday(),
            broker_utc_offset_minutes: default_broker_utc_offset_minutes(),
        }
    }
}

/// Order-routing policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Per-symbol overrides of the global mode.
    #[serde(default)]
    pub symbol_overrides: HashMap<String, ExecutionMode>,
    /// Adapter id used for A-Book routing and exposure hedging.
    #[serde(default)]
    pub abook_adapter: Option<String>,
    #[serde(default = "default_reclassify_interval_secs")]
    pub reclassify_interval_secs: u64,
    /// |net exposure| in lots above which the hedger offsets externally.
    #[serde(default = "default_hedge_threshold_lots")]
    pub hedge_threshold_lots: f64,
    /// Per-symbol hedge-threshold overrides.
    #[serde(default)]
    pub hedge_thresholds: HashMap<String, f64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Bbook,
            symbol_overrides: HashMap::new(),
            abook_adapter: None,
            reclassify_interval_secs: default_reclassify_interval_secs(),
            hedge_threshold_lots: default_hedge_threshold_lots(),
            hedge_thresholds: HashMap::new(),
        }
    }
}

/// Client-session / token settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: i64,
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: default_token_ttl_secs(),
            rate_limit_per_sec: default_rate_limit_per_sec(),
        }
    }
}

/// An account provisioned at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub password: String,
    #[serde(default = "default_balance")]
    pub balance: f64,
    #[serde(default = "default_leverage")]
    pub leverage: f64,
    #[serde(default)]
    pub margin_mode: MarginMode,
    #[serde(default)]
    pub currency: Option<String>,
    /// Demo accounts are always routed B-Book.
    #[serde(default)]
    pub demo: bool,
}

// =============================================================================
// Top-level config
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Liquidity-provider adapters, in configuration order.
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub distributor: DistributorConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    /// Accounts provisioned at startup.
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Optional symbol-spec file overriding the built-in registry.
    #[serde(default)]
    pub symbols_file: Option<String>,

    /// Optional directory for the day-partitioned tick archive.
    #[serde(default)]
    pub tick_archive_dir: Option<String>,

    /// Optional append-only JSONL mirror of the ledger.
    #[serde(default)]
    pub ledger_file: Option<String>,

    #[serde(default = "default_tick_buffer_capacity")]
    pub tick_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            adapters: Vec::new(),
            aggregator: AggregatorConfig::default(),
            distributor: DistributorConfig::default(),
            engine: EngineConfig::default(),
            router: RouterConfig::default(),
            sessions: SessionConfig::default(),
            accounts: Vec::new(),
            symbols_file: None,
            tick_archive_dir: None,
            ledger_file: None,
            tick_buffer_capacity: default_tick_buffer_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`, then apply environment
    /// overrides (`HELIOS_BIND_ADDR`, `HELIOS_EXECUTION_MODE`).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let mut config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        config.apply_env_overrides();
        config.validate()?;

        info!(
            path = %path.display(),
            adapters = config.adapters.len(),
            accounts = config.accounts.len(),
            mode = %config.router.mode,
            "config loaded"
        );

        Ok(config)
    }

    /// Apply environment-variable overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("HELIOS_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Ok(mode) = std::env::var("HELIOS_EXECUTION_MODE") {
            if let Ok(parsed) = mode.parse() {
                self.router.mode = parsed;
            }
        }
        if let Ok(dir) = std::env::var("HELIOS_TICK_ARCHIVE_DIR") {
            self.tick_archive_dir = Some(dir);
        }
    }

    /// Reject configurations that cannot possibly run.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for adapter in &self.adapters {
            if !seen.insert(adapter.id.clone()) {
                anyhow::bail!("duplicate adapter id: {}", adapter.id);
            }
        }
        if self.engine.stop_out_level >= self.engine.margin_call_level {
            anyhow::bail!(
                "stop_out_level ({}) must be below margin_call_level ({})",
                self.engine.stop_out_level,
                self.engine.margin_call_level
            );
        }
        if self.engine.swap_triple_weekday > 6 {
            anyhow::bail!(
                "swap_triple_weekday must be 0..=6, got {}",
                self.engine.swap_triple_weekday
            );
        }
        if crate::engine::parse_swap_time(&self.engine.swap_time).is_none() {
            anyhow::bail!("swap_time must be HH:MM, got {:?}", self.engine.swap_time);
        }
        Ok(())
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.aggregator.staleness_ms, 5_000);
        assert!((cfg.aggregator.sanity_band_pct - 10.0).abs() < f64::EPSILON);
        assert_eq!(cfg.distributor.client_queue_capacity, 1_000);
        assert_eq!(cfg.distributor.slow_grace_ms, 3_000);
        assert_eq!(cfg.engine.max_price_age_ms, 2_000);
        assert!((cfg.engine.margin_call_level - 100.0).abs() < f64::EPSILON);
        assert!((cfg.engine.stop_out_level - 50.0).abs() < f64::EPSILON);
        assert_eq!(cfg.engine.swap_triple_weekday, 2);
        assert_eq!(cfg.router.mode, ExecutionMode::Bbook);
        assert_eq!(cfg.tick_buffer_capacity, 50_000);
        assert!((cfg.sessions.rate_limit_per_sec - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn adapter_config_parses_tagged_protocols() {
        let json = r#"{
            "adapters": [
                { "id": "lp-fix", "priority": 0, "symbols": ["EURUSD"],
                  "protocol": "fix",
                  "host": "fix.example.com", "port": 9876,
                  "sender_comp_id": "HELIOS", "target_comp_id": "LP1" },
                { "id": "lp-ws", "priority": 1,
                  "protocol": "socketio",
                  "base_url": "https://quotes.example.com" }
            ]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.adapters.len(), 2);
        match &cfg.adapters[0].protocol {
            AdapterProtocolConfig::Fix(fix) => {
                assert_eq!(fix.sender_comp_id, "HELIOS");
                assert_eq!(fix.heartbeat_secs, 30);
                assert_eq!(fix.gap_timeout_ms, 500);
                assert_eq!(fix.max_gap, 2_000);
            }
            other => panic!("expected fix protocol, got {other:?}"),
        }
        match &cfg.adapters[1].protocol {
            AdapterProtocolConfig::Socketio(ws) => {
                assert_eq!(ws.quote_event, "quote");
            }
            other => panic!("expected socketio protocol, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_duplicate_adapter_ids() {
        let json = r#"{
            "adapters": [
                { "id": "dup", "protocol": "socketio", "base_url": "https://a" },
                { "id": "dup", "protocol": "socketio", "base_url": "https://b" }
            ]
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_margin_levels() {
        let mut cfg = Config::default();
        cfg.engine.stop_out_level = 120.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.bind_addr = "127.0.0.1:9999".into();
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.bind_addr, "127.0.0.1:9999");
    }
}
