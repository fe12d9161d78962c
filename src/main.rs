// =============================================================================
// Helios Broker Backend — Main Entry Point
// =============================================================================
//
// Startup order: config -> symbol registry -> engine -> adapters (parallel)
// -> aggregator -> distributor -> router -> API server. The supervisor owns
// restart policy and health; SIGINT drains gracefully.
//
// Exit codes: 0 normal shutdown, 1 config error, 2 fatal startup error,
// 130 SIGINT.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod config;
mod distributor;
mod engine;
mod errors;
mod lp;
mod ohlc;
mod router;
mod sessions;
mod supervisor;
mod symbols;
mod tick_store;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::aggregator::AggregatorCore;
use crate::config::{AccountConfig, AdapterProtocolConfig, Config};
use crate::distributor::Distributor;
use crate::engine::{AccountBook, Engine, EngineShared};
use crate::lp::{LpAdapter, SharedAdapter};
use crate::ohlc::OhlcAggregator;
use crate::router::{Router as OrderRouter, StatsClassifier};
use crate::sessions::SessionManager;
use crate::supervisor::Supervisor;
use crate::symbols::SymbolRegistry;
use crate::tick_store::TickStore;
use crate::types::MarginMode;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_STARTUP_ERROR: i32 = 2;
const EXIT_SIGINT: i32 = 130;

#[tokio::main]
async fn main() {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Helios broker backend starting");

    // ── 2. Configuration ─────────────────────────────────────────────────
    let config_path =
        std::env::var("HELIOS_CONFIG").unwrap_or_else(|_| "config.json".to_string());
    let mut config = if std::path::Path::new(&config_path).exists() {
        match Config::load(&config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!(error = %e, path = %config_path, "config invalid");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        }
    } else {
        warn!(path = %config_path, "config file missing, using defaults");
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    };

    // A runnable default: one demo account when none is provisioned.
    if config.accounts.is_empty() {
        warn!("no accounts configured, provisioning demo account 'demo'");
        config.accounts.push(AccountConfig {
            id: "demo".into(),
            password: std::env::var("HELIOS_DEMO_PASSWORD").unwrap_or_else(|_| "demo".into()),
            balance: 10_000.0,
            leverage: 100.0,
            margin_mode: MarginMode::Hedging,
            currency: None,
            demo: true,
        });
    }

    // ── 3. Symbol registry ───────────────────────────────────────────────
    let registry = match &config.symbols_file {
        Some(path) => match SymbolRegistry::load(path) {
            Ok(reg) => Arc::new(reg),
            Err(e) => {
                error!(error = %e, "symbol registry load failed");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
        },
        None => Arc::new(SymbolRegistry::builtin()),
    };
    info!(symbols = registry.len(), "symbol registry ready");

    // ── 4. Core state ────────────────────────────────────────────────────
    let supervisor = Arc::new(Supervisor::new());
    let tick_store = Arc::new(TickStore::new(
        config.tick_buffer_capacity,
        config.tick_archive_dir.clone(),
    ));
    let ohlc = Arc::new(OhlcAggregator::new(5_000));
    let distributor = Arc::new(Distributor::new(config.distributor.clone()));
    let sessions = Arc::new(SessionManager::new(
        config.sessions.clone(),
        &config.accounts,
    ));

    // ── 5. Execution engine ──────────────────────────────────────────────
    let accounts = match &config.ledger_file {
        Some(path) => match AccountBook::with_ledger_file(path) {
            Ok(book) => book,
            Err(e) => {
                error!(error = %e, path = %path, "ledger file open failed");
                std::process::exit(EXIT_STARTUP_ERROR);
            }
        },
        None => AccountBook::new(),
    };
    let engine_shared = Arc::new(EngineShared::with_accounts(accounts));
    for account in &config.accounts {
        engine_shared.accounts.provision(
            &account.id,
            account.currency.as_deref().unwrap_or("USD"),
            account.balance,
            account.leverage,
            account.margin_mode,
            account.demo,
        );
    }
    let (engine, engine_handle, engine_rx) = Engine::with_shared(
        registry.clone(),
        tick_store.clone(),
        config.engine.clone(),
        engine_shared,
    );
    tokio::spawn(engine.run(engine_rx));
    supervisor.report("engine", "RUNNING", true, None);

    // ── 6. LP adapters ───────────────────────────────────────────────────
    let (quote_tx, quote_rx) = mpsc::channel(config.aggregator.quote_channel_capacity);
    let mut adapters: HashMap<String, SharedAdapter> = HashMap::new();
    let mut priorities: HashMap<String, u32> = HashMap::new();

    for adapter_cfg in &config.adapters {
        let adapter: SharedAdapter = match &adapter_cfg.protocol {
            AdapterProtocolConfig::Fix(fix) => Arc::new(lp::fix::FixAdapter::new(
                adapter_cfg,
                fix.clone(),
                quote_tx.clone(),
            )),
            AdapterProtocolConfig::Socketio(ws) => Arc::new(lp::socketio::SocketIoAdapter::new(
                adapter_cfg,
                ws.clone(),
                quote_tx.clone(),
            )),
            AdapterProtocolConfig::Reststream(rest) => {
                Arc::new(lp::rest_stream::RestStreamAdapter::new(
                    adapter_cfg,
                    rest.clone(),
                    quote_tx.clone(),
                ))
            }
        };
        priorities.insert(adapter_cfg.id.clone(), adapter_cfg.priority);
        adapters.insert(adapter_cfg.id.clone(), adapter);
    }
    for adapter in adapters.values() {
        tokio::spawn(supervisor::supervise_adapter(
            supervisor.clone(),
            adapter.clone(),
        ));
    }
    info!(count = adapters.len(), "lp adapters launched");

    // ── 7. Aggregator ────────────────────────────────────────────────────
    let core = AggregatorCore::new(config.aggregator.clone(), registry.clone(), priorities);
    let aggregator_stats = core.stats.clone();
    tokio::spawn(aggregator::run_aggregator(
        core,
        quote_rx,
        tick_store.clone(),
        engine_handle.clone(),
        ohlc.clone(),
        distributor.clone(),
    ));

    // ── 8. Order router ──────────────────────────────────────────────────
    let order_router = Arc::new(OrderRouter::new(
        config.router.clone(),
        engine_handle.clone(),
        adapters.clone(),
        Box::new(StatsClassifier::default()),
    ));
    tokio::spawn(order_router.clone().run_reclassifier());
    tokio::spawn(order_router.clone().run_hedger(Duration::from_secs(10)));

    // ── 9. Background timers ─────────────────────────────────────────────
    tokio::spawn(supervisor::run_swap_scheduler(
        engine_handle.clone(),
        config.engine.clone(),
    ));
    tokio::spawn(supervisor::run_day_expiry(
        engine_handle.clone(),
        config.engine.clone(),
    ));
    tokio::spawn(supervisor::run_session_sweeper(sessions.clone()));
    tokio::spawn(supervisor::run_watchdog(
        supervisor.clone(),
        aggregator_stats.clone(),
        distributor.clone(),
        sessions.clone(),
    ));

    // ── 10. API server ───────────────────────────────────────────────────
    let ctx = Arc::new(api::AppCtx {
        registry: registry.clone(),
        tick_store: tick_store.clone(),
        ohlc: ohlc.clone(),
        engine: engine_handle.clone(),
        order_router: order_router.clone(),
        sessions: sessions.clone(),
        distributor: distributor.clone(),
        supervisor: supervisor.clone(),
        aggregator_stats: aggregator_stats.clone(),
    });
    let app = api::rest::router(ctx);
    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.bind_addr, "api bind failed");
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    };
    info!(addr = %config.bind_addr, "api server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "api server failed");
        }
    });

    // ── 11. Run until SIGINT, then drain ─────────────────────────────────
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("SIGINT received, shutting down"),
        Err(e) => {
            error!(error = %e, "signal listener failed");
            std::process::exit(EXIT_STARTUP_ERROR);
        }
    }

    // 1. Stop accepting new orders (REST gate), 2. ledger is write-through,
    // 3. close subscriber connections with the shutdown code, 4. adapters
    // say goodbye (FIX Logout).
    supervisor.begin_shutdown();
    distributor.kill_all();
    for adapter in adapters.values() {
        if let Err(e) = adapter.disconnect().await {
            warn!(adapter = adapter.id(), error = %e, "adapter disconnect failed");
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    info!("shutdown complete");
    std::process::exit(EXIT_SIGINT);
}
