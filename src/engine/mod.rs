// =============================================================================
// Execution Engine — positions, orders, SL/TP, margin, ledger
// =============================================================================
//
// All mutations flow through a single command loop (one writer), so per
// account the state transitions are totally ordered and the ledger reflects
// that order. Read-only queries go through `EngineShared` snapshots and never
// block the writer beyond a brief lock.
//
// The aggregator awaits `apply_tick` before fanning the tick out to
// distributor subscribers, so a client that triggers on a tick sees the fill
// no later than the tick itself.
// =============================================================================

pub mod account;
pub mod orders;
pub mod position;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::errors::{CoreError, CoreResult};
use crate::symbols::SymbolRegistry;
use crate::tick_store::TickStore;
use crate::types::{MarginMode, OrderType, Side, Tick, TimeInForce};

pub use account::{Account, AccountBook, AccountStatus, LedgerEntry, LedgerType};
pub use orders::{OrderStatus, PendingOrder, TriggerAction};
pub use position::{Position, PositionStatus};

/// Parse "HH:MM" broker swap time. Used by config validation too.
pub fn parse_swap_time(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some((h, m))
}

// ---------------------------------------------------------------------------
// Requests / responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MarketOrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketFill {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    pub commission: f64,
}

#[derive(Debug, Clone)]
pub struct PendingOrderRequest {
    pub account_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub volume: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trail_distance: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone, Serialize)]
pub struct CloseReport {
    pub position_id: String,
    pub closed_volume: f64,
    pub close_price: f64,
    pub realized_pnl: f64,
    pub slipped: bool,
    pub reason: String,
}

/// Derived account figures; not stored anywhere.
#[derive(Debug, Clone, Serialize)]
pub struct AccountMetrics {
    pub balance: f64,
    pub equity: f64,
    pub used_margin: f64,
    pub free_margin: f64,
    /// Percent; `None` when no margin is in use.
    pub margin_level: Option<f64>,
    pub open_positions: usize,
}

// ---------------------------------------------------------------------------
// Shared state (single writer: the engine task)
// ---------------------------------------------------------------------------

pub struct EngineShared {
    pub accounts: AccountBook,
    /// Open and partially closed positions by id.
    pub positions: RwLock<HashMap<String, Position>>,
    /// Fully closed positions, oldest first (trade history).
    pub closed: RwLock<Vec<Position>>,
    pub orders: RwLock<HashMap<String, PendingOrder>>,
}

impl EngineShared {
    pub fn new() -> Self {
        Self::with_accounts(AccountBook::new())
    }

    pub fn with_accounts(accounts: AccountBook) -> Self {
        Self {
            accounts,
            positions: RwLock::new(HashMap::new()),
            closed: RwLock::new(Vec::new()),
            orders: RwLock::new(HashMap::new()),
        }
    }

    pub fn open_positions_for(&self, account_id: &str) -> Vec<Position> {
        self.positions
            .read()
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn orders_for(&self, account_id: &str) -> Vec<PendingOrder> {
        self.orders
            .read()
            .values()
            .filter(|o| o.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn closed_for(&self, account_id: &str, limit: usize) -> Vec<Position> {
        let closed = self.closed.read();
        let filtered: Vec<Position> = closed
            .iter()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        let start = filtered.len().saturating_sub(limit);
        filtered[start..].to_vec()
    }

    /// Balance + unrealized, margin aggregation. Works for both margin modes
    /// because NETTING keeps at most one position per symbol.
    pub fn metrics(&self, registry: &SymbolRegistry, account: &Account) -> AccountMetrics {
        let positions = self.positions.read();
        let mut unrealized = 0.0;
        let mut used_margin = 0.0;
        let mut open = 0usize;
        for pos in positions.values().filter(|p| p.account_id == account.id) {
            unrealized += pos.unrealized_pnl;
            if let Some(spec) = registry.get(&pos.symbol) {
                used_margin += pos.used_margin(spec, account.leverage);
            }
            open += 1;
        }
        let equity = account.balance + unrealized;
        AccountMetrics {
            balance: account.balance,
            equity,
            used_margin,
            free_margin: equity - used_margin,
            margin_level: if used_margin > 0.0 {
                Some(equity / used_margin * 100.0)
            } else {
                None
            },
            open_positions: open,
        }
    }
}

impl Default for EngineShared {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub enum EngineCommand {
    Market(MarketOrderRequest, oneshot::Sender<CoreResult<MarketFill>>),
    Pending(
        PendingOrderRequest,
        oneshot::Sender<CoreResult<PendingOrder>>,
    ),
    CancelOrder {
        account_id: String,
        order_id: String,
        respond: oneshot::Sender<CoreResult<PendingOrder>>,
    },
    Close {
        account_id: String,
        position_id: String,
        volume: Option<f64>,
        respond: oneshot::Sender<CoreResult<CloseReport>>,
    },
    Modify {
        account_id: String,
        position_id: String,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        respond: oneshot::Sender<CoreResult<Position>>,
    },
    /// Record an external (A-Book) fill for bookkeeping.
    MirrorFill {
        account_id: String,
        symbol: String,
        side: Side,
        volume: f64,
        price: f64,
        ticket: String,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        respond: oneshot::Sender<CoreResult<MarketFill>>,
    },
    Tick(Tick, oneshot::Sender<()>),
    SwapAccrual,
    ExpireDayOrders,
}

/// Cloneable handle used by the router, REST layer and aggregator.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
    pub shared: Arc<EngineShared>,
}

impl EngineHandle {
    /// Client-originated commands reject with `ServerBusy` when the queue is
    /// at depth rather than blocking the caller.
    fn submit(&self, cmd: EngineCommand) -> CoreResult<()> {
        self.tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CoreError::ServerBusy,
            mpsc::error::TrySendError::Closed(_) => CoreError::Internal("engine stopped".into()),
        })
    }

    pub async fn market(&self, req: MarketOrderRequest) -> CoreResult<MarketFill> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::Market(req, tx))?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    pub async fn pending(&self, req: PendingOrderRequest) -> CoreResult<PendingOrder> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::Pending(req, tx))?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    pub async fn cancel_order(&self, account_id: &str, order_id: &str) -> CoreResult<PendingOrder> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::CancelOrder {
            account_id: account_id.to_string(),
            order_id: order_id.to_string(),
            respond: tx,
        })?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    pub async fn close(
        &self,
        account_id: &str,
        position_id: &str,
        volume: Option<f64>,
    ) -> CoreResult<CloseReport> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::Close {
            account_id: account_id.to_string(),
            position_id: position_id.to_string(),
            volume,
            respond: tx,
        })?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    pub async fn modify(
        &self,
        account_id: &str,
        position_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> CoreResult<Position> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::Modify {
            account_id: account_id.to_string(),
            position_id: position_id.to_string(),
            stop_loss,
            take_profit,
            respond: tx,
        })?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn mirror_fill(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        ticket: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> CoreResult<MarketFill> {
        let (tx, rx) = oneshot::channel();
        self.submit(EngineCommand::MirrorFill {
            account_id: account_id.to_string(),
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            ticket: ticket.to_string(),
            stop_loss,
            take_profit,
            respond: tx,
        })?;
        rx.await
            .map_err(|_| CoreError::Internal("engine dropped request".into()))?
    }

    /// Tick path: blocks on queue space (never rejects) and resolves once the
    /// engine has reacted, preserving the fill-before-broadcast ordering.
    pub async fn apply_tick(&self, tick: Tick) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(EngineCommand::Tick(tick, tx)).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    pub async fn swap_accrual(&self) {
        let _ = self.tx.send(EngineCommand::SwapAccrual).await;
    }

    pub async fn expire_day_orders(&self) {
        let _ = self.tx.send(EngineCommand::ExpireDayOrders).await;
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    pub shared: Arc<EngineShared>,
    registry: Arc<SymbolRegistry>,
    tick_store: Arc<TickStore>,
    cfg: EngineConfig,
}

impl Engine {
    pub fn new(
        registry: Arc<SymbolRegistry>,
        tick_store: Arc<TickStore>,
        cfg: EngineConfig,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineCommand>) {
        Self::with_shared(registry, tick_store, cfg, Arc::new(EngineShared::new()))
    }

    pub fn with_shared(
        registry: Arc<SymbolRegistry>,
        tick_store: Arc<TickStore>,
        cfg: EngineConfig,
        shared: Arc<EngineShared>,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineCommand>) {
        let (tx, rx) = mpsc::channel(cfg.command_queue_depth);
        let handle = EngineHandle {
            tx,
            shared: shared.clone(),
        };
        (
            Self {
                shared,
                registry,
                tick_store,
                cfg,
            },
            handle,
            rx,
        )
    }

    /// Command loop; runs until the channel closes.
    pub async fn run(self, mut rx: mpsc::Receiver<EngineCommand>) {
        info!("execution engine started");
        while let Some(cmd) = rx.recv().await {
            let now_ms = Utc::now().timestamp_millis();
            match cmd {
                EngineCommand::Market(req, respond) => {
                    let _ = respond.send(self.handle_market(req, now_ms));
                }
                EngineCommand::Pending(req, respond) => {
                    let _ = respond.send(self.handle_pending(req, now_ms));
                }
                EngineCommand::CancelOrder {
                    account_id,
                    order_id,
                    respond,
                } => {
                    let _ = respond.send(self.handle_cancel(&account_id, &order_id));
                }
                EngineCommand::Close {
                    account_id,
                    position_id,
                    volume,
                    respond,
                } => {
                    let _ =
                        respond.send(self.handle_close(&account_id, &position_id, volume, now_ms));
                }
                EngineCommand::Modify {
                    account_id,
                    position_id,
                    stop_loss,
                    take_profit,
                    respond,
                } => {
                    let _ = respond.send(self.handle_modify(
                        &account_id,
                        &position_id,
                        stop_loss,
                        take_profit,
                        now_ms,
                    ));
                }
                EngineCommand::MirrorFill {
                    account_id,
                    symbol,
                    side,
                    volume,
                    price,
                    ticket,
                    stop_loss,
                    take_profit,
                    respond,
                } => {
                    let _ = respond.send(self.handle_mirror_fill(
                        &account_id,
                        &symbol,
                        side,
                        volume,
                        price,
                        &ticket,
                        stop_loss,
                        take_profit,
                        now_ms,
                    ));
                }
                EngineCommand::Tick(tick, ack) => {
                    self.on_tick(&tick, now_ms);
                    let _ = ack.send(());
                }
                EngineCommand::SwapAccrual => {
                    self.charge_swap(now_ms);
                }
                EngineCommand::ExpireDayOrders => {
                    self.expire_day_orders(now_ms);
                }
            }
        }
        info!("execution engine stopped");
    }

    // -------------------------------------------------------------------------
    // Market orders
    // -------------------------------------------------------------------------

    pub fn handle_market(
        &self,
        req: MarketOrderRequest,
        now_ms: i64,
    ) -> CoreResult<MarketFill> {
        let account = self.gate_account(&req.account_id)?;
        let spec = self.registry.require_tradable(&req.symbol)?;
        spec.validate_volume(req.volume)?;

        let tick = self
            .tick_store
            .latest_fresh(&req.symbol, self.cfg.max_price_age_ms, now_ms)?;
        let price = match req.side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };

        // Margin gate on the incremental exposure.
        let metrics = self.shared.metrics(&self.registry, &account);
        let required =
            req.volume * spec.contract_size * price / account.leverage * spec.margin_rate;
        if metrics.free_margin < required {
            return Err(CoreError::InsufficientMargin {
                required,
                free: metrics.free_margin,
            });
        }

        let commission = spec.commission_per_lot * req.volume;
        self.fill_market(
            &account,
            &req.symbol,
            req.side,
            req.volume,
            price,
            commission,
            req.stop_loss,
            req.take_profit,
            None,
            now_ms,
        )
    }

    /// Open (or, in netting mode, merge) a fill that already passed the
    /// gates. Shared by market orders, pending triggers and mirror fills.
    #[allow(clippy::too_many_arguments)]
    fn fill_market(
        &self,
        account: &Account,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        commission: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        hedge_ticket: Option<String>,
        now_ms: i64,
    ) -> CoreResult<MarketFill> {
        if account.margin_mode == MarginMode::Netting {
            let existing_id = {
                let positions = self.shared.positions.read();
                positions
                    .values()
                    .find(|p| p.account_id == account.id && p.symbol == symbol)
                    .map(|p| p.id.clone())
            };
            if let Some(existing_id) = existing_id {
                return self.net_into(
                    &existing_id,
                    account,
                    symbol,
                    side,
                    volume,
                    price,
                    commission,
                    now_ms,
                );
            }
        }

        let id = Uuid::new_v4().to_string();
        let position = Position {
            id: id.clone(),
            account_id: account.id.clone(),
            symbol: symbol.to_string(),
            side,
            volume,
            opened_volume: volume,
            open_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
            stop_loss,
            take_profit,
            commission,
            swap: 0.0,
            open_time_ms: now_ms,
            last_update_ms: now_ms,
            status: PositionStatus::Open,
            hedge_ticket,
            last_eval_price: price,
            close_price: None,
            close_time_ms: None,
            close_reason: None,
            realized_pnl: 0.0,
            slipped: false,
        };

        if commission > 0.0 {
            self.shared.accounts.apply(
                &account.id,
                LedgerType::Commission,
                -commission,
                Some(id.clone()),
            )?;
        }
        info!(
            position = %id,
            account = %account.id,
            symbol,
            side = %side,
            volume,
            price,
            commission,
            "position opened"
        );
        self.shared.positions.write().insert(id.clone(), position);

        Ok(MarketFill {
            position_id: id,
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            commission,
        })
    }

    /// Netting merge: same side extends at VWAP; the opposite side reduces,
    /// realizing P&L proportionally, and may flip.
    #[allow(clippy::too_many_arguments)]
    fn net_into(
        &self,
        existing_id: &str,
        account: &Account,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        commission: f64,
        now_ms: i64,
    ) -> CoreResult<MarketFill> {
        let spec = self.registry.require(symbol)?;

        if commission > 0.0 {
            self.shared.accounts.apply(
                &account.id,
                LedgerType::Commission,
                -commission,
                Some(existing_id.to_string()),
            )?;
        }

        let mut positions = self.shared.positions.write();
        let pos = positions
            .get_mut(existing_id)
            .ok_or_else(|| CoreError::PositionNotFound(existing_id.to_string()))?;

        if pos.side == side {
            // Extend at volume-weighted open price.
            let total = pos.volume + volume;
            pos.open_price = (pos.open_price * pos.volume + price * volume) / total;
            pos.volume = total;
            pos.opened_volume += volume;
            pos.commission += commission;
            pos.last_update_ms = now_ms;
            debug!(position = %pos.id, volume = total, vwap = pos.open_price, "netted extension");
            return Ok(MarketFill {
                position_id: pos.id.clone(),
                symbol: symbol.to_string(),
                side,
                volume,
                price,
                commission,
            });
        }

        // Opposite side: reduce, realize proportionally.
        let reduce = pos.volume.min(volume);
        let realized = pos.pnl_at(spec, price, reduce);
        pos.volume -= reduce;
        pos.realized_pnl += realized;
        pos.commission += commission;
        pos.last_update_ms = now_ms;
        let pos_id = pos.id.clone();
        let fully_closed = pos.volume <= 1e-9;
        if fully_closed {
            let mut done = positions.remove(&pos_id).expect("present");
            done.status = PositionStatus::Closed;
            done.volume = 0.0;
            done.close_price = Some(price);
            done.close_time_ms = Some(now_ms);
            done.close_reason = Some("netted".into());
            self.shared.closed.write().push(done);
        } else {
            pos.status = PositionStatus::Partial;
        }
        drop(positions);

        self.shared.accounts.apply(
            &account.id,
            LedgerType::RealizedPnl,
            realized,
            Some(pos_id.clone()),
        )?;

        // Flip: the excess opens a fresh position on the incoming side.
        let leftover = volume - reduce;
        if leftover > 1e-9 {
            let id = Uuid::new_v4().to_string();
            let position = Position {
                id: id.clone(),
                account_id: account.id.clone(),
                symbol: symbol.to_string(),
                side,
                volume: leftover,
                opened_volume: leftover,
                open_price: price,
                current_price: price,
                unrealized_pnl: 0.0,
                stop_loss: None,
                take_profit: None,
                commission: 0.0,
                swap: 0.0,
                open_time_ms: now_ms,
                last_update_ms: now_ms,
                status: PositionStatus::Open,
                hedge_ticket: None,
                last_eval_price: price,
                close_price: None,
                close_time_ms: None,
                close_reason: None,
                realized_pnl: 0.0,
                slipped: false,
            };
            info!(position = %id, symbol, side = %side, volume = leftover, "netted flip");
            self.shared.positions.write().insert(id.clone(), position);
            return Ok(MarketFill {
                position_id: id,
                symbol: symbol.to_string(),
                side,
                volume,
                price,
                commission,
            });
        }

        Ok(MarketFill {
            position_id: pos_id,
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            commission,
        })
    }

    // -------------------------------------------------------------------------
    // Pending orders
    // -------------------------------------------------------------------------

    pub fn handle_pending(
        &self,
        req: PendingOrderRequest,
        now_ms: i64,
    ) -> CoreResult<PendingOrder> {
        let account = self.gate_account(&req.account_id)?;
        let spec = self.registry.require_tradable(&req.symbol)?;
        spec.validate_volume(req.volume)?;

        match req.order_type {
            OrderType::Limit if req.limit_price.is_none() => {
                return Err(CoreError::MalformedMessage(
                    "limit order requires limit_price".into(),
                ));
            }
            OrderType::Stop if req.stop_price.is_none() => {
                return Err(CoreError::MalformedMessage(
                    "stop order requires stop_price".into(),
                ));
            }
            OrderType::StopLimit if req.stop_price.is_none() || req.limit_price.is_none() => {
                return Err(CoreError::MalformedMessage(
                    "stop-limit order requires stop_price and limit_price".into(),
                ));
            }
            OrderType::TrailingStop if req.trail_distance.is_none() => {
                return Err(CoreError::MalformedMessage(
                    "trailing-stop order requires trail_distance".into(),
                ));
            }
            OrderType::Market => {
                return Err(CoreError::MalformedMessage(
                    "market orders do not rest".into(),
                ));
            }
            _ => {}
        }

        let mut order = PendingOrder {
            id: Uuid::new_v4().to_string(),
            account_id: req.account_id.clone(),
            symbol: req.symbol.clone(),
            order_type: req.order_type,
            side: req.side,
            volume: req.volume,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            trail_distance: req.trail_distance,
            stop_loss: req.stop_loss,
            take_profit: req.take_profit,
            tif: req.tif,
            status: OrderStatus::Pending,
            created_ms: now_ms,
            armed: false,
        };

        // IOC / FOK are answered immediately against the current top of book.
        if matches!(req.tif, TimeInForce::Ioc | TimeInForce::Fok) {
            let tick = self
                .tick_store
                .latest_fresh(&req.symbol, self.cfg.max_price_age_ms, now_ms)?;
            match order.evaluate(tick.bid, tick.ask) {
                Some(TriggerAction::Fill(price)) => {
                    let fill =
                        self.fill_pending(&account, &order, price, now_ms)?;
                    order.status = OrderStatus::Filled;
                    debug!(order = %order.id, position = %fill.position_id, "immediate-tif fill");
                    return Ok(order);
                }
                _ => {
                    // Top of book cannot satisfy it now: IOC cancels the
                    // remainder, FOK rejects outright.
                    order.status = if req.tif == TimeInForce::Ioc {
                        OrderStatus::Cancelled
                    } else {
                        OrderStatus::Rejected
                    };
                    return Ok(order);
                }
            }
        }

        info!(
            order = %order.id,
            account = %req.account_id,
            symbol = %req.symbol,
            order_type = %req.order_type,
            side = %req.side,
            volume = req.volume,
            tif = %req.tif,
            "pending order accepted"
        );
        self.shared
            .orders
            .write()
            .insert(order.id.clone(), order.clone());
        Ok(order)
    }

    /// Execute a triggered pending order through the same gates as a market
    /// order (margin can have changed since placement).
    fn fill_pending(
        &self,
        account: &Account,
        order: &PendingOrder,
        price: f64,
        now_ms: i64,
    ) -> CoreResult<MarketFill> {
        let spec = self.registry.require_tradable(&order.symbol)?;
        let metrics = self.shared.metrics(&self.registry, account);
        let required =
            order.volume * spec.contract_size * price / account.leverage * spec.margin_rate;
        if metrics.free_margin < required {
            return Err(CoreError::InsufficientMargin {
                required,
                free: metrics.free_margin,
            });
        }
        let commission = spec.commission_per_lot * order.volume;
        self.fill_market(
            account,
            &order.symbol,
            order.side,
            order.volume,
            price,
            commission,
            order.stop_loss,
            order.take_profit,
            None,
            now_ms,
        )
    }

    fn handle_cancel(&self, account_id: &str, order_id: &str) -> CoreResult<PendingOrder> {
        let mut orders = self.shared.orders.write();
        let order = orders
            .get(order_id)
            .ok_or_else(|| CoreError::OrderNotFound(order_id.to_string()))?;
        if order.account_id != account_id {
            return Err(CoreError::Forbidden);
        }
        let mut order = orders.remove(order_id).expect("present");
        order.status = OrderStatus::Cancelled;
        info!(order = %order.id, account = account_id, "order cancelled");
        Ok(order)
    }

    // -------------------------------------------------------------------------
    // Close / modify
    // -------------------------------------------------------------------------

    pub fn handle_close(
        &self,
        account_id: &str,
        position_id: &str,
        volume: Option<f64>,
        now_ms: i64,
    ) -> CoreResult<CloseReport> {
        {
            let positions = self.shared.positions.read();
            let pos = positions
                .get(position_id)
                .ok_or_else(|| CoreError::PositionNotFound(position_id.to_string()))?;
            if pos.account_id != account_id {
                return Err(CoreError::Forbidden);
            }
        }
        let (symbol, side) = {
            let positions = self.shared.positions.read();
            let pos = &positions[position_id];
            (pos.symbol.clone(), pos.side)
        };
        let tick = self
            .tick_store
            .latest_fresh(&symbol, self.cfg.max_price_age_ms, now_ms)?;
        let price = match side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };
        self.close_position(position_id, volume, price, false, "manual", now_ms)
    }

    fn handle_modify(
        &self,
        account_id: &str,
        position_id: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        now_ms: i64,
    ) -> CoreResult<Position> {
        let mut positions = self.shared.positions.write();
        let pos = positions
            .get_mut(position_id)
            .ok_or_else(|| CoreError::PositionNotFound(position_id.to_string()))?;
        if pos.account_id != account_id {
            return Err(CoreError::Forbidden);
        }
        pos.stop_loss = stop_loss;
        pos.take_profit = take_profit;
        pos.last_update_ms = now_ms;
        info!(position = %pos.id, ?stop_loss, ?take_profit, "position modified");
        Ok(pos.clone())
    }

    /// Close `volume` (or all) of a position at `price`. The single path for
    /// manual closes, SL/TP, netting reduction and stop-out.
    fn close_position(
        &self,
        position_id: &str,
        volume: Option<f64>,
        price: f64,
        slipped: bool,
        reason: &str,
        now_ms: i64,
    ) -> CoreResult<CloseReport> {
        let mut positions = self.shared.positions.write();
        let pos = positions
            .get_mut(position_id)
            .ok_or_else(|| CoreError::PositionNotFound(position_id.to_string()))?;
        let spec = self.registry.require(&pos.symbol)?;

        let close_volume = volume.unwrap_or(pos.volume);
        if close_volume <= 0.0 || close_volume > pos.volume + 1e-9 {
            return Err(CoreError::InvalidVolume {
                volume: close_volume,
                reason: format!("open volume is {}", pos.volume),
            });
        }

        let realized = pos.pnl_at(spec, price, close_volume);
        pos.volume -= close_volume;
        pos.realized_pnl += realized;
        let account_id = pos.account_id.clone();
        let pos_id = pos.id.clone();
        let fully = pos.volume <= 1e-9;
        if fully {
            let mut done = positions.remove(&pos_id).expect("present");
            done.status = PositionStatus::Closed;
            done.volume = 0.0;
            done.close_price = Some(price);
            done.close_time_ms = Some(now_ms);
            done.close_reason = Some(reason.to_string());
            done.slipped = slipped;
            self.shared.closed.write().push(done);
        } else {
            pos.status = PositionStatus::Partial;
            pos.last_update_ms = now_ms;
        }
        drop(positions);

        self.shared.accounts.apply(
            &account_id,
            LedgerType::RealizedPnl,
            realized,
            Some(pos_id.clone()),
        )?;

        info!(
            position = %pos_id,
            account = %account_id,
            close_volume,
            price,
            realized,
            slipped,
            reason,
            "position closed"
        );

        Ok(CloseReport {
            position_id: pos_id,
            closed_volume: close_volume,
            close_price: price,
            realized_pnl: realized,
            slipped,
            reason: reason.to_string(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_mirror_fill(
        &self,
        account_id: &str,
        symbol: &str,
        side: Side,
        volume: f64,
        price: f64,
        ticket: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        now_ms: i64,
    ) -> CoreResult<MarketFill> {
        let account = self.shared.accounts.require(account_id)?;
        let spec = self.registry.require(symbol)?;
        // The external fill already happened; margin shortfall is logged,
        // not rejected.
        let metrics = self.shared.metrics(&self.registry, &account);
        let required = volume * spec.contract_size * price / account.leverage * spec.margin_rate;
        if metrics.free_margin < required {
            warn!(
                account = account_id,
                required,
                free = metrics.free_margin,
                "mirror fill recorded with insufficient free margin"
            );
        }
        let commission = spec.commission_per_lot * volume;
        self.fill_market(
            &account,
            symbol,
            side,
            volume,
            price,
            commission,
            stop_loss,
            take_profit,
            Some(ticket.to_string()),
            now_ms,
        )
    }

    // -------------------------------------------------------------------------
    // Tick reaction: marks, SL/TP, pending triggers, margin enforcement
    // -------------------------------------------------------------------------

    pub fn on_tick(&self, tick: &Tick, now_ms: i64) {
        let Ok(spec) = self.registry.require(&tick.symbol) else {
            return;
        };

        // 1. Mark positions, detect SL/TP triggers.
        struct Exit {
            position_id: String,
            price: f64,
            slipped: bool,
            reason: &'static str,
        }
        let mut exits: Vec<Exit> = Vec::new();
        let mut touched_accounts: Vec<String> = Vec::new();
        {
            let mut positions = self.shared.positions.write();
            for pos in positions
                .values_mut()
                .filter(|p| p.symbol == tick.symbol)
            {
                let prev = pos.last_eval_price;
                pos.mark(spec, tick.bid, tick.ask, now_ms);
                let price = pos.current_price;
                pos.last_eval_price = price;
                if !touched_accounts.contains(&pos.account_id) {
                    touched_accounts.push(pos.account_id.clone());
                }

                let sl_hit = pos.stop_loss.map_or(false, |sl| match pos.side {
                    Side::Buy => price <= sl,
                    Side::Sell => price >= sl,
                });
                let tp_hit = pos.take_profit.map_or(false, |tp| match pos.side {
                    Side::Buy => price >= tp,
                    Side::Sell => price <= tp,
                });
                // SL wins when both trigger on the same tick.
                let (level, reason) = if sl_hit {
                    (pos.stop_loss.unwrap(), "stop_loss")
                } else if tp_hit {
                    (pos.take_profit.unwrap(), "take_profit")
                } else {
                    continue;
                };

                // Close at the level when the observed path crossed it;
                // otherwise the market gapped over it and the fill slips to
                // the tick price.
                let crossed =
                    (prev - level) * (price - level) <= 0.0 || (prev - level).abs() < 1e-12;
                let (fill, slipped) = if crossed { (level, false) } else { (price, true) };
                exits.push(Exit {
                    position_id: pos.id.clone(),
                    price: fill,
                    slipped,
                    reason,
                });
            }
        }
        for exit in exits {
            if let Err(e) = self.close_position(
                &exit.position_id,
                None,
                exit.price,
                exit.slipped,
                exit.reason,
                now_ms,
            ) {
                warn!(position = %exit.position_id, error = %e, "sl/tp close failed");
            }
        }

        // 2. Pending order triggers.
        let triggered: Vec<(String, TriggerAction)> = {
            let mut orders = self.shared.orders.write();
            let mut fired = Vec::new();
            for order in orders.values_mut().filter(|o| o.symbol == tick.symbol) {
                if let Some(action) = order.evaluate(tick.bid, tick.ask) {
                    if matches!(action, TriggerAction::Fill(_)) {
                        fired.push((order.id.clone(), action));
                    }
                }
            }
            fired
        };
        for (order_id, action) in triggered {
            let TriggerAction::Fill(price) = action else {
                continue;
            };
            let order = {
                let mut orders = self.shared.orders.write();
                orders.remove(&order_id)
            };
            let Some(mut order) = order else { continue };
            let account = match self.shared.accounts.require(&order.account_id) {
                Ok(a) => a,
                Err(e) => {
                    warn!(order = %order_id, error = %e, "triggered order lost its account");
                    continue;
                }
            };
            match self.fill_pending(&account, &order, price, now_ms) {
                Ok(fill) => {
                    order.status = OrderStatus::Filled;
                    info!(order = %order_id, position = %fill.position_id, price, "pending order filled");
                    if !touched_accounts.contains(&order.account_id) {
                        touched_accounts.push(order.account_id.clone());
                    }
                }
                Err(e) => {
                    order.status = OrderStatus::Rejected;
                    warn!(order = %order_id, error = %e, kind = e.kind(), "pending order fill rejected");
                }
            }
        }

        // 3. Margin enforcement for accounts marked by this tick.
        for account_id in touched_accounts {
            self.enforce_margin(&account_id, now_ms);
        }
    }

    /// Margin-call / stop-out enforcement for one account.
    fn enforce_margin(&self, account_id: &str, now_ms: i64) {
        let Ok(account) = self.shared.accounts.require(account_id) else {
            return;
        };
        if account.status == AccountStatus::Suspended {
            return;
        }

        // Stop-out: close positions in decreasing-loss order until the
        // margin level recovers.
        loop {
            let Ok(account) = self.shared.accounts.require(account_id) else {
                break;
            };
            let metrics = self.shared.metrics(&self.registry, &account);
            let Some(level) = metrics.margin_level else {
                break;
            };
            if level >= self.cfg.stop_out_level {
                break;
            }
            let worst = {
                let positions = self.shared.positions.read();
                positions
                    .values()
                    .filter(|p| p.account_id == account_id)
                    .min_by(|a, b| {
                        a.unrealized_pnl
                            .partial_cmp(&b.unrealized_pnl)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|p| (p.id.clone(), p.current_price))
            };
            let Some((position_id, price)) = worst else {
                break;
            };
            warn!(account = account_id, position = %position_id, level, "stop out");
            if self
                .close_position(&position_id, None, price, false, "stop_out", now_ms)
                .is_err()
            {
                break;
            }
        }

        // Margin-call state tracking.
        let Ok(account) = self.shared.accounts.require(account_id) else {
            return;
        };
        let metrics = self.shared.metrics(&self.registry, &account);
        let level = metrics.margin_level;
        match account.status {
            AccountStatus::Open => {
                if level.map_or(false, |l| l < self.cfg.margin_call_level) {
                    warn!(account = account_id, level = ?level, "margin call");
                    self.shared
                        .accounts
                        .set_status(account_id, AccountStatus::MarginCall);
                }
            }
            AccountStatus::MarginCall => {
                if level.map_or(true, |l| l >= self.cfg.margin_call_level) {
                    self.shared
                        .accounts
                        .set_status(account_id, AccountStatus::Open);
                }
            }
            AccountStatus::Suspended => {}
        }
    }

    // -------------------------------------------------------------------------
    // Swap accrual & DAY expiry
    // -------------------------------------------------------------------------

    /// Charge daily swap on every open position. Triple on the configured
    /// weekday to cover the weekend.
    pub fn charge_swap(&self, now_ms: i64) {
        let broker_now = Utc
            .timestamp_millis_opt(now_ms)
            .single()
            .unwrap_or_else(Utc::now)
            + ChronoDuration::minutes(self.cfg.broker_utc_offset_minutes as i64);
        let weekday = broker_now.weekday().num_days_from_monday() as u8;
        let multiplier = if weekday == self.cfg.swap_triple_weekday {
            3.0
        } else {
            1.0
        };

        let charges: Vec<(String, String, f64)> = {
            let mut positions = self.shared.positions.write();
            positions
                .values_mut()
                .filter_map(|pos| {
                    let spec = self.registry.get(&pos.symbol)?;
                    let rate = match pos.side {
                        Side::Buy => spec.swap_long,
                        Side::Sell => spec.swap_short,
                    };
                    let amount = rate * pos.volume * multiplier;
                    pos.swap += amount;
                    Some((pos.account_id.clone(), pos.id.clone(), amount))
                })
                .collect()
        };
        let count = charges.len();
        for (account_id, position_id, amount) in charges {
            if let Err(e) =
                self.shared
                    .accounts
                    .apply(&account_id, LedgerType::Swap, amount, Some(position_id))
            {
                warn!(account = %account_id, error = %e, "swap ledger append failed");
            }
        }
        if count > 0 {
            info!(positions = count, multiplier, "swap charged");
        }
    }

    /// Expire DAY orders at the broker's session end.
    pub fn expire_day_orders(&self, _now_ms: i64) {
        let mut orders = self.shared.orders.write();
        let expired: Vec<String> = orders
            .values()
            .filter(|o| o.tif == TimeInForce::Day)
            .map(|o| o.id.clone())
            .collect();
        for id in &expired {
            if let Some(mut order) = orders.remove(id) {
                order.status = OrderStatus::Expired;
                info!(order = %id, "day order expired");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Account gate for new orders: suspended and margin-called accounts
    /// cannot open exposure.
    fn gate_account(&self, account_id: &str) -> CoreResult<Account> {
        let account = self.shared.accounts.require(account_id)?;
        match account.status {
            AccountStatus::Open => Ok(account),
            AccountStatus::MarginCall => Err(CoreError::MarginCall),
            AccountStatus::Suspended => {
                Err(CoreError::AccountSuspended(account_id.to_string()))
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
    use crate::config::EngineConfig;

    const NOW: i64 = 1_704_456_000_000;

    fn tick(symbol: &str, bid: f64, ask: f64, seq: u64) -> Tick {
        Tick {
            symbol: symbol.into(),
            bid,
            ask,
            spread: ask - bid,
            timestamp_ms: NOW,
            sources: vec!["lp".into()],
            seq,
        }
    }

    fn engine() -> Engine {
        engine_with(MarginMode::Hedging)
    }

    fn engine_with(mode: MarginMode) -> Engine {
        let registry = Arc::new(SymbolRegistry::builtin());
        let tick_store = Arc::new(TickStore::new(1_000, None));
        let (engine, _handle, _rx) = Engine::new(registry, tick_store, EngineConfig::default());
        engine
            .shared
            .accounts
            .provision("acc-1", "USD", 10_000.0, 100.0, mode, true);
        engine
    }

    fn market(engine: &Engine, side: Side, volume: f64, sl: Option<f64>, tp: Option<f64>) -> CoreResult<MarketFill> {
        engine.handle_market(
            MarketOrderRequest {
                account_id: "acc-1".into(),
                symbol: "EURUSD".into(),
                side,
                volume,
                stop_loss: sl,
                take_profit: tp,
            },
            NOW,
        )
    }

    #[test]
    fn simple_buy_close_at_profit() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));

        let fill = market(&engine, Side::Buy, 0.10, None, None).unwrap();
        assert!((fill.price - 1.0902).abs() < 1e-9);
        assert!((fill.commission - 0.50).abs() < 1e-9);

        engine.tick_store.append(tick("EURUSD", 1.0950, 1.0952, 2));
        engine.on_tick(&tick("EURUSD", 1.0950, 1.0952, 2), NOW);

        let report = engine
            .handle_close("acc-1", &fill.position_id, None, NOW)
            .unwrap();
        assert!((report.realized_pnl - 48.0).abs() < 1e-6);
        assert!(!report.slipped);

        let account = engine.shared.accounts.get("acc-1").unwrap();
        assert!((account.balance - 10_047.50).abs() < 1e-6);

        // Ledger: deposit, commission, realized pnl — in that order.
        let entries = engine.shared.accounts.entries_for("acc-1", 10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].entry_type, LedgerType::Commission);
        assert_eq!(entries[2].entry_type, LedgerType::RealizedPnl);
        assert!(engine.shared.accounts.verify_ledger("acc-1"));

        // Closed record carries the realized pnl and a ledger reference.
        let closed = engine.shared.closed_for("acc-1", 10);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].status, PositionStatus::Closed);
        assert_eq!(entries[2].reference.as_deref(), Some(closed[0].id.as_str()));
    }

    #[test]
    fn stop_loss_closes_at_level_not_tick() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        let fill = market(&engine, Side::Buy, 0.10, Some(1.0880), None).unwrap();

        engine.on_tick(&tick("EURUSD", 1.0879, 1.0881, 2), NOW);

        let closed = engine.shared.closed_for("acc-1", 10);
        assert_eq!(closed.len(), 1);
        let pos = &closed[0];
        assert_eq!(pos.id, fill.position_id);
        assert!((pos.close_price.unwrap() - 1.0880).abs() < 1e-9);
        assert!(!pos.slipped);
        assert_eq!(pos.close_reason.as_deref(), Some("stop_loss"));
        // (1.0880 − 1.0902) / 0.0001 × 10 × 0.10 = −22.00
        assert!((pos.realized_pnl - (-22.0)).abs() < 1e-6);
    }

    #[test]
    fn sl_wins_over_tp_on_same_tick() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        // Absurd bracket both sides of which the next tick satisfies.
        market(&engine, Side::Buy, 0.10, Some(1.0950), Some(1.0940)).unwrap();
        engine.on_tick(&tick("EURUSD", 1.0945, 1.0947, 2), NOW);
        let closed = engine.shared.closed_for("acc-1", 10);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].close_reason.as_deref(), Some("stop_loss"));
    }

    #[test]
    fn gap_over_level_slips_to_tick_price() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        // SL already beyond the first evaluated price: the path never
        // crossed the level.
        let fill = market(&engine, Side::Buy, 0.10, Some(1.0910), None).unwrap();
        assert!(fill.position_id.len() > 10);
        engine.on_tick(&tick("EURUSD", 1.0895, 1.0897, 2), NOW);
        let closed = engine.shared.closed_for("acc-1", 10);
        assert_eq!(closed.len(), 1);
        assert!(closed[0].slipped);
        assert!((closed[0].close_price.unwrap() - 1.0895).abs() < 1e-9);
    }

    #[test]
    fn round_trip_close_costs_commission_only() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0902, 1.0902, 1));
        let fill = market(&engine, Side::Buy, 0.10, None, None).unwrap();
        engine
            .handle_close("acc-1", &fill.position_id, None, NOW)
            .unwrap();
        let account = engine.shared.accounts.get("acc-1").unwrap();
        // Zero-spread tick: open and close at 1.0902 — only commission paid.
        assert!((account.balance - (10_000.0 - 0.50)).abs() < 1e-6);
    }

    #[test]
    fn partial_close_keeps_open_price() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        let fill = market(&engine, Side::Buy, 0.10, None, None).unwrap();
        engine.tick_store.append(tick("EURUSD", 1.0950, 1.0952, 2));

        let report = engine
            .handle_close("acc-1", &fill.position_id, Some(0.04), NOW)
            .unwrap();
        // 48 pips × 10 × 0.04 = 19.20
        assert!((report.realized_pnl - 19.2).abs() < 1e-6);

        let positions = engine.shared.open_positions_for("acc-1");
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert_eq!(pos.status, PositionStatus::Partial);
        assert!((pos.volume - 0.06).abs() < 1e-9);
        assert!((pos.open_price - 1.0902).abs() < 1e-9);
    }

    #[test]
    fn insufficient_margin_rejected() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        // 100 lots needs ~109k margin against 10k equity.
        let err = market(&engine, Side::Buy, 100.0, None, None).unwrap_err();
        assert_eq!(err.kind(), "InsufficientMargin");
    }

    #[test]
    fn missing_and_stale_price_rejected() {
        let engine = engine();
        let err = market(&engine, Side::Buy, 0.10, None, None).unwrap_err();
        assert_eq!(err.kind(), "NoLiquidity");

        let mut old = tick("EURUSD", 1.0900, 1.0902, 1);
        old.timestamp_ms = NOW - 10_000;
        engine.tick_store.append(old);
        let err = market(&engine, Side::Buy, 0.10, None, None).unwrap_err();
        assert_eq!(err.kind(), "StalePrice");
    }

    #[test]
    fn invalid_volume_rejected() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        let err = market(&engine, Side::Buy, 0.013, None, None).unwrap_err();
        assert_eq!(err.kind(), "InvalidVolume");
    }

    #[test]
    fn netting_extends_at_vwap_and_flips() {
        let engine = engine_with(MarginMode::Netting);
        engine.tick_store.append(tick("EURUSD", 1.0898, 1.0900, 1));
        market(&engine, Side::Buy, 0.10, None, None).unwrap();

        engine.tick_store.append(tick("EURUSD", 1.0918, 1.0920, 2));
        market(&engine, Side::Buy, 0.10, None, None).unwrap();

        let positions = engine.shared.open_positions_for("acc-1");
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert!((pos.volume - 0.20).abs() < 1e-9);
        assert!((pos.open_price - 1.0910).abs() < 1e-9); // VWAP of 1.0900/1.0920

        // Opposite 0.30 reduces 0.20 and flips 0.10 short.
        engine.tick_store.append(tick("EURUSD", 1.0930, 1.0932, 3));
        let fill = market(&engine, Side::Sell, 0.30, None, None).unwrap();
        let positions = engine.shared.open_positions_for("acc-1");
        assert_eq!(positions.len(), 1);
        let pos = &positions[0];
        assert_eq!(pos.side, Side::Sell);
        assert!((pos.volume - 0.10).abs() < 1e-9);
        assert!((pos.open_price - 1.0930).abs() < 1e-9);
        assert_eq!(fill.position_id, pos.id);

        // Realized on the reduced 0.20: (1.0930 − 1.0910) × 0.20 / pip × 10 = 40.
        let entries = engine.shared.accounts.entries_for("acc-1", 50);
        let realized: f64 = entries
            .iter()
            .filter(|e| e.entry_type == LedgerType::RealizedPnl)
            .map(|e| e.amount)
            .sum();
        assert!((realized - 40.0).abs() < 1e-6);
        assert!(engine.shared.accounts.verify_ledger("acc-1"));
    }

    #[test]
    fn hedging_allows_opposing_positions() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        market(&engine, Side::Buy, 0.10, None, None).unwrap();
        market(&engine, Side::Sell, 0.10, None, None).unwrap();
        assert_eq!(engine.shared.open_positions_for("acc-1").len(), 2);
    }

    #[test]
    fn pending_limit_fills_on_trigger_tick() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        let order = engine
            .handle_pending(
                PendingOrderRequest {
                    account_id: "acc-1".into(),
                    symbol: "EURUSD".into(),
                    order_type: OrderType::Limit,
                    side: Side::Buy,
                    volume: 0.10,
                    limit_price: Some(1.0890),
                    stop_price: None,
                    trail_distance: None,
                    stop_loss: None,
                    take_profit: None,
                    tif: TimeInForce::Gtc,
                },
                NOW,
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(engine.shared.orders_for("acc-1").len(), 1);

        // Not yet.
        engine.on_tick(&tick("EURUSD", 1.0893, 1.0895, 2), NOW);
        assert_eq!(engine.shared.open_positions_for("acc-1").len(), 0);

        // Ask reaches the limit.
        engine.on_tick(&tick("EURUSD", 1.0888, 1.0890, 3), NOW);
        assert!(engine.shared.orders_for("acc-1").is_empty());
        let positions = engine.shared.open_positions_for("acc-1");
        assert_eq!(positions.len(), 1);
        assert!((positions[0].open_price - 1.0890).abs() < 1e-9);
    }

    #[test]
    fn ioc_cancels_when_not_marketable() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        let order = engine
            .handle_pending(
                PendingOrderRequest {
                    account_id: "acc-1".into(),
                    symbol: "EURUSD".into(),
                    order_type: OrderType::Limit,
                    side: Side::Buy,
                    volume: 0.10,
                    limit_price: Some(1.0890),
                    stop_price: None,
                    trail_distance: None,
                    stop_loss: None,
                    take_profit: None,
                    tif: TimeInForce::Ioc,
                },
                NOW,
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(engine.shared.orders_for("acc-1").is_empty());

        // Marketable IOC fills immediately.
        let order = engine
            .handle_pending(
                PendingOrderRequest {
                    account_id: "acc-1".into(),
                    symbol: "EURUSD".into(),
                    order_type: OrderType::Limit,
                    side: Side::Buy,
                    volume: 0.10,
                    limit_price: Some(1.0905),
                    stop_price: None,
                    trail_distance: None,
                    stop_loss: None,
                    take_profit: None,
                    tif: TimeInForce::Ioc,
                },
                NOW,
            )
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(engine.shared.open_positions_for("acc-1").len(), 1);
    }

    #[test]
    fn limit_without_price_is_malformed() {
        let engine = engine();
        let err = engine
            .handle_pending(
                PendingOrderRequest {
                    account_id: "acc-1".into(),
                    symbol: "EURUSD".into(),
                    order_type: OrderType::Limit,
                    side: Side::Buy,
                    volume: 0.10,
                    limit_price: None,
                    stop_price: None,
                    trail_distance: None,
                    stop_loss: None,
                    take_profit: None,
                    tif: TimeInForce::Gtc,
                },
                NOW,
            )
            .unwrap_err();
        assert_eq!(err.kind(), "MalformedMessage");
    }

    #[test]
    fn day_orders_expire() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        for tif in [TimeInForce::Day, TimeInForce::Gtc] {
            engine
                .handle_pending(
                    PendingOrderRequest {
                        account_id: "acc-1".into(),
                        symbol: "EURUSD".into(),
                        order_type: OrderType::Limit,
                        side: Side::Buy,
                        volume: 0.10,
                        limit_price: Some(1.0800),
                        stop_price: None,
                        trail_distance: None,
                        stop_loss: None,
                        take_profit: None,
                        tif,
                    },
                    NOW,
                )
                .unwrap();
        }
        engine.expire_day_orders(NOW);
        let remaining = engine.shared.orders_for("acc-1");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tif, TimeInForce::Gtc);
    }

    #[test]
    fn swap_accrual_charges_by_side_and_triples() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.0900, 1.0902, 1));
        market(&engine, Side::Buy, 0.10, None, None).unwrap();
        market(&engine, Side::Sell, 0.20, None, None).unwrap();

        // 2024-01-03 was a Wednesday (triple day, weekday index 2).
        let wednesday_ms = 1_704_283_200_000;
        engine.charge_swap(wednesday_ms);

        let entries = engine.shared.accounts.entries_for("acc-1", 50);
        let swaps: Vec<&LedgerEntry> = entries
            .iter()
            .filter(|e| e.entry_type == LedgerType::Swap)
            .collect();
        assert_eq!(swaps.len(), 2);
        // Long: −2.5 × 0.10 × 3 = −0.75; short: 0.5 × 0.20 × 3 = 0.30.
        let total: f64 = swaps.iter().map(|e| e.amount).sum();
        assert!((total - (-0.75 + 0.30)).abs() < 1e-6);

        // A Thursday charge is single.
        let before = engine.shared.accounts.get("acc-1").unwrap().balance;
        engine.charge_swap(wednesday_ms + 24 * 3_600_000);
        let after = engine.shared.accounts.get("acc-1").unwrap().balance;
        assert!((after - before - (-0.25 + 0.10)).abs() < 1e-6);
        assert!(engine.shared.accounts.verify_ledger("acc-1"));
    }

    #[test]
    fn stop_out_closes_worst_loss_first() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.1000, 1.1002, 1));
        engine.tick_store.append(tick("GBPUSD", 1.2500, 1.2502, 1));
        let loser = market(&engine, Side::Buy, 2.0, None, None).unwrap();
        let winner = engine
            .handle_market(
                MarketOrderRequest {
                    account_id: "acc-1".into(),
                    symbol: "GBPUSD".into(),
                    side: Side::Buy,
                    volume: 0.10,
                    stop_loss: None,
                    take_profit: None,
                },
                NOW,
            )
            .unwrap();

        // EURUSD collapses: the 2-lot long bleeds far past stop-out.
        engine.on_tick(&tick("EURUSD", 1.0520, 1.0522, 2), NOW);

        let closed = engine.shared.closed_for("acc-1", 10);
        assert!(closed.iter().any(|p| p.id == loser.position_id));
        assert_eq!(
            closed
                .iter()
                .filter(|p| p.close_reason.as_deref() == Some("stop_out"))
                .count(),
            1
        );
        // The profitable GBP position survives.
        let open = engine.shared.open_positions_for("acc-1");
        assert!(open.iter().any(|p| p.id == winner.position_id));
    }

    #[test]
    fn margin_call_blocks_new_orders_and_recovers() {
        let engine = engine();
        engine.tick_store.append(tick("EURUSD", 1.1000, 1.1002, 1));
        market(&engine, Side::Buy, 4.0, None, None).unwrap();

        // Drop far enough for margin call (level < 100%) but above stop-out.
        engine.on_tick(&tick("EURUSD", 1.0850, 1.0852, 2), NOW);
        let account = engine.shared.accounts.get("acc-1").unwrap();
        assert_eq!(account.status, AccountStatus::MarginCall);

        let err = market(&engine, Side::Buy, 0.10, None, None).unwrap_err();
        assert_eq!(err.kind(), "MarginCall");

        // Recovery restores the account.
        engine.on_tick(&tick("EURUSD", 1.1050, 1.1052, 3), NOW);
        let account = engine.shared.accounts.get("acc-1").unwrap();
        assert_eq!(account.status, AccountStatus::Open);
    }

    #[test]
    fn mirror_fill_records_hedge_ticket() {
        let engine = engine();
        let fill = engine
            .handle_mirror_fill(
                "acc-1",
                "EURUSD",
                Side::Buy,
                0.10,
                1.0903,
                "LP-TICKET-9",
                None,
                None,
                NOW,
            )
            .unwrap();
        let positions = engine.shared.open_positions_for("acc-1");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].hedge_ticket.as_deref(), Some("LP-TICKET-9"));
        assert_eq!(positions[0].id, fill.position_id);
    }

    #[test]
    fn swap_time_parsing() {
        assert_eq!(parse_swap_time("22:00"), Some((22, 0)));
        assert_eq!(parse_swap_time("7:30"), Some((7, 30)));
        assert_eq!(parse_swap_time("24:00"), None);
        assert_eq!(parse_swap_time("nope"), None);
    }
}
