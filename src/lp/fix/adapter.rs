// =============================================================================
// FIX adapter — LpAdapter over a FIX 4.4 session
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::session::{FixSession, SessionEnd};
use crate::config::{AdapterConfig, FixSessionConfig};
use crate::errors::{CoreError, CoreResult};
use crate::lp::{
    AdapterShared, AdapterState, AdapterStatus, LpAdapter, LpExecStatus, LpExecution, LpOrder,
};
use crate::types::Quote;

pub struct FixAdapter {
    shared: Arc<AdapterShared>,
    session: Arc<FixSession>,
    connect_timeout: Duration,
    place_timeout: Duration,
    /// Reader/writer task handles for the current connection.
    io_tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl FixAdapter {
    pub fn new(
        adapter_cfg: &AdapterConfig,
        fix_cfg: FixSessionConfig,
        quote_tx: mpsc::Sender<Quote>,
    ) -> Self {
        let shared = Arc::new(AdapterShared::new(adapter_cfg.id.clone(), quote_tx));
        shared.add_subscription_intent(&adapter_cfg.symbols);
        let session = Arc::new(FixSession::new(fix_cfg, shared.clone()));
        Self {
            shared,
            session,
            connect_timeout: Duration::from_secs(adapter_cfg.connect_timeout_secs),
            place_timeout: Duration::from_secs(adapter_cfg.place_timeout_secs),
            io_tasks: Mutex::new(Vec::new()),
        }
    }

    fn abort_io(&self) {
        for task in self.io_tasks.lock().drain(..) {
            task.abort();
        }
        self.session.detach_writer();
        self.session.fail_pending_orders();
    }
}

#[async_trait]
impl LpAdapter for FixAdapter {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn protocol(&self) -> &'static str {
        "fix44"
    }

    async fn connect(&self) -> CoreResult<()> {
        if matches!(
            self.shared.state(),
            AdapterState::Streaming | AdapterState::LoggedIn
        ) {
            return Ok(());
        }
        self.shared.set_state(AdapterState::Connecting);

        let addr = format!("{}:{}", self.session.cfg.host, self.session.cfg.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CoreError::Timeout(format!("connect to {addr}")))?
            .map_err(|e| CoreError::ConnectFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| CoreError::ConnectFailed(e.to_string()))?;
        self.shared.set_state(AdapterState::Connected);

        let (read_half, write_half) = stream.into_split();
        let writer_task = self.session.attach_writer(write_half);

        // Reader task: drives the session until it ends, then records why.
        let session = self.session.clone();
        let shared = self.shared.clone();
        let reader_task = tokio::spawn(async move {
            let end = session.clone().run_reader(read_half).await;
            session.detach_writer();
            session.fail_pending_orders();
            match end {
                SessionEnd::Transport(e) => {
                    warn!(adapter = %shared.id, error = %e, "fix session ended");
                    shared.record_error(&e);
                    shared.set_state(AdapterState::Disconnected);
                }
                SessionEnd::Fatal(e) => {
                    warn!(adapter = %shared.id, error = %e, "fix session fatal");
                    shared.record_error(&e);
                    shared.set_state(AdapterState::Error);
                }
            }
        });
        *self.io_tasks.lock() = vec![writer_task, reader_task];

        // Logon handshake.
        self.session.send_logon()?;
        let mut logged_in = self.session.logged_in_rx.clone();
        let logon_deadline = Duration::from_secs(self.session.cfg.logon_timeout_secs);
        let wait = tokio::time::timeout(logon_deadline, async {
            while !*logged_in.borrow() {
                if logged_in.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await;

        match wait {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                // Reader may have classified the refusal already.
                let state = self.shared.state();
                self.abort_io();
                if state == AdapterState::Error {
                    let err = CoreError::AuthRejected(
                        self.shared
                            .last_error
                            .read()
                            .clone()
                            .unwrap_or_else(|| "logon refused".into()),
                    );
                    return Err(err);
                }
                self.shared.set_state(AdapterState::Disconnected);
                return Err(CoreError::Timeout("fix logon".into()));
            }
        }
        self.shared.set_state(AdapterState::LoggedIn);

        // Resubscribe the standing intent.
        let symbols = self.shared.subscribed.read().clone();
        for symbol in &symbols {
            if let Err(e) = self.session.send_market_data_request(symbol) {
                self.abort_io();
                self.shared.set_state(AdapterState::Disconnected);
                return Err(e);
            }
        }
        self.shared.set_state(AdapterState::Streaming);
        info!(adapter = %self.shared.id, symbols = symbols.len(), "fix adapter streaming");
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        if self.session.is_logged_in() {
            let _ = self.session.send_logout("shutdown");
            // Give the Logout a moment on the wire before tearing down.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        self.abort_io();
        self.shared.set_state(AdapterState::Disconnected);
        Ok(())
    }

    async fn subscribe(&self, symbols: &[String]) -> CoreResult<()> {
        let added = self.shared.add_subscription_intent(symbols);
        if self.session.is_logged_in() {
            for symbol in &added {
                self.session.send_market_data_request(symbol)?;
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> CoreResult<()> {
        self.shared.remove_subscription_intent(symbols);
        if self.session.is_logged_in() {
            for symbol in symbols {
                self.session.send_market_data_unsubscribe(symbol)?;
            }
        }
        Ok(())
    }

    async fn place(&self, order: LpOrder) -> CoreResult<LpExecution> {
        if !self.session.is_logged_in() {
            return Err(CoreError::ConnectFailed("fix session not logged in".into()));
        }
        let tif = match order.tif {
            crate::types::TimeInForce::Gtc => "1",
            crate::types::TimeInForce::Ioc => "3",
            crate::types::TimeInForce::Fok => "4",
            crate::types::TimeInForce::Day => "0",
        };
        let rx = self.session.send_new_order_single(
            &order.cl_ord_id,
            &order.symbol,
            order.side,
            order.volume,
            order.limit_price,
            tif,
        )?;

        let exec = tokio::time::timeout(self.place_timeout, rx)
            .await
            .map_err(|_| CoreError::Timeout(format!("order {} place", order.cl_ord_id)))?
            .map_err(|_| CoreError::WriteError("session dropped order".into()))?;

        if exec.status == LpExecStatus::Rejected && exec.filled_volume == 0.0 {
            return Err(CoreError::NoLiquidity(
                exec.reject_reason
                    .clone()
                    .unwrap_or_else(|| order.symbol.clone()),
            ));
        }
        Ok(exec)
    }

    fn status(&self) -> AdapterStatus {
        self.shared.status(self.protocol())
    }
}
