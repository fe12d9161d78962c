// =============================================================================
// Supervisor — component lifecycle, restart policy, health aggregation
// =============================================================================
//
// Owns the adapter reconnect policy (backoff base 3 s, cap 60 s, alarm after
// 10 straight failures), the periodic engine timers (swap accrual, DAY
// expiry, session sweep), and the health registry behind `/health`. A
// component is unhealthy when it stopped making forward progress within its
// watchdog interval.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::aggregator::AggregatorStats;
use crate::config::EngineConfig;
use crate::distributor::Distributor;
use crate::engine::EngineHandle;
use crate::lp::{AdapterState, SharedAdapter};
use crate::sessions::SessionManager;

/// Adapter restart backoff: base 3 s doubling to a 60 s cap.
fn restart_delay(attempt: u64) -> Duration {
    let secs = (3u64 << attempt.min(5)).min(60);
    Duration::from_secs(secs)
}

/// Consecutive failures before the supervisor raises the alarm.
const MAX_RESTART_ATTEMPTS: u64 = 10;

/// No quotes for this long while streaming marks an adapter stalled.
const ADAPTER_WATCHDOG_MS: i64 = 60_000;

// ---------------------------------------------------------------------------
// Health registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    pub state: String,
    pub healthy: bool,
    /// Milliseconds since epoch of the last observed forward progress.
    pub last_progress_ms: i64,
    pub restarts: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub server_time: i64,
    pub components: Vec<ComponentHealth>,
}

pub struct Supervisor {
    components: RwLock<HashMap<String, ComponentHealth>>,
    shutting_down: AtomicBool,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            components: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn report(
        &self,
        name: &str,
        state: impl Into<String>,
        healthy: bool,
        detail: Option<String>,
    ) {
        let now = Utc::now().timestamp_millis();
        let mut components = self.components.write();
        let entry = components
            .entry(name.to_string())
            .or_insert_with(|| ComponentHealth {
                name: name.to_string(),
                state: String::new(),
                healthy: true,
                last_progress_ms: now,
                restarts: 0,
                detail: None,
            });
        entry.state = state.into();
        entry.detail = detail;
        if healthy {
            entry.last_progress_ms = now;
        }
        entry.healthy = healthy;
    }

    pub fn record_restart(&self, name: &str) {
        if let Some(entry) = self.components.write().get_mut(name) {
            entry.restarts += 1;
        }
    }

    pub fn health(&self) -> HealthReport {
        let components: Vec<ComponentHealth> =
            self.components.read().values().cloned().collect();
        let all_healthy = components.iter().all(|c| c.healthy);
        HealthReport {
            status: if all_healthy { "ok" } else { "degraded" },
            server_time: Utc::now().timestamp_millis(),
            components,
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Adapter supervision
// ---------------------------------------------------------------------------

/// Keep one adapter connected until shutdown. Fatal (non-retryable) errors
/// stop the loop and leave the component flagged for the operator.
pub async fn supervise_adapter(supervisor: Arc<Supervisor>, adapter: SharedAdapter) {
    let name = format!("adapter:{}", adapter.id());
    let mut attempt: u64 = 0;

    loop {
        if supervisor.is_shutting_down() {
            return;
        }
        supervisor.report(&name, "CONNECTING", true, None);
        match adapter.connect().await {
            Ok(()) => {
                attempt = 0;
                supervisor.report(&name, adapter.status().state.to_string(), true, None);
            }
            Err(e) => {
                supervisor.record_restart(&name);
                if !e.is_retryable_transport() {
                    error!(
                        adapter = adapter.id(),
                        error = %e,
                        kind = e.kind(),
                        "adapter failed permanently, operator intervention required"
                    );
                    supervisor.report(&name, "ERROR", false, Some(format!("{}: {e}", e.kind())));
                    return;
                }
                attempt += 1;
                if attempt == MAX_RESTART_ATTEMPTS {
                    error!(
                        adapter = adapter.id(),
                        attempts = attempt,
                        "adapter restart limit reached, raising alarm"
                    );
                }
                let delay = restart_delay(attempt);
                supervisor.report(
                    &name,
                    "RECONNECTING",
                    attempt < MAX_RESTART_ATTEMPTS,
                    Some(format!("attempt {attempt}: {e}")),
                );
                warn!(
                    adapter = adapter.id(),
                    attempt,
                    delay_s = delay.as_secs(),
                    error = %e,
                    "adapter reconnect scheduled"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        // Connected: watch the session until it drops or dies.
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if supervisor.is_shutting_down() {
                return;
            }
            let status = adapter.status();
            match status.state {
                AdapterState::Streaming | AdapterState::LoggedIn | AdapterState::Connected => {
                    let now = Utc::now().timestamp_millis();
                    let stalled = status.last_quote_ms > 0
                        && now - status.last_quote_ms > ADAPTER_WATCHDOG_MS;
                    supervisor.report(
                        &name,
                        status.state.to_string(),
                        !stalled,
                        status.last_error.clone(),
                    );
                }
                AdapterState::Error => {
                    // Session classified its own failure; retry only the
                    // transport class.
                    let detail = status.last_error.clone().unwrap_or_default();
                    let fatal = detail.starts_with("AuthRejected")
                        || detail.starts_with("SequenceTooLow");
                    if fatal {
                        error!(adapter = adapter.id(), detail = %detail, "adapter fatal");
                        supervisor.report(&name, "ERROR", false, Some(detail));
                        return;
                    }
                    supervisor.record_restart(&name);
                    break;
                }
                AdapterState::Disconnected | AdapterState::Connecting => {
                    supervisor.record_restart(&name);
                    break;
                }
            }
        }

        attempt += 1;
        let delay = restart_delay(attempt);
        warn!(adapter = adapter.id(), delay_s = delay.as_secs(), "adapter session dropped, restarting");
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Periodic engine timers
// ---------------------------------------------------------------------------

/// Milliseconds until the next broker-time occurrence of `HH:MM`.
fn ms_until_broker_time(hour: u32, minute: u32, broker_offset_minutes: i32) -> i64 {
    let broker_now = Utc::now() + ChronoDuration::minutes(broker_offset_minutes as i64);
    let today_target = broker_now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("validated HH:MM");
    let mut target = today_target;
    if broker_now.naive_utc() >= today_target {
        target += ChronoDuration::days(1);
    }
    (target - broker_now.naive_utc()).num_milliseconds().max(0)
}

/// Swap accrual at the configured broker time, daily.
pub async fn run_swap_scheduler(engine: EngineHandle, cfg: EngineConfig) {
    let (hour, minute) =
        crate::engine::parse_swap_time(&cfg.swap_time).unwrap_or((22, 0));
    loop {
        let wait = ms_until_broker_time(hour, minute, cfg.broker_utc_offset_minutes);
        info!(in_ms = wait, "next swap accrual scheduled");
        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        engine.swap_accrual().await;
        // Skip past the minute so the next computation lands tomorrow.
        tokio::time::sleep(Duration::from_secs(61)).await;
    }
}

/// DAY-order expiry at broker midnight.
pub async fn run_day_expiry(engine: EngineHandle, cfg: EngineConfig) {
    loop {
        let wait = ms_until_broker_time(0, 0, cfg.broker_utc_offset_minutes);
        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
        engine.expire_day_orders().await;
        tokio::time::sleep(Duration::from_secs(61)).await;
    }
}

/// Expired-session sweeper.
pub async fn run_session_sweeper(sessions: Arc<SessionManager>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        sessions.sweep();
    }
}

/// Periodic health refresh for the passive components.
pub async fn run_watchdog(
    supervisor: Arc<Supervisor>,
    aggregator_stats: Arc<AggregatorStats>,
    distributor: Arc<Distributor>,
    sessions: Arc<SessionManager>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        if supervisor.is_shutting_down() {
            return;
        }
        let agg = aggregator_stats.snapshot();
        let no_quote = agg.no_quote_symbols.len();
        supervisor.report(
            "aggregator",
            "RUNNING",
            true,
            Some(format!(
                "ticks={} outliers={} gaps={} no_quote={}",
                agg.ticks_published, agg.outliers_dropped, agg.gaps_detected, no_quote
            )),
        );
        let dist = distributor.snapshot();
        supervisor.report(
            "distributor",
            "RUNNING",
            true,
            Some(format!(
                "clients={} slow={} dropped={}",
                dist.clients, dist.slow_clients, dist.frames_dropped
            )),
        );
        supervisor.report(
            "sessions",
            "RUNNING",
            true,
            Some(format!("active={}", sessions.active_count())),
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_delay_backs_off_to_cap() {
        assert_eq!(restart_delay(0), Duration::from_secs(3));
        assert_eq!(restart_delay(1), Duration::from_secs(6));
        assert_eq!(restart_delay(2), Duration::from_secs(12));
        assert_eq!(restart_delay(4), Duration::from_secs(48));
        assert_eq!(restart_delay(5), Duration::from_secs(60));
        assert_eq!(restart_delay(50), Duration::from_secs(60));
    }

    #[test]
    fn health_aggregates_component_status() {
        let sup = Supervisor::new();
        sup.report("adapter:lp-a", "STREAMING", true, None);
        sup.report("aggregator", "RUNNING", true, None);
        assert_eq!(sup.health().status, "ok");

        sup.report("adapter:lp-a", "ERROR", false, Some("AuthRejected".into()));
        let report = sup.health();
        assert_eq!(report.status, "degraded");
        let adapter = report
            .components
            .iter()
            .find(|c| c.name == "adapter:lp-a")
            .unwrap();
        assert!(!adapter.healthy);
        assert_eq!(adapter.state, "ERROR");
    }

    #[test]
    fn restart_counter_increments() {
        let sup = Supervisor::new();
        sup.report("adapter:lp-a", "CONNECTING", true, None);
        sup.record_restart("adapter:lp-a");
        sup.record_restart("adapter:lp-a");
        let report = sup.health();
        let adapter = report
            .components
            .iter()
            .find(|c| c.name == "adapter:lp-a")
            .unwrap();
        assert_eq!(adapter.restarts, 2);
    }

    #[test]
    fn broker_time_scheduling_is_future() {
        let wait = ms_until_broker_time(12, 0, 0);
        assert!(wait >= 0);
        assert!(wait <= 24 * 3_600_000);
        // An offset shifts the target but keeps it within a day.
        let wait = ms_until_broker_time(12, 0, 180);
        assert!(wait <= 24 * 3_600_000);
    }
}
