//! Connection lifecycle manager and watchdog.
//!
//! `start`, `stop` and `restart` never return errors to the caller: outcomes are a
//! bool plus observable state. All three serialize on the `active` lock and `start`
//! closes any previous connection first, so two connections never deliver at once.
//! Each connection gets a generation number; deliveries from a superseded generation
//! are dropped.
//!
//! The watchdog ticks on its own task and restarts the connection when no event has
//! arrived for longer than the stale threshold, when `maxConsecutiveFailures` starts
//! in a row have failed, or when the transport reported itself closed. Connects and
//! stops are both bounded, so the lock is never held indefinitely, and a tick that
//! finds a lifecycle operation in flight returns `Busy` instead of waiting for it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{Connection, ConnectionError, Connector};
use crate::clock::Clock;
use crate::config::WatchdogConfig;
use crate::routing::{DispatchOutcome, EventRouter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Start failed or the transport dropped; waiting for the watchdog.
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub stale_threshold_ms: i64,
    pub max_consecutive_failures: u32,
    pub stop_timeout: Duration,
    pub connect_timeout: Duration,
}

impl WatchdogSettings {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs.max(1)),
            stale_threshold_ms: i64::try_from(config.stale_threshold_secs.saturating_mul(1000))
                .unwrap_or(i64::MAX),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            stop_timeout: Duration::from_secs(config.stop_timeout_secs),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs.max(1)),
        }
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self::from_config(&WatchdogConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    Stale { age_ms: i64 },
    RepeatedFailures { failures: u32 },
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    Healthy,
    Restarted(RestartTrigger),
    RestartFailed(RestartTrigger),
    /// A start or stop was still running; nothing was done.
    Busy,
    /// Manager has been shut down.
    Skipped,
}

/// Observable connection health, consumed by the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub state: ConnectionState,
    pub last_event_at_ms: i64,
    pub consecutive_failures: u32,
    pub dedup_entries: usize,
    /// Frames received but not decodable as event envelopes.
    pub undecodable_frames: u64,
    pub last_error: Option<String>,
    /// Most recent failed or timed-out stop. Survives the start that follows it.
    pub last_stop_error: Option<String>,
}

struct Status {
    state: ConnectionState,
    last_error: Option<String>,
    last_stop_error: Option<String>,
}

/// State shared between the manager and the sinks it hands to connections.
struct Shared {
    status: Mutex<Status>,
    consecutive_failures: AtomicU32,
    last_event_at_ms: AtomicI64,
    generation: AtomicU64,
    undecodable_frames: AtomicU64,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState, error: Option<String>) {
        let mut status = self.status();
        status.state = state;
        if error.is_some() {
            status.last_error = error;
        }
    }

    fn record_stop_error(&self, error: String) {
        self.status().last_stop_error = Some(error);
    }
}

/// Handed to a connection; forwards envelopes to the router and stamps liveness.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
    router: Arc<EventRouter>,
    clock: Arc<dyn Clock>,
    generation: u64,
}

impl EventSink {
    /// False once the manager has moved on to a newer connection.
    pub fn is_current(&self) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Deliver one raw envelope. Returns `None` if this sink's connection was superseded.
    pub fn deliver(&self, raw: &Value) -> Option<DispatchOutcome> {
        if !self.is_current() {
            log::debug!(
                "connection: dropping delivery from superseded connection #{}",
                self.generation
            );
            return None;
        }
        self.shared
            .last_event_at_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
        Some(self.router.dispatch(raw))
    }

    /// Report a frame that could not be decoded as an envelope. It does not count as
    /// liveness, so a connection receiving only such frames goes stale.
    pub fn undecodable_frame(&self, detail: &str) {
        if !self.is_current() {
            return;
        }
        let total = self.shared.undecodable_frames.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "connection: #{} dropped undecodable frame ({} so far): {}",
            self.generation,
            total,
            detail
        );
    }

    /// Report that the transport ended on its own. Counts as a failure.
    pub fn connection_lost(&self, reason: &str) {
        if !self.is_current() {
            return;
        }
        let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        log::warn!(
            "connection: #{} lost ({}), consecutive failures {}",
            self.generation,
            reason,
            failures
        );
        self.shared
            .set_state(ConnectionState::Degraded, Some(format!("connection lost: {}", reason)));
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    router: Arc<EventRouter>,
    clock: Arc<dyn Clock>,
    settings: WatchdogSettings,
    shared: Arc<Shared>,
    active: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    shut_down: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        router: Arc<EventRouter>,
        clock: Arc<dyn Clock>,
        settings: WatchdogSettings,
    ) -> Self {
        let shared = Arc::new(Shared {
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                last_error: None,
                last_stop_error: None,
            }),
            consecutive_failures: AtomicU32::new(0),
            last_event_at_ms: AtomicI64::new(clock.now_ms()),
            generation: AtomicU64::new(0),
            undecodable_frames: AtomicU64::new(0),
        });
        Self {
            connector,
            router,
            clock,
            settings,
            shared,
            active: tokio::sync::Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.status().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn last_event_at_ms(&self) -> i64 {
        self.shared.last_event_at_ms.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> HealthSnapshot {
        let status = self.shared.status();
        HealthSnapshot {
            state: status.state,
            last_event_at_ms: self.last_event_at_ms(),
            consecutive_failures: self.consecutive_failures(),
            dedup_entries: self.router.dedup().len(),
            undecodable_frames: self.shared.undecodable_frames.load(Ordering::SeqCst),
            last_error: status.last_error.clone(),
            last_stop_error: status.last_stop_error.clone(),
        }
    }

    /// Open the connection, replacing any existing one. Returns false on failure and
    /// increments the failure counter; resets it on success. A connect that does not
    /// finish within the connect timeout is a failure.
    pub async fn start(&self, reason: &str) -> bool {
        let mut active = self.active.lock().await;
        if let Some(old) = active.take() {
            self.shared.generation.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = self.close_bounded(old).await {
                log::warn!("connection: closing previous connection failed: {}", e);
                self.shared.record_stop_error(e.to_string());
            }
        }

        self.shared.set_state(ConnectionState::Connecting, None);
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let sink = EventSink {
            shared: self.shared.clone(),
            router: self.router.clone(),
            clock: self.clock.clone(),
            generation,
        };
        log::info!("connection: starting #{} ({})", generation, reason);
        let connected =
            match tokio::time::timeout(self.settings.connect_timeout, self.connector.connect(sink))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::ConnectTimeout(self.settings.connect_timeout)),
            };
        match connected {
            Ok(conn) => {
                *active = Some(conn);
                self.shared.consecutive_failures.store(0, Ordering::SeqCst);
                // A fresh connection is the new liveness baseline.
                self.shared
                    .last_event_at_ms
                    .store(self.clock.now_ms(), Ordering::SeqCst);
                let mut status = self.shared.status();
                status.state = ConnectionState::Connected;
                status.last_error = None;
                log::info!("connection: #{} connected", generation);
                true
            }
            Err(e) => {
                let failures = self.shared.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                log::warn!(
                    "connection: start #{} failed ({} consecutive): {}",
                    generation,
                    failures,
                    e
                );
                self.shared
                    .set_state(ConnectionState::Degraded, Some(format!("start failed: {}", e)));
                false
            }
        }
    }

    /// Close the current connection, bounded by the stop timeout.
    pub async fn stop(&self, reason: &str) -> Result<(), ConnectionError> {
        let mut active = self.active.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let result = match active.take() {
            Some(conn) => {
                log::info!("connection: stopping ({})", reason);
                self.close_bounded(conn).await
            }
            None => Ok(()),
        };
        self.shared.set_state(ConnectionState::Disconnected, None);
        result
    }

    /// Best-effort stop followed by start. A failed stop never blocks the start.
    pub async fn restart(&self, reason: &str) -> bool {
        if let Err(e) = self.stop(reason).await {
            log::warn!("connection: stop before restart failed: {}", e);
            self.shared.record_stop_error(e.to_string());
        }
        self.start(reason).await
    }

    /// Stop for good; later watchdog ticks do nothing.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        if let Err(e) = self.stop("shutdown").await {
            log::debug!("connection: stop on shutdown: {}", e);
        }
    }

    async fn close_bounded(&self, conn: Box<dyn Connection>) -> Result<(), ConnectionError> {
        match tokio::time::timeout(self.settings.stop_timeout, conn.close()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::StopTimeout(self.settings.stop_timeout)),
        }
    }

    fn restart_trigger(&self) -> Option<RestartTrigger> {
        let age_ms = self.clock.now_ms().saturating_sub(self.last_event_at_ms());
        if age_ms > self.settings.stale_threshold_ms {
            return Some(RestartTrigger::Stale { age_ms });
        }
        let failures = self.consecutive_failures();
        if failures >= self.settings.max_consecutive_failures {
            return Some(RestartTrigger::RepeatedFailures { failures });
        }
        let alive = match self.active.try_lock() {
            Ok(active) => active.as_ref().is_some_and(|conn| conn.is_alive()),
            // A start or stop is in flight; judge the result on the next tick.
            Err(_) => return None,
        };
        if !alive {
            return Some(RestartTrigger::ConnectionLost);
        }
        None
    }

    /// One watchdog inspection. A successful restart resets the failure counter; a
    /// failed one leaves it counting so the next tick retries.
    pub async fn watchdog_tick(&self) -> WatchdogAction {
        if self.shut_down.load(Ordering::SeqCst) {
            return WatchdogAction::Skipped;
        }
        if self.active.try_lock().is_err() {
            log::debug!("watchdog: lifecycle operation in progress, skipping tick");
            return WatchdogAction::Busy;
        }
        let Some(trigger) = self.restart_trigger() else {
            return WatchdogAction::Healthy;
        };
        log::warn!("watchdog: restarting connection ({:?})", trigger);
        if self.restart(&format!("watchdog: {:?}", trigger)).await {
            WatchdogAction::Restarted(trigger)
        } else {
            log::warn!(
                "watchdog: restart failed, {} consecutive failure(s); retrying next tick",
                self.consecutive_failures()
            );
            WatchdogAction::RestartFailed(trigger)
        }
    }

    /// Run the watchdog on its own timer until `shutdown` flips to true.
    pub fn spawn_watchdog(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            log::info!(
                "watchdog: running every {:?} (stale after {} ms, max failures {})",
                manager.settings.interval,
                manager.settings.stale_threshold_ms,
                manager.settings.max_consecutive_failures
            );
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.watchdog_tick().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("watchdog: stopped");
        })
    }
}
