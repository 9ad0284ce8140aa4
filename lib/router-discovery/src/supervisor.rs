//! Reconciliation supervisor
//!
//! The supervisor owns the reconciliation mode. For the current mode it runs
//! exactly one periodic task, and it watches that task's signals with a
//! watchdog timeout:
//!
//! - `DiscoveryBacked`: an error signal, a task that stops, or a silent
//!   watchdog period switches to `SelfChecked`.
//! - `SelfChecked`: a `DiscoveryAvailable` signal switches back to
//!   `DiscoveryBacked`; a silent watchdog period or a stopped task restarts
//!   `SelfChecked`.
//!
//! The previous task is aborted before the next one is started. A task that
//! fails to start is restarted only after a delay of at least one interval.

use crate::reconcile::Reconciler;
use crate::DiscoveryError;
use router_core::CoreError;
use router_proxy::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const SIGNAL_BUFFER: usize = 16;
const MIN_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Reconciliation mode
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Registry follows the discovery provider
    DiscoveryBacked,
    /// Registry follows the gateway's own health probes
    SelfChecked,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::DiscoveryBacked => "discovery_backed",
            Mode::SelfChecked => "self_checked",
        }
    }

    fn gauge_value(&self) -> i64 {
        match self {
            Mode::DiscoveryBacked => 0,
            Mode::SelfChecked => 1,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress and failure signals sent by mode tasks
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Signal {
    Success,
    DiscoveryAvailable,
    ScheduleStartFailure,
    RequestError,
    ResponseError,
    DecodeError,
}

impl From<&DiscoveryError> for Signal {
    fn from(err: &DiscoveryError) -> Self {
        match err {
            DiscoveryError::Config(_) | DiscoveryError::Request(_) => Signal::RequestError,
            DiscoveryError::Response { .. } => Signal::ResponseError,
            DiscoveryError::Decode(_) => Signal::DecodeError,
        }
    }
}

/// Reconciliation timing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Period of both reconciliation loops
    #[serde(with = "humantime_serde", default = "default_interval")]
    pub interval: Duration,
    /// Longest silence tolerated before the watchdog switches modes
    #[serde(with = "humantime_serde", default = "default_watchdog_timeout")]
    pub watchdog_timeout: Duration,
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_watchdog_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            watchdog_timeout: default_watchdog_timeout(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> router_core::Result<()> {
        if self.interval.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "reconcile interval must be positive".to_string(),
            ));
        }
        if self.watchdog_timeout.is_zero() {
            return Err(CoreError::InvalidConfiguration(
                "reconcile watchdog_timeout must be positive".to_string(),
            ));
        }
        if self.watchdog_timeout <= self.interval {
            warn!(
                "Watchdog timeout {:?} does not exceed reconcile interval {:?}; modes will flap",
                self.watchdog_timeout, self.interval
            );
        }
        Ok(())
    }
}

/// Runs the reconciliation mode state machine
pub struct Supervisor {
    reconciler: Arc<Reconciler>,
    config: ReconcileConfig,
    metrics: MetricsCollector,
}

/// Handle to a running supervisor
///
/// Dropping the handle stops the supervisor.
pub struct SupervisorHandle {
    mode: watch::Receiver<Mode>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Current reconciliation mode
    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    /// Receiver notified on every mode change
    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode.clone()
    }

    /// Wait until the supervisor reaches `mode`
    pub async fn wait_for_mode(&self, mode: Mode) {
        let mut receiver = self.mode.clone();
        // Only fails once the supervisor is gone
        let _ = receiver.wait_for(|current| *current == mode).await;
    }

    /// Stop the supervisor and its mode task
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Reconciliation supervisor failed: {}", e);
            }
        }
    }
}

impl Supervisor {
    pub fn new(
        reconciler: Arc<Reconciler>,
        config: ReconcileConfig,
        metrics: MetricsCollector,
    ) -> router_core::Result<Self> {
        config.validate()?;
        Ok(Self {
            reconciler,
            config,
            metrics,
        })
    }

    /// `DiscoveryBacked` when a provider is configured, otherwise `SelfChecked`
    pub fn initial_mode(&self) -> Mode {
        if self.reconciler.provider().is_some() {
            Mode::DiscoveryBacked
        } else {
            Mode::SelfChecked
        }
    }

    /// Start the supervisor on the current runtime
    pub fn spawn(self) -> SupervisorHandle {
        let initial = self.initial_mode();
        let (mode_tx, mode_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!("Starting reconciliation in {} mode", initial);
        self.metrics.reconcile_mode.set(initial.gauge_value());
        let task = tokio::spawn(self.run(mode_tx, shutdown_rx));

        SupervisorHandle {
            mode: mode_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    async fn run(self, mode_tx: watch::Sender<Mode>, mut shutdown: watch::Receiver<bool>) {
        let mut mode = *mode_tx.borrow();

        loop {
            let (signal_tx, mut signals) = mpsc::channel(SIGNAL_BUFFER);
            let task = self.start_mode_task(mode, signal_tx);

            let (next, start_failed) = tokio::select! {
                outcome = self.watch(mode, &mut signals) => outcome,
                _ = shutdown.changed() => {
                    task.abort();
                    info!("Reconciliation supervisor stopped");
                    return;
                }
            };
            task.abort();

            if next == mode {
                info!("Restarting {} reconciliation", mode);
            } else {
                info!("Reconciliation mode {} -> {}", mode, next);
                self.metrics
                    .record_transition(mode.as_str(), next.as_str(), next.gauge_value());
                mode_tx.send_replace(next);
            }
            mode = next;

            if start_failed {
                let delay = self.config.interval.max(MIN_RESTART_DELAY);
                debug!("Delaying {} reconciliation start by {:?}", next, delay);
                tokio::select! {
                    _ = time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        info!("Reconciliation supervisor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Wait on the mode task's signals and return the mode to run next,
    /// along with whether the task failed to start or run at all
    async fn watch(&self, mode: Mode, signals: &mut mpsc::Receiver<Signal>) -> (Mode, bool) {
        loop {
            match time::timeout(self.config.watchdog_timeout, signals.recv()).await {
                Ok(Some(Signal::Success)) => {
                    debug!("{} pass succeeded", mode);
                }
                Ok(Some(Signal::DiscoveryAvailable)) => {
                    if mode == Mode::SelfChecked {
                        info!("Discovery provider is reachable again");
                        return (Mode::DiscoveryBacked, false);
                    }
                }
                Ok(Some(Signal::ScheduleStartFailure)) => {
                    warn!("{} reconciliation failed to start", mode);
                    return (Mode::SelfChecked, true);
                }
                Ok(Some(signal)) => {
                    warn!("{} reconciliation reported {:?}", mode, signal);
                    return (Mode::SelfChecked, false);
                }
                Ok(None) => {
                    warn!("{} reconciliation task stopped", mode);
                    return (Mode::SelfChecked, true);
                }
                Err(_) => {
                    warn!(
                        "No {} reconciliation progress for {:?}",
                        mode, self.config.watchdog_timeout
                    );
                    return (Mode::SelfChecked, false);
                }
            }
        }
    }

    fn start_mode_task(&self, mode: Mode, signals: mpsc::Sender<Signal>) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let interval = self.config.interval;
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            if interval.is_zero() {
                metrics.record_pass(mode.as_str(), "start_failure");
                let _ = signals.send(Signal::ScheduleStartFailure).await;
                return;
            }
            match mode {
                Mode::DiscoveryBacked => discovery_loop(reconciler, interval, signals, metrics).await,
                Mode::SelfChecked => self_check_loop(reconciler, interval, signals, metrics).await,
            }
        })
    }
}

async fn discovery_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    signals: mpsc::Sender<Signal>,
    metrics: MetricsCollector,
) {
    let provider = match reconciler.provider() {
        Some(provider) => provider.clone(),
        None => {
            error!("Discovery-backed reconciliation started without a provider");
            metrics.record_pass(Mode::DiscoveryBacked.as_str(), "start_failure");
            let _ = signals.send(Signal::ScheduleStartFailure).await;
            return;
        }
    };

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let signal = match reconciler.discovery_pass(provider.as_ref()).await {
            Ok(report) => {
                debug!(
                    "Discovery pass over {} services: +{} -{}",
                    report.services, report.added, report.removed
                );
                metrics.record_pass(Mode::DiscoveryBacked.as_str(), "success");
                Signal::Success
            }
            Err(e) => {
                warn!("Discovery pass failed: {}", e);
                metrics.record_pass(Mode::DiscoveryBacked.as_str(), "error");
                Signal::from(&e)
            }
        };

        // After a failure this task stops making progress
        let failed = signal != Signal::Success;
        if signals.send(signal).await.is_err() || failed {
            return;
        }
    }
}

async fn self_check_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    signals: mpsc::Sender<Signal>,
    metrics: MetricsCollector,
) {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if let Some(provider) = reconciler.provider() {
            if reconciler.discovery_available(provider.as_ref()).await {
                metrics.record_pass(Mode::SelfChecked.as_str(), "discovery_available");
                let _ = signals.send(Signal::DiscoveryAvailable).await;
                return;
            }
        }

        let report = reconciler.self_check_pass().await;
        debug!(
            "Self check pass over {} services removed {}",
            report.services, report.removed
        );
        metrics.record_pass(Mode::SelfChecked.as_str(), "success");

        if signals.send(Signal::Success).await.is_err() {
            return;
        }
    }
}
