//! Per-route admission limiting
//!
//! Each limiter bounds admissions to `max_count` per sliding `window` and,
//! once the window is full, keeps at least `min_spacing` between two
//! consecutive admissions. Callers queue on a bounded channel of capacity
//! `max_count`, so a full queue pushes back on the caller. A single
//! background task hands out admissions and sleeps until the exact instant
//! the next one becomes eligible.

use router_core::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::debug;

/// Largest accepted `max_count`; it sizes both the caller queue and the window
pub const MAX_ADMISSION_COUNT: usize = 1 << 20;

/// Admission limiter configuration for one route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum admissions per window
    pub max_count: usize,
    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Minimum gap between consecutive admissions once the window is full
    #[serde(with = "humantime_serde", default)]
    pub min_spacing: Duration,
}

impl AdmissionConfig {
    pub fn validate(&self) -> router_core::Result<()> {
        if self.max_count == 0 {
            return Err(CoreError::InvalidConfiguration(
                "admission max_count must be at least 1".to_string(),
            ));
        }
        if self.max_count > MAX_ADMISSION_COUNT {
            return Err(CoreError::InvalidConfiguration(format!(
                "admission max_count {} exceeds {}",
                self.max_count, MAX_ADMISSION_COUNT
            )));
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    #[error("Admission limiter for route {0} is closed")]
    Closed(String),
}

/// Sliding window of admission timestamps
///
/// Holds at most `max_count` timestamps, oldest first.
#[derive(Debug)]
pub struct AdmissionWindow {
    max_count: usize,
    window: Duration,
    min_spacing: Duration,
    timestamps: VecDeque<Instant>,
}

impl AdmissionWindow {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            max_count: config.max_count,
            window: config.window,
            min_spacing: config.min_spacing,
            timestamps: VecDeque::new(),
        }
    }

    /// When the next admission may happen, or `None` if it may happen at `now`
    pub fn next_eligible(&self, now: Instant) -> Option<Instant> {
        if self.timestamps.len() < self.max_count {
            return None;
        }
        let (oldest, newest) = match (self.timestamps.front(), self.timestamps.back()) {
            (Some(oldest), Some(newest)) => (*oldest, *newest),
            _ => return None,
        };

        let eligible = (oldest + self.window).max(newest + self.min_spacing);
        if eligible <= now {
            None
        } else {
            Some(eligible)
        }
    }

    /// Record an admission at `now`, evicting the oldest timestamp when full
    pub fn record(&mut self, now: Instant) {
        if self.timestamps.len() >= self.max_count {
            self.timestamps.pop_front();
        }
        self.timestamps.push_back(now);
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }
}

/// Admission limiter for one route
pub struct AdmissionLimiter {
    route: String,
    queue: mpsc::Sender<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl AdmissionLimiter {
    /// Create a limiter and start its admission task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(route: impl Into<String>, config: AdmissionConfig) -> router_core::Result<Self> {
        config.validate()?;
        let route = route.into();
        let (queue, waiters) = mpsc::channel(config.max_count);
        let task = tokio::spawn(Self::run(route.clone(), AdmissionWindow::new(&config), waiters));

        debug!(
            "Admission limiter for {}: {} per {:?}, spacing {:?}",
            route, config.max_count, config.window, config.min_spacing
        );

        Ok(Self { route, queue, task })
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Wait until this caller is admitted
    ///
    /// Blocks while the admission queue is full.
    pub async fn admit(&self) -> Result<(), AdmissionError> {
        let (admitted, wait) = oneshot::channel();
        self.queue
            .send(admitted)
            .await
            .map_err(|_| AdmissionError::Closed(self.route.clone()))?;
        wait.await
            .map_err(|_| AdmissionError::Closed(self.route.clone()))
    }

    /// Stop the admission task; queued and future callers get `Closed`
    pub fn close(&self) {
        self.task.abort();
    }

    async fn run(
        route: String,
        mut window: AdmissionWindow,
        mut waiters: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        while let Some(waiter) = waiters.recv().await {
            if let Some(eligible) = window.next_eligible(Instant::now()) {
                time::sleep_until(eligible).await;
            }

            // A caller that stopped waiting does not use up a slot
            if waiter.send(()).is_ok() {
                window.record(Instant::now());
            }
        }
        debug!("Admission loop for {} stopped", route);
    }
}

impl Drop for AdmissionLimiter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn config(max_count: usize, window_ms: u64, spacing_ms: u64) -> AdmissionConfig {
        AdmissionConfig {
            max_count,
            window: Duration::from_millis(window_ms),
            min_spacing: Duration::from_millis(spacing_ms),
        }
    }

    #[test]
    fn test_config_from_yaml() {
        let parsed: AdmissionConfig =
            serde_yaml::from_str("max_count: 10\nwindow: 1s\nmin_spacing: 50ms\n").unwrap();
        assert_eq!(parsed, config(10, 1000, 50));

        let parsed: AdmissionConfig = serde_yaml::from_str("max_count: 2\nwindow: 1m\n").unwrap();
        assert_eq!(parsed.min_spacing, Duration::ZERO);
    }

    #[test]
    fn test_zero_max_count_rejected() {
        assert!(config(0, 1000, 0).validate().is_err());
        assert!(config(1, 1000, 0).validate().is_ok());
    }

    #[tokio::test]
    async fn test_oversized_max_count_rejected() {
        assert!(config(MAX_ADMISSION_COUNT, 1000, 0).validate().is_ok());
        assert!(config(MAX_ADMISSION_COUNT + 1, 1000, 0).validate().is_err());

        let result = AdmissionLimiter::new("api", config(usize::MAX / 2, 1000, 0));
        assert!(matches!(result, Err(CoreError::InvalidConfiguration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_warm_up_admits_immediately() {
        let mut window = AdmissionWindow::new(&config(3, 1000, 100));
        let now = Instant::now();
        for _ in 0..3 {
            assert_eq!(window.next_eligible(now), None);
            window.record(now);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.next_eligible(now), Some(now + Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_spacing_dominates_after_slide() {
        let mut window = AdmissionWindow::new(&config(2, 1000, 300));
        let t0 = Instant::now();
        window.record(t0);
        window.record(t0 + Duration::from_millis(900));

        // oldest + window = 1000ms, newest + spacing = 1200ms
        assert_eq!(
            window.next_eligible(t0 + Duration::from_millis(1000)),
            Some(t0 + Duration::from_millis(1200))
        );
        assert_eq!(window.next_eligible(t0 + Duration::from_millis(1200)), None);

        window.record(t0 + Duration::from_millis(1200));
        assert_eq!(window.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limiter_respects_window_and_spacing() {
        let cfg = config(3, 1000, 100);
        let limiter = Arc::new(AdmissionLimiter::new("api", cfg.clone()).unwrap());

        let mut handles = Vec::new();
        for _ in 0..9 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.admit().await.unwrap();
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap());
        }
        admitted.sort();

        // No more than max_count admissions in any half-open window
        for pair in admitted.windows(cfg.max_count + 1) {
            assert!(pair[cfg.max_count] - pair[0] >= cfg.window);
        }
        // Spacing holds once the window has filled
        for pair in admitted[cfg.max_count - 1..].windows(2) {
            assert!(pair[1] - pair[0] >= cfg.min_spacing);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_window_blocks_caller() {
        let limiter = AdmissionLimiter::new("api", config(1, 3_600_000, 0)).unwrap();
        limiter.admit().await.unwrap();

        let blocked = time::timeout(Duration::from_secs(10), limiter.admit()).await;
        assert!(blocked.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_limiter_rejects_callers() {
        let limiter = AdmissionLimiter::new("api", config(1, 1000, 0)).unwrap();
        limiter.close();
        tokio::task::yield_now().await;

        assert_eq!(
            limiter.admit().await,
            Err(AdmissionError::Closed("api".to_string()))
        );
    }
}
