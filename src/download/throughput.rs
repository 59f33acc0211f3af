//!
//! # Transfer-rate monitor
//! Approximates throughput by polling the total size of the destination tree.
//! It is operator feedback only, not byte accounting.
//!

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, info};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::download::util::scan_dir;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughputSample {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub destination_size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputSnapshot {
    /// Bytes per second over the last interval.
    pub instantaneous: f64,
    /// Mean of the rolling window, bytes per second.
    pub average: f64,
    /// Oldest first.
    pub history: Vec<f64>,
    #[serde(rename = "lastSample")]
    pub last_sample: Option<ThroughputSample>,
}

/// Rolling window of derived rates. The first sample after a reset only
/// establishes the baseline.
#[derive(Debug)]
pub struct ThroughputWindow {
    capacity: usize,
    previous_size: Option<u64>,
    last_rate: f64,
    history: VecDeque<f64>,
    last_sample: Option<ThroughputSample>,
}

impl ThroughputWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            previous_size: None,
            last_rate: 0.0,
            history: VecDeque::with_capacity(capacity),
            last_sample: None,
        }
    }

    /// Feed one folder-size observation taken `elapsed` after the previous one.
    /// Returns the derived rate, which is never negative.
    pub fn record(&mut self, size: u64, elapsed: Duration) -> f64 {
        self.last_sample = Some(ThroughputSample {
            timestamp: Utc::now().timestamp_millis(),
            destination_size_bytes: size,
        });

        let Some(previous) = self.previous_size.replace(size) else {
            self.last_rate = 0.0;
            return 0.0;
        };

        // Overwrites and partial writes can make the folder look smaller.
        let delta = size.saturating_sub(previous);
        let secs = elapsed.as_secs_f64();
        let rate = if secs > 0.0 { delta as f64 / secs } else { 0.0 };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(rate);
        self.last_rate = rate;
        rate
    }

    pub fn reset(&mut self) {
        self.previous_size = None;
        self.last_rate = 0.0;
        self.history.clear();
        self.last_sample = None;
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let average = if self.history.is_empty() {
            0.0
        } else {
            self.history.iter().sum::<f64>() / self.history.len() as f64
        };

        ThroughputSnapshot {
            instantaneous: self.last_rate,
            average,
            history: self.history.iter().copied().collect(),
            last_sample: self.last_sample,
        }
    }
}

pub struct TransferRateMonitor {
    interval: Duration,
    window: Arc<Mutex<ThroughputWindow>>,
    running: Mutex<Option<CancellationToken>>,
}

impl TransferRateMonitor {
    pub fn new(interval: Duration, capacity: usize) -> Self {
        Self {
            interval,
            window: Arc::new(Mutex::new(ThroughputWindow::new(capacity))),
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Begin sampling `destination`. Any previous sampling loop is stopped and
    /// its state discarded first.
    pub fn start(&self, destination: PathBuf) {
        self.stop();

        let token = CancellationToken::new();
        *self.running.lock() = Some(token.clone());

        let window = self.window.clone();
        let interval = self.interval;
        info!("Throughput monitor started for {:?}", destination);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_at: Option<Instant> = None;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stats = scan_dir(destination.clone()).await;
                let now = Instant::now();
                let elapsed = last_at.map(|at| now - at).unwrap_or(interval);
                last_at = Some(now);

                let mut guard = window.lock();
                // stop() cancels before it resets, so a late scan is dropped here.
                if token.is_cancelled() {
                    break;
                }
                let rate = guard.record(stats.size_bytes, elapsed);
                debug!("Destination {} bytes, {:.0} B/s", stats.size_bytes, rate);
            }
        });
    }

    /// Stop sampling and reset previous size, window and rate.
    pub fn stop(&self) {
        if let Some(token) = self.running.lock().take() {
            token.cancel();
            info!("Throughput monitor stopped");
        }
        self.window.lock().reset();
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        self.window.lock().snapshot()
    }
}

impl Drop for TransferRateMonitor {
    fn drop(&mut self) {
        if let Some(token) = self.running.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn should_use_first_sample_as_baseline() {
        let mut window = ThroughputWindow::new(4);
        assert_eq!(window.record(5_000, SECOND), 0.0);
        assert!(window.snapshot().history.is_empty());
        assert_eq!(window.record(6_000, SECOND), 1_000.0);
        assert_eq!(window.snapshot().history, vec![1_000.0]);
    }

    #[test]
    fn should_floor_shrinking_folder_to_zero() {
        let mut window = ThroughputWindow::new(4);
        window.record(10_000, SECOND);
        assert_eq!(window.record(4_000, SECOND), 0.0);
        // The shrunken size becomes the new baseline.
        assert_eq!(window.record(4_500, SECOND), 500.0);
        assert!(window.snapshot().history.iter().all(|r| *r >= 0.0));
    }

    #[test]
    fn should_evict_oldest_when_full() {
        let mut window = ThroughputWindow::new(3);
        let mut size = 0;
        window.record(size, SECOND);
        for step in [100, 200, 300, 400] {
            size += step;
            window.record(size, SECOND);
        }
        let snapshot = window.snapshot();
        assert_eq!(snapshot.history, vec![200.0, 300.0, 400.0]);
        assert_eq!(snapshot.instantaneous, 400.0);
        assert_eq!(snapshot.average, 300.0);
    }

    #[test]
    fn should_scale_by_elapsed_time() {
        let mut window = ThroughputWindow::new(3);
        window.record(0, SECOND);
        assert_eq!(window.record(1_000, Duration::from_secs(5)), 200.0);
        assert_eq!(window.record(1_500, Duration::ZERO), 0.0);
    }

    #[test]
    fn should_forget_everything_on_reset() {
        let mut window = ThroughputWindow::new(3);
        window.record(0, SECOND);
        window.record(1_000_000, SECOND);
        window.reset();
        assert_eq!(window.snapshot(), ThroughputSnapshot::default());
        // No stale baseline: a large folder is not read as a huge burst.
        assert_eq!(window.record(9_000_000, SECOND), 0.0);
    }

    #[tokio::test]
    async fn should_sample_destination_until_stopped() {
        let temp = TempDir::new().unwrap();
        let monitor = TransferRateMonitor::new(Duration::from_millis(20), 60);
        monitor.start(temp.path().to_path_buf());
        assert!(monitor.is_running());

        tokio::time::sleep(Duration::from_millis(60)).await;
        fs::write(temp.path().join("chunk"), vec![1u8; 4096]).unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let snapshot = monitor.snapshot();
        assert!(!snapshot.history.is_empty());
        assert!(snapshot.history.iter().any(|r| *r > 0.0));
        assert_eq!(snapshot.last_sample.unwrap().destination_size_bytes, 4096);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(monitor.snapshot(), ThroughputSnapshot::default());
    }
}
