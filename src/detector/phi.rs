use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

use super::FailureDetector;
use crate::core::{Error, Result};

/// Parameters of the phi accrual detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhiAccrualConfig {
    /// Phi value above which the peer is considered unavailable
    pub threshold: f64,
    /// Number of inter-arrival samples kept
    pub max_sample_size: usize,
    /// Lower bound of the standard deviation used in the phi computation
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub min_std_deviation: Duration,
    /// Silence tolerated on top of the observed mean interval
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub acceptable_heartbeat_pause: Duration,
    /// Interval assumed before any real sample exists
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub first_heartbeat_estimate: Duration,
}

impl Default for PhiAccrualConfig {
    fn default() -> Self {
        PhiAccrualConfig {
            threshold: 7.0,
            max_sample_size: 100,
            min_std_deviation: Duration::from_millis(100),
            acceptable_heartbeat_pause: Duration::from_secs(120),
            first_heartbeat_estimate: Duration::from_secs(1),
        }
    }
}

impl PhiAccrualConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0) {
            return Err(Error::config("phi threshold must be greater than zero"));
        }
        if self.max_sample_size == 0 {
            return Err(Error::config("max_sample_size must be greater than zero"));
        }
        if self.min_std_deviation.is_zero() {
            return Err(Error::config("min_std_deviation must be greater than zero"));
        }
        if self.first_heartbeat_estimate.is_zero() {
            return Err(Error::config(
                "first_heartbeat_estimate must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Bounded history of heartbeat inter-arrival times in milliseconds
#[derive(Debug, Clone)]
struct HeartbeatHistory {
    max_sample_size: usize,
    intervals: VecDeque<f64>,
    interval_sum: f64,
    squared_interval_sum: f64,
}

impl HeartbeatHistory {
    fn new(max_sample_size: usize) -> Self {
        HeartbeatHistory {
            max_sample_size,
            intervals: VecDeque::with_capacity(max_sample_size),
            interval_sum: 0.0,
            squared_interval_sum: 0.0,
        }
    }

    fn push(&mut self, interval: f64) {
        if self.intervals.len() >= self.max_sample_size {
            if let Some(dropped) = self.intervals.pop_front() {
                self.interval_sum -= dropped;
                self.squared_interval_sum -= dropped * dropped;
            }
        }
        self.intervals.push_back(interval);
        self.interval_sum += interval;
        self.squared_interval_sum += interval * interval;
    }

    fn mean(&self) -> f64 {
        self.interval_sum / self.intervals.len() as f64
    }

    fn variance(&self) -> f64 {
        let mean = self.mean();
        (self.squared_interval_sum / self.intervals.len() as f64 - mean * mean).max(0.0)
    }

    fn std_deviation(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Phi accrual failure detector.
///
/// The suspicion level `phi` grows with the time elapsed since the last
/// heartbeat, scaled by the mean and deviation of previously observed
/// inter-arrival times. The peer is available while `phi < threshold`.
pub struct PhiAccrualFailureDetector {
    config: PhiAccrualConfig,
    history: HeartbeatHistory,
    last_heartbeat: Option<Instant>,
}

impl PhiAccrualFailureDetector {
    pub fn new(config: PhiAccrualConfig) -> Self {
        let history = Self::first_heartbeat(&config);
        PhiAccrualFailureDetector {
            config,
            history,
            last_heartbeat: None,
        }
    }

    /// Seeds the history so the first real interval is judged against the estimate
    fn first_heartbeat(config: &PhiAccrualConfig) -> HeartbeatHistory {
        let mean = config.first_heartbeat_estimate.as_secs_f64() * 1000.0;
        let std_deviation = mean / 4.0;
        let mut history = HeartbeatHistory::new(config.max_sample_size);
        history.push(mean - std_deviation);
        history.push(mean + std_deviation);
        history
    }

    /// `true` once `interval` uses up two thirds of a non-zero acceptable pause
    fn nears_acceptable_pause(&self, interval: Duration) -> bool {
        let pause = self.config.acceptable_heartbeat_pause;
        !pause.is_zero() && interval >= pause * 2 / 3
    }

    /// Current suspicion level
    pub fn phi(&self) -> f64 {
        match self.last_heartbeat {
            None => 0.0,
            Some(last) => {
                let elapsed = last.elapsed().as_secs_f64() * 1000.0;
                let mean = self.history.mean()
                    + self.config.acceptable_heartbeat_pause.as_secs_f64() * 1000.0;
                let std_deviation = self
                    .history
                    .std_deviation()
                    .max(self.config.min_std_deviation.as_secs_f64() * 1000.0);
                phi(elapsed, mean, std_deviation)
            }
        }
    }
}

/// Logistic approximation of the cumulative normal distribution
fn phi(time_diff: f64, mean: f64, std_deviation: f64) -> f64 {
    let y = (time_diff - mean) / std_deviation;
    let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
    if time_diff > mean {
        -(e / (1.0 + e)).log10()
    } else {
        -(1.0 - 1.0 / (1.0 + e)).log10()
    }
}

impl FailureDetector for PhiAccrualFailureDetector {
    fn heartbeat(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_heartbeat {
            let interval = now.duration_since(last);
            // Only intervals ending while the peer is trusted enter the history.
            if self.is_available() {
                if self.nears_acceptable_pause(interval) {
                    warn!(
                        interval_ms = interval.as_millis() as u64,
                        "heartbeat interval is growing too large"
                    );
                }
                self.history.push(interval.as_secs_f64() * 1000.0);
            }
        }
        self.last_heartbeat = Some(now);
    }

    fn is_available(&self) -> bool {
        self.phi() < self.config.threshold
    }

    fn is_monitoring(&self) -> bool {
        self.last_heartbeat.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn config() -> PhiAccrualConfig {
        PhiAccrualConfig {
            threshold: 7.0,
            max_sample_size: 10,
            min_std_deviation: Duration::from_millis(100),
            acceptable_heartbeat_pause: Duration::ZERO,
            first_heartbeat_estimate: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_phi_function() {
        assert!((phi(1000.0, 1000.0, 250.0) - 0.301).abs() < 0.01);
        assert!(phi(3000.0, 1000.0, 250.0) > 20.0);
        assert!(phi(200.0, 1000.0, 250.0) < 0.01);
    }

    #[test]
    fn test_history_window() {
        let mut history = HeartbeatHistory::new(2);
        history.push(100.0);
        history.push(200.0);
        history.push(300.0);
        assert_eq!(history.intervals.len(), 2);
        assert!((history.mean() - 250.0).abs() < f64::EPSILON);
        assert!((history.std_deviation() - 50.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmonitored_is_available() {
        let detector = PhiAccrualFailureDetector::new(config());
        assert_eq!(detector.phi(), 0.0);
        assert!(detector.is_available());
        assert!(!detector.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_regular_heartbeats_stay_available() {
        let mut detector = PhiAccrualFailureDetector::new(config());
        for _ in 0..5 {
            detector.heartbeat();
            advance(Duration::from_secs(1)).await;
            assert!(detector.is_available());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_makes_unavailable() {
        let mut detector = PhiAccrualFailureDetector::new(config());
        detector.heartbeat();
        advance(Duration::from_secs(1)).await;
        detector.heartbeat();

        advance(Duration::from_millis(500)).await;
        let early = detector.phi();
        advance(Duration::from_secs(3)).await;
        let late = detector.phi();

        assert!(late > early);
        assert!(!detector.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acceptable_pause_extends_tolerance() {
        let mut config = config();
        config.acceptable_heartbeat_pause = Duration::from_secs(10);
        let mut detector = PhiAccrualFailureDetector::new(config);
        detector.heartbeat();
        advance(Duration::from_secs(5)).await;
        assert!(detector.is_available());
    }

    #[test]
    fn test_pause_warning_threshold() {
        let detector = PhiAccrualFailureDetector::new(config());
        assert!(!detector.nears_acceptable_pause(Duration::ZERO));
        assert!(!detector.nears_acceptable_pause(Duration::from_secs(1)));

        let mut config = config();
        config.acceptable_heartbeat_pause = Duration::from_secs(3);
        let detector = PhiAccrualFailureDetector::new(config);
        assert!(!detector.nears_acceptable_pause(Duration::from_secs(1)));
        assert!(detector.nears_acceptable_pause(Duration::from_secs(2)));
    }

    #[test]
    fn test_config_validation() {
        assert!(PhiAccrualConfig::default().validate().is_ok());
        let mut bad = config();
        bad.threshold = 0.0;
        assert!(bad.validate().is_err());
    }
}
