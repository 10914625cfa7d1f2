use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::FailureDetector;

/// Parameters of the deadline detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Silence tolerated on top of the heartbeat interval
    #[serde(serialize_with = "crate::core::serde::serialize_duration")]
    #[serde(deserialize_with = "crate::core::serde::deserialize_duration")]
    pub acceptable_heartbeat_pause: Duration,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        DeadlineConfig {
            acceptable_heartbeat_pause: Duration::from_secs(20),
        }
    }
}

/// Reports the peer unavailable once no heartbeat arrived within a fixed deadline.
pub struct DeadlineFailureDetector {
    deadline: Duration,
    last_heartbeat: Option<Instant>,
}

impl DeadlineFailureDetector {
    pub fn new(deadline: Duration) -> Self {
        DeadlineFailureDetector {
            deadline,
            last_heartbeat: None,
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }

    fn is_available(&self) -> bool {
        match self.last_heartbeat {
            None => true,
            Some(last) => last.elapsed() <= self.deadline,
        }
    }

    fn is_monitoring(&self) -> bool {
        self.last_heartbeat.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expiry() {
        let mut detector = DeadlineFailureDetector::new(Duration::from_secs(3));
        assert!(detector.is_available());

        detector.heartbeat();
        advance(Duration::from_secs(2)).await;
        assert!(detector.is_available());

        advance(Duration::from_secs(2)).await;
        assert!(!detector.is_available());

        detector.heartbeat();
        assert!(detector.is_available());
        assert!(detector.is_monitoring());
    }
}
