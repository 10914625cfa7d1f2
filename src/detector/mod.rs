//! Failure detectors
//!
//! A failure detector is fed with heartbeat arrivals and answers whether the
//! monitored peer is still considered alive. Each association owns exactly one
//! detector; detectors are never shared.

mod deadline;
mod phi;

pub use self::deadline::{DeadlineConfig, DeadlineFailureDetector};
pub use self::phi::{PhiAccrualConfig, PhiAccrualFailureDetector};

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::Result;

/// Liveness oracle driven by received heartbeats
pub trait FailureDetector {
    /// Records the arrival of a liveness signal at the current instant
    fn heartbeat(&mut self);

    /// Current liveness judgment; an unmonitored resource is available
    fn is_available(&self) -> bool;

    /// Returns `true` once at least one heartbeat has been recorded
    fn is_monitoring(&self) -> bool;
}

/// Owned detector handed to an association
pub type BoxedFailureDetector = Box<dyn FailureDetector + Send>;

/// Selects and parameterizes the detector built for each association
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureDetectorConfig {
    Phi(PhiAccrualConfig),
    Deadline(DeadlineConfig),
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        FailureDetectorConfig::Phi(PhiAccrualConfig::default())
    }
}

impl FailureDetectorConfig {
    /// Builds a fresh detector for one association
    pub fn build(&self, heartbeat_interval: Duration) -> BoxedFailureDetector {
        match self {
            FailureDetectorConfig::Phi(config) => {
                Box::new(PhiAccrualFailureDetector::new(config.clone()))
            }
            FailureDetectorConfig::Deadline(config) => Box::new(DeadlineFailureDetector::new(
                heartbeat_interval + config.acceptable_heartbeat_pause,
            )),
        }
    }

    /// Checks that the detector parameters are usable
    pub fn validate(&self) -> Result<()> {
        match self {
            FailureDetectorConfig::Phi(config) => config.validate(),
            FailureDetectorConfig::Deadline(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_phi() {
        assert!(matches!(
            FailureDetectorConfig::default(),
            FailureDetectorConfig::Phi(_)
        ));
    }

    #[test]
    fn test_config_json_tagging() {
        let json = r#"{ "kind": "deadline", "acceptable_heartbeat_pause": 2.0 }"#;
        let config: FailureDetectorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(
            config,
            FailureDetectorConfig::Deadline(DeadlineConfig {
                acceptable_heartbeat_pause: Duration::from_secs(2),
            })
        );

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["kind"], "deadline");
    }

    #[test]
    fn test_built_detector_starts_available() {
        for config in [
            FailureDetectorConfig::default(),
            FailureDetectorConfig::Deadline(DeadlineConfig::default()),
        ] {
            let detector = config.build(Duration::from_secs(1));
            assert!(detector.is_available());
            assert!(!detector.is_monitoring());
        }
    }
}
