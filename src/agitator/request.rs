// Caller request and the agitation plan derived from it
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AgitationSettings;

/// "Agitate for this exposure"
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgitationRequest {
    /// Exposure time in seconds
    #[serde(rename = "exp_time")]
    pub exposure_time: f64,
    /// Seconds before the agitation stops on its own
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Rotations of motor 1 during the exposure
    #[serde(default)]
    pub rotations: Option<f64>,
    /// Motor 1 frequency in Hz, used when `rotations` is absent
    #[serde(default)]
    pub frequency: Option<f64>,
    /// Motor 2 frequency in Hz; derived from motor 1 when absent
    #[serde(default)]
    pub frequency2: Option<f64>,
}

impl AgitationRequest {
    pub fn new(exposure_time: f64) -> Self {
        Self {
            exposure_time,
            ..Default::default()
        }
    }

    pub fn with_rotations(mut self, rotations: f64) -> Self {
        self.rotations = Some(rotations);
        self
    }

    pub fn with_frequency(mut self, frequency: f64) -> Self {
        self.frequency = Some(frequency);
        self
    }

    pub fn with_frequency2(mut self, frequency: f64) -> Self {
        self.frequency2 = Some(frequency);
        self
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve frequencies and timeout, or say why the request means "stop"
    pub fn plan(&self, settings: &AgitationSettings) -> Result<AgitationPlan, InvalidRequest> {
        let exposure = self.exposure_time;
        if exposure.is_nan() || exposure <= 0.0 {
            return Err(InvalidRequest::Exposure(exposure));
        }

        let frequency1 = match (self.rotations, self.frequency) {
            (Some(rotations), _) if rotations.is_nan() || rotations <= 0.0 => {
                return Err(InvalidRequest::Rotations(rotations));
            }
            (Some(rotations), _) => rotations / exposure,
            (None, Some(frequency)) if frequency.is_nan() || frequency <= 0.0 => {
                return Err(InvalidRequest::Frequency(frequency));
            }
            (None, Some(frequency)) => frequency,
            (None, None) => settings.default_rotations / exposure,
        };

        let frequency2 = match self.frequency2 {
            // zero leaves motor 2 idle
            Some(f) if f >= 0.0 && f.is_finite() => f,
            Some(f) => return Err(InvalidRequest::Frequency(f)),
            None => frequency1 * settings.channel2_ratio,
        };

        let timeout_secs = match self.timeout {
            Some(t) if t > 0.0 && t.is_finite() => t,
            _ => exposure + settings.timeout_margin_secs,
        };
        let timeout = Duration::try_from_secs_f64(timeout_secs)
            .map_err(|_| InvalidRequest::Exposure(exposure))?;

        Ok(AgitationPlan {
            exposure_time: exposure,
            frequency1,
            frequency2,
            timeout,
        })
    }
}

/// Reasons a request resolves to an implicit stop
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidRequest {
    #[error("exposure time must be positive (got {0})")]
    Exposure(f64),

    #[error("rotation count must be positive (got {0})")]
    Rotations(f64),

    #[error("frequency must be positive (got {0})")]
    Frequency(f64),
}

/// Fully resolved agitation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgitationPlan {
    pub exposure_time: f64,
    pub frequency1: f64,
    pub frequency2: f64,
    pub timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> AgitationSettings {
        AgitationSettings::default()
    }

    #[test]
    fn test_rotations_over_exposure() {
        let plan = AgitationRequest::new(2.0)
            .with_rotations(10.0)
            .plan(&settings())
            .unwrap();
        assert_eq!(plan.frequency1, 5.0);
        assert!((plan.frequency2 - 4.5).abs() < 1e-9);
        assert_eq!(plan.timeout, Duration::from_secs(7));
    }

    #[test]
    fn test_rotations_win_over_frequency() {
        let plan = AgitationRequest::new(4.0)
            .with_rotations(8.0)
            .with_frequency(9.0)
            .plan(&settings())
            .unwrap();
        assert_eq!(plan.frequency1, 2.0);
    }

    #[test]
    fn test_frequency_and_independent_channel2() {
        let plan = AgitationRequest::new(30.0)
            .with_frequency(3.0)
            .with_frequency2(1.0)
            .with_timeout(12.5)
            .plan(&settings())
            .unwrap();
        assert_eq!(plan.frequency1, 3.0);
        assert_eq!(plan.frequency2, 1.0);
        assert_eq!(plan.timeout, Duration::from_millis(12_500));
    }

    #[test]
    fn test_default_rotations() {
        let plan = AgitationRequest::new(5.0).plan(&settings()).unwrap();
        assert_eq!(plan.frequency1, 2.0);
    }

    #[test]
    fn test_invalid_requests() {
        let s = settings();
        assert_eq!(
            AgitationRequest::new(0.0).plan(&s),
            Err(InvalidRequest::Exposure(0.0))
        );
        assert!(AgitationRequest::new(-1.0).plan(&s).is_err());
        assert!(AgitationRequest::new(f64::NAN).plan(&s).is_err());
        assert_eq!(
            AgitationRequest::new(1.0).with_rotations(0.0).plan(&s),
            Err(InvalidRequest::Rotations(0.0))
        );
        assert_eq!(
            AgitationRequest::new(1.0).with_frequency(-2.0).plan(&s),
            Err(InvalidRequest::Frequency(-2.0))
        );
    }

    #[test]
    fn test_non_positive_timeout_uses_margin() {
        let plan = AgitationRequest::new(1.0)
            .with_timeout(0.0)
            .plan(&settings())
            .unwrap();
        assert_eq!(plan.timeout, Duration::from_secs(6));
    }

    #[test]
    fn test_wire_names() {
        let request: AgitationRequest =
            serde_json::from_str(r#"{"exp_time": 3.0, "rotations": 6.0}"#).unwrap();
        assert_eq!(request, AgitationRequest::new(3.0).with_rotations(6.0));
    }
}
