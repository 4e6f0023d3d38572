// Per-motor voltage calibration
// Maps a desired oscillation frequency to a drive voltage from a bench-measured
// linear regression, clamped between the stall floor and the supply voltage.

use serde::{Deserialize, Serialize};

/// Stall floor shared by both motors (volts)
pub const DEFAULT_MIN_VOLTAGE: f64 = 5.0;

/// Highest frequency either motor is asked to run at (Hz)
pub const DEFAULT_MAX_FREQUENCY: f64 = 10.0;

/// Calibration constants for one motor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotorChannel {
    /// Volts per Hz
    pub slope: f64,
    /// Volts at 0 Hz
    pub intercept: f64,
    pub max_frequency: f64,
    pub min_voltage: f64,
}

impl MotorChannel {
    /// Bench calibration of motor 1
    pub const CHANNEL_1: MotorChannel = MotorChannel {
        slope: 27.81,
        intercept: 2.06,
        max_frequency: DEFAULT_MAX_FREQUENCY,
        min_voltage: DEFAULT_MIN_VOLTAGE,
    };

    /// Bench calibration of motor 2
    pub const CHANNEL_2: MotorChannel = MotorChannel {
        slope: 28.49,
        intercept: 1.58,
        max_frequency: DEFAULT_MAX_FREQUENCY,
        min_voltage: DEFAULT_MIN_VOLTAGE,
    };

    /// Drive voltage for `frequency` Hz given the present supply voltage
    ///
    /// A non-positive frequency is an explicit stop and returns 0 without
    /// applying the stall floor. If the supply is below the stall floor the
    /// supply wins.
    pub fn voltage_for(&self, battery_voltage: f64, frequency: f64) -> f64 {
        if frequency.is_nan() || frequency <= 0.0 {
            return 0.0;
        }

        let frequency = frequency.min(self.max_frequency);
        let raw = self.slope * frequency + self.intercept;

        raw.max(self.min_voltage).min(battery_voltage.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BATTERY: f64 = 12.0;

    #[test]
    fn test_zero_frequency_is_stop() {
        assert_eq!(MotorChannel::CHANNEL_1.voltage_for(BATTERY, 0.0), 0.0);
        assert_eq!(MotorChannel::CHANNEL_2.voltage_for(BATTERY, -3.0), 0.0);
    }

    #[test]
    fn test_linear_region() {
        // low slope so the regression stays between floor and supply
        let ch = MotorChannel {
            slope: 2.0,
            intercept: 1.0,
            max_frequency: 10.0,
            min_voltage: 2.0,
        };
        assert!((ch.voltage_for(24.0, 3.0) - 7.0).abs() < 1e-9);
        // below the stall floor
        assert!((ch.voltage_for(24.0, 0.1) - 2.0).abs() < 1e-9);
        // frequency clamped before the map
        assert!((ch.voltage_for(24.0, 50.0) - 21.0).abs() < 1e-9);
    }

    #[test]
    fn test_never_exceeds_battery() {
        for &b in &[5.0, 7.5, 12.0, 16.8, 24.0] {
            for i in 1..200 {
                let f = i as f64 * 0.1;
                let v1 = MotorChannel::CHANNEL_1.voltage_for(b, f);
                let v2 = MotorChannel::CHANNEL_2.voltage_for(b, f);
                assert!(v1 <= b && v2 <= b, "b={} f={} v1={} v2={}", b, f, v1, v2);
                assert!(v1 >= DEFAULT_MIN_VOLTAGE && v2 >= DEFAULT_MIN_VOLTAGE);
            }
        }
    }

    #[test]
    fn test_monotonic_then_constant() {
        let ch = MotorChannel {
            slope: 1.5,
            intercept: 0.5,
            max_frequency: 6.0,
            min_voltage: 3.0,
        };
        let mut last = 0.0;
        for i in 0..=120 {
            let f = i as f64 * 0.1;
            let v = ch.voltage_for(48.0, f);
            assert!(v >= last, "not monotonic at f={}", f);
            last = v;
        }
        let at_max = ch.voltage_for(48.0, 6.0);
        assert_eq!(ch.voltage_for(48.0, 7.0), at_max);
        assert_eq!(ch.voltage_for(48.0, 1000.0), at_max);
    }

    #[test]
    fn test_channels_are_distinct() {
        assert_ne!(MotorChannel::CHANNEL_1, MotorChannel::CHANNEL_2);
        let ch1 = MotorChannel::CHANNEL_1.voltage_for(100.0, 1.0);
        let ch2 = MotorChannel::CHANNEL_2.voltage_for(100.0, 1.0);
        assert!((ch1 - 29.87).abs() < 1e-9);
        assert!((ch2 - 30.07).abs() < 1e-9);
    }

    #[test]
    fn test_supply_below_floor() {
        assert_eq!(MotorChannel::CHANNEL_1.voltage_for(4.0, 2.0), 4.0);
    }
}
