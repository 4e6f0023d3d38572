// Defaults, timing and calibration configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::motor::calibration::MotorChannel;
use crate::motor::roboclaw::{
    DEFAULT_ADDRESS, DEFAULT_BAUDRATE, DEFAULT_RETRIES, DEFAULT_TIMEOUT_MS, RoboclawSettings,
};

// Transport shell
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5001;

// Serial port for the Roboclaw controller
pub const DEFAULT_COMPORT: &str = "/dev/ttyACM0";

// Attempts at opening the hardware before the server gives up
pub const CONNECT_ATTEMPTS: u32 = 3;

// Agitation loop cadence
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

// Added to the exposure time when the caller gives no timeout (seconds)
pub const TIMEOUT_MARGIN_SECS: f64 = 5.0;

// Channel 2 runs slightly slower than channel 1 (mechanical coupling)
pub const CHANNEL2_RATIO: f64 = 0.9;

// Rotations per exposure when the caller names neither rotations nor frequency
pub const DEFAULT_ROTATIONS: f64 = 10.0;

// Used for clamping when the battery reads non-positive (volts)
pub const SAFE_BATTERY_VOLTAGE: f64 = 12.0;

// stop(): wait this long per cycle for the agitation thread to zero the motors
pub const STOP_WAIT: Duration = Duration::from_millis(100);
pub const STOP_WAIT_CYCLES: u32 = 30;

/// Error loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Serial link to the controller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub comport: String,
    pub baudrate: u32,
    pub address: u8,
    pub timeout_secs: f64,
    pub retries: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            comport: DEFAULT_COMPORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            address: DEFAULT_ADDRESS,
            timeout_secs: DEFAULT_TIMEOUT_MS as f64 / 1000.0,
            retries: DEFAULT_RETRIES,
        }
    }
}

impl SerialConfig {
    pub fn roboclaw_settings(&self) -> RoboclawSettings {
        RoboclawSettings {
            baudrate: self.baudrate,
            address: self.address,
            timeout: secs_or(self.timeout_secs, Duration::from_millis(DEFAULT_TIMEOUT_MS)),
            retries: self.retries,
        }
    }
}

/// Listening address of the transport shell
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

/// Timing and policy of the agitation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgitationSettings {
    pub poll_interval_secs: f64,
    pub timeout_margin_secs: f64,
    pub channel2_ratio: f64,
    pub default_rotations: f64,
    pub safe_battery_voltage: f64,
    pub stop_wait_secs: f64,
    pub stop_wait_cycles: u32,
}

impl Default for AgitationSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: POLL_INTERVAL.as_secs_f64(),
            timeout_margin_secs: TIMEOUT_MARGIN_SECS,
            channel2_ratio: CHANNEL2_RATIO,
            default_rotations: DEFAULT_ROTATIONS,
            safe_battery_voltage: SAFE_BATTERY_VOLTAGE,
            stop_wait_secs: STOP_WAIT.as_secs_f64(),
            stop_wait_cycles: STOP_WAIT_CYCLES,
        }
    }
}

impl AgitationSettings {
    pub fn poll_interval(&self) -> Duration {
        secs_or(self.poll_interval_secs, POLL_INTERVAL)
    }

    pub fn stop_wait(&self) -> Duration {
        secs_or(self.stop_wait_secs, STOP_WAIT)
    }
}

/// Calibration of both motors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub channel1: MotorChannel,
    pub channel2: MotorChannel,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            channel1: MotorChannel::CHANNEL_1,
            channel2: MotorChannel::CHANNEL_2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgitatorConfig {
    pub serial: SerialConfig,
    pub server: ServerConfig,
    pub agitation: AgitationSettings,
    pub calibration: CalibrationConfig,
}

impl AgitatorConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load from `path`, or use the defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }
}

/// Positive, finite seconds or the fallback
fn secs_or(secs: f64, fallback: Duration) -> Duration {
    if secs > 0.0 {
        Duration::try_from_secs_f64(secs).unwrap_or(fallback)
    } else {
        fallback
    }
}
