// In-memory controller used for simulation and tests
//
// The state lives behind an `Arc<Mutex<..>>` so a test can keep a handle on it
// after the driver itself has been moved into a controller.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use super::port::{Channel, DriverError, DriverPort, Result};

/// Last drive command issued on a channel
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveCommand {
    pub backward: bool,
    pub magnitude: u8,
}

/// Observable state of the simulated controller
#[derive(Debug, Clone)]
pub struct SimState {
    pub battery_voltage: f64,
    pub currents: (f64, f64),
    pub voltage_limits: (f64, f64),
    pub max_currents: (f64, f64),
    pub drive: [DriveCommand; 2],
    /// Every drive command in order, as `(channel, signed magnitude)`
    pub history: Vec<(Channel, i16)>,
    /// Fail every call while set
    pub disconnected: bool,
    /// Fail this many upcoming zero-magnitude drive commands
    pub fail_zero_drives: u32,
    /// Fail this many upcoming battery reads
    pub fail_battery_reads: u32,
    /// Hold this many upcoming current reads for `stall` before answering
    pub stalled_current_reads: u32,
    pub stall: Duration,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            battery_voltage: 12.0,
            currents: (0.0, 0.0),
            voltage_limits: (6.0, 16.0),
            max_currents: (3.0, 3.0),
            drive: [DriveCommand::default(); 2],
            history: Vec::new(),
            disconnected: false,
            fail_zero_drives: 0,
            fail_battery_reads: 0,
            stalled_current_reads: 0,
            stall: Duration::ZERO,
        }
    }
}

impl SimState {
    fn check_link(&self) -> Result<()> {
        if self.disconnected {
            Err(DriverError::Disconnected)
        } else {
            Ok(())
        }
    }

    pub fn drive_of(&self, channel: Channel) -> DriveCommand {
        self.drive[index(channel)]
    }

    /// True when both channels were last commanded to zero
    pub fn is_stopped(&self) -> bool {
        self.drive.iter().all(|d| d.magnitude == 0)
    }
}

fn index(channel: Channel) -> usize {
    match channel {
        Channel::M1 => 0,
        Channel::M2 => 1,
    }
}

/// Simulated two-channel controller
#[derive(Debug, Clone, Default)]
pub struct SimulatedDriver {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_battery(volts: f64) -> Self {
        let driver = Self::default();
        driver.state().battery_voltage = volts;
        driver
    }

    /// Lock the simulated state for inspection or fault injection
    pub fn state(&self) -> MutexGuard<'_, SimState> {
        // a panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of live clones of this driver, including `self`
    pub fn handles(&self) -> usize {
        Arc::strong_count(&self.state)
    }

    fn drive(&mut self, channel: Channel, magnitude: u8, backward: bool) -> Result<()> {
        let mut state = self.state();
        state.check_link()?;
        if magnitude == 0 && state.fail_zero_drives > 0 {
            state.fail_zero_drives -= 1;
            return Err(DriverError::Timeout {
                command: if channel == Channel::M1 { 0 } else { 4 },
            });
        }

        state.drive[index(channel)] = DriveCommand {
            backward,
            magnitude,
        };
        let signed = if backward {
            -(magnitude as i16)
        } else {
            magnitude as i16
        };
        state.history.push((channel, signed));
        Ok(())
    }
}

impl DriverPort for SimulatedDriver {
    fn read_battery_voltage(&mut self) -> Result<f64> {
        let mut state = self.state();
        state.check_link()?;
        if state.fail_battery_reads > 0 {
            state.fail_battery_reads -= 1;
            return Err(DriverError::Timeout { command: 24 });
        }
        Ok(state.battery_voltage)
    }

    fn read_currents(&mut self) -> Result<(f64, f64)> {
        let stall = {
            let mut state = self.state();
            state.check_link()?;
            if state.stalled_current_reads > 0 {
                state.stalled_current_reads -= 1;
                Some(state.stall)
            } else {
                None
            }
        };
        // a slow link answers late without locking out inspection
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        Ok(self.state().currents)
    }

    fn read_voltage_limits(&mut self) -> Result<(f64, f64)> {
        let state = self.state();
        state.check_link()?;
        Ok(state.voltage_limits)
    }

    fn set_voltage_limits(&mut self, min: f64, max: f64) -> Result<()> {
        let mut state = self.state();
        state.check_link()?;
        state.voltage_limits = (min, max);
        Ok(())
    }

    fn read_max_current(&mut self, channel: Channel) -> Result<f64> {
        let state = self.state();
        state.check_link()?;
        Ok(match channel {
            Channel::M1 => state.max_currents.0,
            Channel::M2 => state.max_currents.1,
        })
    }

    fn set_max_current(&mut self, channel: Channel, amps: f64) -> Result<()> {
        let mut state = self.state();
        state.check_link()?;
        match channel {
            Channel::M1 => state.max_currents.0 = amps,
            Channel::M2 => state.max_currents.1 = amps,
        }
        Ok(())
    }

    fn drive_forward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        self.drive(channel, magnitude, false)
    }

    fn drive_backward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        self.drive(channel, magnitude, true)
    }
}
