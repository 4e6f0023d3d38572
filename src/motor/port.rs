// Hardware contract for a two-channel voltage/current controller
//
// Every call talks to the device, so every call can fail. Nothing here is
// cached: callers that need a value twice must read it twice.

/// One of the two independently driven motors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    M1,
    M2,
}

/// Largest magnitude accepted by the drive commands
pub const MAX_DRIVE_MAGNITUDE: u8 = 127;

/// Error types for controller communication
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for response to command {command}")]
    Timeout { command: u8 },

    #[error("CRC mismatch in response to command {command}")]
    CrcMismatch { command: u8 },

    #[error("Command {command} was not acknowledged (got 0x{got:02X})")]
    NoAck { command: u8, got: u8 },

    #[error("Controller disconnected")]
    Disconnected,
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Synchronous handle to the physical controller
///
/// Voltages are in volts, currents in amps. Drive magnitudes are a fraction of
/// the supply voltage scaled to `0..=MAX_DRIVE_MAGNITUDE`.
pub trait DriverPort: Send {
    fn read_battery_voltage(&mut self) -> Result<f64>;

    /// Returns `(channel 1, channel 2)` motor currents
    fn read_currents(&mut self) -> Result<(f64, f64)>;

    /// Returns the configured `(min, max)` supply voltage limits
    fn read_voltage_limits(&mut self) -> Result<(f64, f64)>;

    fn set_voltage_limits(&mut self, min: f64, max: f64) -> Result<()>;

    fn read_max_current(&mut self, channel: Channel) -> Result<f64>;

    fn set_max_current(&mut self, channel: Channel, amps: f64) -> Result<()>;

    fn drive_forward(&mut self, channel: Channel, magnitude: u8) -> Result<()>;

    fn drive_backward(&mut self, channel: Channel, magnitude: u8) -> Result<()>;
}

impl<D: DriverPort + ?Sized> DriverPort for Box<D> {
    fn read_battery_voltage(&mut self) -> Result<f64> {
        (**self).read_battery_voltage()
    }

    fn read_currents(&mut self) -> Result<(f64, f64)> {
        (**self).read_currents()
    }

    fn read_voltage_limits(&mut self) -> Result<(f64, f64)> {
        (**self).read_voltage_limits()
    }

    fn set_voltage_limits(&mut self, min: f64, max: f64) -> Result<()> {
        (**self).set_voltage_limits(min, max)
    }

    fn read_max_current(&mut self, channel: Channel) -> Result<f64> {
        (**self).read_max_current(channel)
    }

    fn set_max_current(&mut self, channel: Channel, amps: f64) -> Result<()> {
        (**self).set_max_current(channel, amps)
    }

    fn drive_forward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        (**self).drive_forward(channel, magnitude)
    }

    fn drive_backward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        (**self).drive_backward(channel, magnitude)
    }
}
