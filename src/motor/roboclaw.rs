// Roboclaw packet serial protocol implementation
//
// Packet format: [Address, Command, Data..., CRC16_hi, CRC16_lo]
// Writes are acknowledged with a single 0xFF byte. Read responses carry
// their data followed by a CRC16 computed over the request and the data.

use serialport::{self, SerialPort};
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, warn};

use super::port::{Channel, DriverError, DriverPort, MAX_DRIVE_MAGNITUDE, Result};

/// Default serial configuration for the Roboclaw controller
pub const DEFAULT_BAUDRATE: u32 = 38_400;
pub const DEFAULT_ADDRESS: u8 = 0x80;
pub const DEFAULT_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_RETRIES: u8 = 3;

/// Write acknowledge byte
const ACK: u8 = 0xFF;

/// Command set (subset used by the agitator)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    ForwardM1 = 0,
    BackwardM1 = 1,
    ForwardM2 = 4,
    BackwardM2 = 5,
    ReadMainBattery = 24,
    ReadCurrents = 49,
    SetMainBatteryLimits = 57,
    ReadMainBatteryLimits = 59,
    SetM1MaxCurrent = 133,
    SetM2MaxCurrent = 134,
    ReadM1MaxCurrent = 135,
    ReadM2MaxCurrent = 136,
}

/// Serial link settings
#[derive(Debug, Clone)]
pub struct RoboclawSettings {
    pub baudrate: u32,
    pub address: u8,
    pub timeout: Duration,
    pub retries: u8,
}

impl Default for RoboclawSettings {
    fn default() -> Self {
        Self {
            baudrate: DEFAULT_BAUDRATE,
            address: DEFAULT_ADDRESS,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            retries: DEFAULT_RETRIES,
        }
    }
}

/// Roboclaw controller - handles serial communication with the motor controller
pub struct Roboclaw<P = Box<dyn SerialPort>> {
    port: P,
    address: u8,
    retries: u8,
}

impl Roboclaw {
    pub fn open_with(port_name: &str, settings: &RoboclawSettings) -> Result<Self> {
        let port = serialport::new(port_name, settings.baudrate)
            .timeout(settings.timeout)
            .open()?;

        Ok(Self::from_port(port, settings.address, settings.retries))
    }
}

impl<P: Read + Write> Roboclaw<P> {
    /// Wrap an already opened byte stream
    pub fn from_port(port: P, address: u8, retries: u8) -> Self {
        Self {
            port,
            address,
            retries: retries.max(1),
        }
    }

    /// CRC16-CCITT (polynomial 0x1021, initial value 0)
    fn crc16(data: &[u8]) -> u16 {
        let mut crc: u16 = 0;
        for &byte in data {
            crc ^= (byte as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ 0x1021;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    /// Build a write packet with trailing CRC
    fn build_packet(address: u8, command: Command, data: &[u8]) -> Vec<u8> {
        let mut packet = Vec::with_capacity(4 + data.len());
        packet.push(address);
        packet.push(command as u8);
        packet.extend_from_slice(data);

        let crc = Self::crc16(&packet);
        packet.extend_from_slice(&crc.to_be_bytes());
        packet
    }

    fn map_read_err(e: std::io::Error, command: Command) -> DriverError {
        if e.kind() == std::io::ErrorKind::TimedOut {
            DriverError::Timeout {
                command: command as u8,
            }
        } else {
            DriverError::Io(e)
        }
    }

    fn write_once(&mut self, command: Command, data: &[u8]) -> Result<()> {
        let packet = Self::build_packet(self.address, command, data);
        self.port.write_all(&packet)?;
        self.port.flush()?;

        let mut ack = [0u8; 1];
        self.port
            .read_exact(&mut ack)
            .map_err(|e| Self::map_read_err(e, command))?;

        if ack[0] != ACK {
            return Err(DriverError::NoAck {
                command: command as u8,
                got: ack[0],
            });
        }
        Ok(())
    }

    fn read_once(&mut self, command: Command, len: usize) -> Result<Vec<u8>> {
        let request = [self.address, command as u8];
        self.port.write_all(&request)?;
        self.port.flush()?;

        // data + CRC16
        let mut response = vec![0u8; len + 2];
        self.port
            .read_exact(&mut response)
            .map_err(|e| Self::map_read_err(e, command))?;

        let mut checked = request.to_vec();
        checked.extend_from_slice(&response[..len]);
        let expected = Self::crc16(&checked);
        let received = u16::from_be_bytes([response[len], response[len + 1]]);

        if expected != received {
            return Err(DriverError::CrcMismatch {
                command: command as u8,
            });
        }

        response.truncate(len);
        Ok(response)
    }

    /// Send a write command, retrying on failure
    fn write(&mut self, command: Command, data: &[u8]) -> Result<()> {
        debug!("Write command {:?}: {:02X?}", command, data);
        let mut attempt = 1;
        loop {
            match self.write_once(command, data) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    warn!("Command {:?} failed (attempt {}): {}", command, attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send a read command, retrying on failure
    fn read(&mut self, command: Command, len: usize) -> Result<Vec<u8>> {
        let mut attempt = 1;
        loop {
            match self.read_once(command, len) {
                Ok(data) => return Ok(data),
                Err(e) if attempt < self.retries => {
                    warn!("Read {:?} failed (attempt {}): {}", command, attempt, e);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn read_u16(&mut self, command: Command) -> Result<u16> {
        let data = self.read(command, 2)?;
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    fn read_u16_pair(&mut self, command: Command) -> Result<(u16, u16)> {
        let data = self.read(command, 4)?;
        Ok((
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
        ))
    }

    fn read_u32_pair(&mut self, command: Command) -> Result<(u32, u32)> {
        let data = self.read(command, 8)?;
        Ok((
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]),
            u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ))
    }

    fn drive(&mut self, command: Command, magnitude: u8) -> Result<()> {
        self.write(command, &[magnitude.min(MAX_DRIVE_MAGNITUDE)])
    }
}

/// Volts to the controller's 0.1 V register units
fn to_decivolts(volts: f64) -> u16 {
    (volts * 10.0).round().clamp(0.0, u16::MAX as f64) as u16
}

/// Amps to the controller's 10 mA register units
fn to_centiamps(amps: f64) -> u32 {
    (amps * 100.0).round().clamp(0.0, u32::MAX as f64) as u32
}

impl<P: Read + Write + Send> DriverPort for Roboclaw<P> {
    fn read_battery_voltage(&mut self) -> Result<f64> {
        Ok(self.read_u16(Command::ReadMainBattery)? as f64 / 10.0)
    }

    fn read_currents(&mut self) -> Result<(f64, f64)> {
        let (m1, m2) = self.read_u16_pair(Command::ReadCurrents)?;
        Ok((m1 as f64 / 100.0, m2 as f64 / 100.0))
    }

    fn read_voltage_limits(&mut self) -> Result<(f64, f64)> {
        let (min, max) = self.read_u16_pair(Command::ReadMainBatteryLimits)?;
        Ok((min as f64 / 10.0, max as f64 / 10.0))
    }

    fn set_voltage_limits(&mut self, min: f64, max: f64) -> Result<()> {
        let mut data = Vec::with_capacity(4);
        data.extend_from_slice(&to_decivolts(min).to_be_bytes());
        data.extend_from_slice(&to_decivolts(max).to_be_bytes());
        self.write(Command::SetMainBatteryLimits, &data)
    }

    fn read_max_current(&mut self, channel: Channel) -> Result<f64> {
        let command = match channel {
            Channel::M1 => Command::ReadM1MaxCurrent,
            Channel::M2 => Command::ReadM2MaxCurrent,
        };
        let (max, _min) = self.read_u32_pair(command)?;
        Ok(max as f64 / 100.0)
    }

    fn set_max_current(&mut self, channel: Channel, amps: f64) -> Result<()> {
        let command = match channel {
            Channel::M1 => Command::SetM1MaxCurrent,
            Channel::M2 => Command::SetM2MaxCurrent,
        };
        // max current followed by min current (always 0)
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&to_centiamps(amps).to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        self.write(command, &data)
    }

    fn drive_forward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        match channel {
            Channel::M1 => self.drive(Command::ForwardM1, magnitude),
            Channel::M2 => self.drive(Command::ForwardM2, magnitude),
        }
    }

    fn drive_backward(&mut self, channel: Channel, magnitude: u8) -> Result<()> {
        match channel {
            Channel::M1 => self.drive(Command::BackwardM1, magnitude),
            Channel::M2 => self.drive(Command::BackwardM2, magnitude),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Byte stream that records writes and replays canned responses
    #[derive(Default)]
    struct FakeLink {
        written: Vec<u8>,
        replies: VecDeque<u8>,
    }

    impl FakeLink {
        fn reply(mut self, bytes: &[u8]) -> Self {
            self.replies.extend(bytes);
            self
        }
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.replies.is_empty() {
                return Err(std::io::ErrorKind::TimedOut.into());
            }
            let n = buf.len().min(self.replies.len());
            for b in buf.iter_mut().take(n) {
                *b = self.replies.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn response(address: u8, command: Command, data: &[u8]) -> Vec<u8> {
        let mut checked = vec![address, command as u8];
        checked.extend_from_slice(data);
        let crc = Roboclaw::<FakeLink>::crc16(&checked);
        let mut out = data.to_vec();
        out.extend_from_slice(&crc.to_be_bytes());
        out
    }

    #[test]
    fn test_crc16() {
        // CRC-16/XMODEM check value
        assert_eq!(Roboclaw::<FakeLink>::crc16(b"123456789"), 0x31C3);
        assert_eq!(Roboclaw::<FakeLink>::crc16(&[]), 0);
    }

    #[test]
    fn test_build_packet() {
        let packet = Roboclaw::<FakeLink>::build_packet(0x80, Command::ForwardM1, &[64]);
        assert_eq!(packet.len(), 5);
        assert_eq!(&packet[..3], &[0x80, 0x00, 64]);
        let crc = Roboclaw::<FakeLink>::crc16(&[0x80, 0x00, 64]);
        assert_eq!(&packet[3..], &crc.to_be_bytes());
    }

    #[test]
    fn test_drive_clamps_magnitude() {
        let link = FakeLink::default().reply(&[ACK]);
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        rc.drive_backward(Channel::M2, 200).unwrap();
        assert_eq!(rc.port.written[1], Command::BackwardM2 as u8);
        assert_eq!(rc.port.written[2], MAX_DRIVE_MAGNITUDE);
    }

    #[test]
    fn test_read_battery_voltage() {
        let reply = response(0x80, Command::ReadMainBattery, &[0, 121]);
        let link = FakeLink::default().reply(&reply);
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        let volts = rc.read_battery_voltage().unwrap();
        assert!((volts - 12.1).abs() < 1e-9);
        assert_eq!(rc.port.written, vec![0x80, 24]);
    }

    #[test]
    fn test_read_currents() {
        let reply = response(0x80, Command::ReadCurrents, &[0, 150, 0, 25]);
        let link = FakeLink::default().reply(&reply);
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        let (i1, i2) = rc.read_currents().unwrap();
        assert!((i1 - 1.5).abs() < 1e-9);
        assert!((i2 - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_crc_mismatch_is_reported() {
        let link = FakeLink::default().reply(&[0, 121, 0xDE, 0xAD]);
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        assert!(matches!(
            rc.read_battery_voltage(),
            Err(DriverError::CrcMismatch { command: 24 })
        ));
    }

    #[test]
    fn test_missing_ack_times_out() {
        let mut rc = Roboclaw::from_port(FakeLink::default(), 0x80, 1);
        assert!(matches!(
            rc.drive_forward(Channel::M1, 10),
            Err(DriverError::Timeout { command: 0 })
        ));
    }

    #[test]
    fn test_retry_after_bad_ack() {
        let link = FakeLink::default().reply(&[0x00, ACK]);
        let mut rc = Roboclaw::from_port(link, 0x80, 3);
        rc.drive_forward(Channel::M1, 10).unwrap();
        // packet sent twice
        assert_eq!(rc.port.written.len(), 10);
    }

    #[test]
    fn test_set_voltage_limits_encoding() {
        let link = FakeLink::default().reply(&[ACK]);
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        rc.set_voltage_limits(6.0, 16.5).unwrap();
        assert_eq!(&rc.port.written[..6], &[0x80, 57, 0, 60, 0, 165]);
    }

    #[test]
    fn test_read_max_current() {
        let data = [0, 0, 0x03, 0xE8, 0, 0, 0, 0];
        let link = FakeLink::default().reply(&response(0x80, Command::ReadM2MaxCurrent, &data));
        let mut rc = Roboclaw::from_port(link, 0x80, 1);
        let amps = rc.read_max_current(Channel::M2).unwrap();
        assert!((amps - 10.0).abs() < 1e-9);
    }
}
