// Motor hardware module for the fiber agitator
//
// Provides:
// - The driver contract for a two-channel voltage controller
// - Roboclaw packet serial implementation
// - In-memory simulated controller
// - Per-motor frequency -> voltage calibration

pub mod calibration;
pub mod port;
pub mod roboclaw;
pub mod sim;

pub use calibration::MotorChannel;
pub use port::{Channel, DriverError, DriverPort};
pub use roboclaw::{Roboclaw, RoboclawSettings};
pub use sim::SimulatedDriver;
