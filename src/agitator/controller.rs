// Agitation controller
//
// Owns both motor calibrations and the driver handle. An agitation runs on a
// single background thread that drives both motors, polls once per interval
// and zeroes the motors when it leaves its loop for any reason. `stop` cancels
// that thread, waits a bounded time for it, and zeroes the motors itself if the
// thread did not.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::request::{AgitationPlan, AgitationRequest};
use crate::config::{AgitationSettings, CalibrationConfig};
use crate::messages::AgitatorStatus;
use crate::motor::calibration::MotorChannel;
use crate::motor::port::{Channel, DriverError, DriverPort, MAX_DRIVE_MAGNITUDE};

#[derive(Debug, thiserror::Error)]
pub enum AgitatorError {
    #[error("Hardware fault: {0}")]
    Hardware(#[from] DriverError),

    #[error("Failed to spawn agitation thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Agitation thread panicked")]
    TaskPanicked,
}

pub type Result<T> = std::result::Result<T, AgitatorError>;

/// Lifecycle of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Running,
    Stopping,
}

/// Why an agitation thread left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
}

/// Driver plus the voltages last commanded through it
///
/// Shared between the caller and the agitation thread; every drive command
/// goes through this lock. `generation` names the agitation that owns the
/// motors. A thread whose generation is no longer current must not touch them.
struct Actuator<D> {
    driver: D,
    voltage1: f64,
    voltage2: f64,
    frequency: f64,
    safe_battery_voltage: f64,
    generation: u64,
}

impl<D: DriverPort> Actuator<D> {
    /// Live battery voltage, with non-positive readings replaced by the safe default
    fn battery_voltage(&mut self) -> std::result::Result<f64, DriverError> {
        let reading = self.driver.read_battery_voltage()?;
        if reading > 0.0 {
            Ok(reading)
        } else {
            warn!(
                fault = "sensor_anomaly",
                reading,
                substitute = self.safe_battery_voltage,
                "Non-positive battery voltage reading"
            );
            Ok(self.safe_battery_voltage)
        }
    }

    fn cached(&self, channel: Channel) -> f64 {
        match channel {
            Channel::M1 => self.voltage1,
            Channel::M2 => self.voltage2,
        }
    }

    fn cache(&mut self, channel: Channel, voltage: f64) {
        match channel {
            Channel::M1 => self.voltage1 = voltage,
            Channel::M2 => self.voltage2 = voltage,
        }
    }

    fn is_energized(&self) -> bool {
        self.voltage1 != 0.0 || self.voltage2 != 0.0
    }

    /// Clamp to the supply, convert to a drive command and remember the result
    fn set_voltage_with(
        &mut self,
        channel: Channel,
        voltage: f64,
        battery: f64,
    ) -> std::result::Result<f64, DriverError> {
        let voltage = if voltage.is_nan() {
            0.0
        } else {
            voltage.clamp(-battery, battery)
        };
        let magnitude = drive_magnitude(voltage, battery);

        if voltage >= 0.0 {
            self.driver.drive_forward(channel, magnitude)?;
        } else {
            self.driver.drive_backward(channel, magnitude)?;
        }
        self.cache(channel, voltage);
        Ok(voltage)
    }

    fn set_voltage(
        &mut self,
        channel: Channel,
        voltage: f64,
    ) -> std::result::Result<f64, DriverError> {
        if voltage == 0.0 {
            self.zero_channel(channel)?;
            return Ok(0.0);
        }
        let battery = self.battery_voltage()?;
        self.set_voltage_with(channel, voltage, battery)
    }

    /// Zero needs no battery reading, so it still works when that read fails
    fn zero_channel(&mut self, channel: Channel) -> std::result::Result<(), DriverError> {
        self.driver.drive_forward(channel, 0)?;
        self.cache(channel, 0.0);
        Ok(())
    }

    /// Command both channels to zero, attempting both even if one fails
    fn zero(&mut self) -> std::result::Result<(), DriverError> {
        let first = self.zero_channel(Channel::M1);
        let second = self.zero_channel(Channel::M2);
        self.frequency = 0.0;
        first.and(second)
    }
}

/// Fraction of the supply voltage scaled to the drive command range
fn drive_magnitude(voltage: f64, battery: f64) -> u8 {
    if battery <= 0.0 {
        return 0;
    }
    let max = MAX_DRIVE_MAGNITUDE as f64;
    (voltage.abs() / battery * max).clamp(0.0, max) as u8
}

fn lock<D>(hw: &Mutex<Actuator<D>>) -> MutexGuard<'_, Actuator<D>> {
    // the motors must stay controllable after a panic elsewhere
    hw.lock().unwrap_or_else(PoisonError::into_inner)
}

type TaskHandle = JoinHandle<Result<StopReason>>;

/// Handle to the one running agitation thread
struct AgitationTask {
    handle: TaskHandle,
    cancel: Arc<AtomicBool>,
}

/// Stateful controller for the two agitator motors
pub struct AgitationController<D: DriverPort + 'static> {
    hw: Arc<Mutex<Actuator<D>>>,
    calibration: CalibrationConfig,
    settings: AgitationSettings,
    task: Option<AgitationTask>,
    /// Threads `stop` gave up waiting for; joined at teardown
    abandoned: Vec<TaskHandle>,
    forced_stops: u32,
}

impl<D: DriverPort + 'static> AgitationController<D> {
    /// Take ownership of an open driver and zero both motors
    pub fn new(
        driver: D,
        calibration: CalibrationConfig,
        settings: AgitationSettings,
    ) -> Result<Self> {
        let hw = Actuator {
            driver,
            voltage1: 0.0,
            voltage2: 0.0,
            frequency: 0.0,
            safe_battery_voltage: settings.safe_battery_voltage,
            generation: 0,
        };
        let controller = Self {
            hw: Arc::new(Mutex::new(hw)),
            calibration,
            settings,
            task: None,
            abandoned: Vec::new(),
            forced_stops: 0,
        };

        let zeroed = lock(&controller.hw).zero();
        zeroed?;
        info!(
            poll_interval = ?controller.settings.poll_interval(),
            timeout_margin = controller.settings.timeout_margin_secs,
            "Agitation controller ready"
        );
        Ok(controller)
    }

    pub fn with_defaults(driver: D) -> Result<Self> {
        Self::new(driver, CalibrationConfig::default(), AgitationSettings::default())
    }

    /// Start agitating for the requested exposure
    ///
    /// Any running agitation is stopped first. A request with a non-positive
    /// exposure, rotation count or frequency leaves the controller idle.
    /// Returns once both motors have been commanded; the agitation then runs
    /// on its own until `stop` or its timeout.
    pub fn start(&mut self, request: AgitationRequest) -> Result<()> {
        self.stop()?;
        self.reap_abandoned();

        let plan = match request.plan(&self.settings) {
            Ok(plan) => plan,
            Err(reason) => {
                warn!(%reason, ?request, "Agitation request resolves to stop, staying idle");
                return Ok(());
            }
        };

        let generation = {
            let mut hw = lock(&self.hw);
            hw.generation += 1;
            hw.generation
        };
        let cancel = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let job = AgitationJob {
            hw: Arc::clone(&self.hw),
            generation,
            channels: [self.calibration.channel1, self.calibration.channel2],
            plan,
            poll_interval: self.settings.poll_interval(),
            cancel: Arc::clone(&cancel),
        };

        let handle = thread::Builder::new()
            .name("agitation".to_string())
            .spawn(move || job.run(ready_tx))
            .map_err(AgitatorError::Spawn)?;
        self.task = Some(AgitationTask { handle, cancel });

        if let Ok(true) = ready_rx.recv() {
            return Ok(());
        }

        // the thread has zeroed the motors and is exiting
        match self.task.take().map(|task| task.handle.join()) {
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(AgitatorError::TaskPanicked),
            _ => Ok(()),
        }
    }

    fn log_outcome(outcome: thread::Result<Result<StopReason>>) {
        match outcome {
            Ok(Ok(reason)) => debug!(?reason, "Agitation thread joined"),
            Ok(Err(e)) => {
                error!(fault = "hardware", error = %e, "Agitation thread ended with a fault")
            }
            Err(_) => error!(fault = "task_panicked", "Agitation thread panicked"),
        }
    }

    /// Cancel any running agitation and leave both motors at 0 V
    ///
    /// Waits up to `stop_wait_cycles` x `stop_wait` for the agitation thread.
    /// If it has not finished, or finished without zeroing the motors, they are
    /// zeroed directly here. On an idle controller this only zeroes voltages
    /// set through `set_voltage`; with the motors already at zero it does nothing.
    pub fn stop(&mut self) -> Result<()> {
        if self.task.is_some() {
            return self.stop_task();
        }

        let mut hw = lock(&self.hw);
        if hw.is_energized() {
            info!(
                voltage1 = hw.voltage1,
                voltage2 = hw.voltage2,
                "Zeroing directly set voltages"
            );
            hw.zero()?;
        }
        Ok(())
    }

    /// Cancel the agitation thread, falling back to a direct zero command
    fn stop_task(&mut self) -> Result<()> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };

        info!("Agitation stop requested");
        task.cancel.store(true, Ordering::SeqCst);

        let wait = self.settings.stop_wait();
        let mut finished = task.handle.is_finished();
        for _ in 0..self.settings.stop_wait_cycles {
            if finished {
                break;
            }
            thread::sleep(wait);
            finished = task.handle.is_finished();
        }

        if finished {
            Self::log_outcome(task.handle.join());
            if lock(&self.hw).is_energized() {
                return self.force_zero("agitation thread exited with motors energized");
            }
            info!("Agitation stopped");
            Ok(())
        } else {
            // Revoke the thread's claim on the motors before zeroing them, so
            // it cannot touch a later agitation when it finally wakes up.
            lock(&self.hw).generation += 1;
            self.abandoned.push(task.handle);
            self.force_zero("agitation thread did not finish in time")
        }
    }

    /// Join abandoned threads that have exited since
    fn reap_abandoned(&mut self) {
        let (finished, pending): (Vec<_>, Vec<_>) = self
            .abandoned
            .drain(..)
            .partition(|handle| handle.is_finished());
        self.abandoned = pending;
        for handle in finished {
            Self::log_outcome(handle.join());
        }
    }

    /// Last line of defence: zero the motors from the caller's thread
    fn force_zero(&mut self, cause: &str) -> Result<()> {
        self.forced_stops += 1;
        let (voltage1, voltage2) = self.voltages();
        error!(
            fault = "stuck_task",
            cause,
            voltage1,
            voltage2,
            "Forcing motors to zero"
        );
        lock(&self.hw).zero().map_err(|e| {
            error!(fault = "hardware", error = %e, "Forced zero failed, motors may be energized");
            AgitatorError::from(e)
        })
    }

    /// Stop, then command zero unconditionally
    pub fn shutdown(&mut self) -> Result<()> {
        info!("Agitation controller teardown");
        let stopped = self.stop();
        if !self.abandoned.is_empty() {
            warn!(
                threads = self.abandoned.len(),
                "Waiting for abandoned agitation threads"
            );
        }
        for handle in self.abandoned.drain(..) {
            Self::log_outcome(handle.join());
        }
        lock(&self.hw).zero()?;
        stopped
    }

    pub fn state(&self) -> ControllerState {
        match &self.task {
            None => ControllerState::Idle,
            Some(task) if task.handle.is_finished() => ControllerState::Idle,
            Some(task) if task.cancel.load(Ordering::SeqCst) => ControllerState::Stopping,
            Some(_) => ControllerState::Running,
        }
    }

    /// Number of times `stop` had to zero the motors itself
    pub fn forced_stops(&self) -> u32 {
        self.forced_stops
    }

    // === Direct voltage control ===

    /// Set both channels to `voltage`, stopping any agitation first
    pub fn set_voltage(&mut self, voltage: f64) -> Result<()> {
        self.stop_task()?;
        let mut hw = lock(&self.hw);
        hw.set_voltage(Channel::M1, voltage)?;
        hw.set_voltage(Channel::M2, voltage)?;
        Ok(())
    }

    /// Set one channel, clamped to +/- the battery voltage; returns the value applied
    pub fn set_channel_voltage(&mut self, channel: Channel, voltage: f64) -> Result<f64> {
        self.stop_task()?;
        Ok(lock(&self.hw).set_voltage(channel, voltage)?)
    }

    pub fn set_voltage1(&mut self, voltage: f64) -> Result<f64> {
        self.set_channel_voltage(Channel::M1, voltage)
    }

    pub fn set_voltage2(&mut self, voltage: f64) -> Result<f64> {
        self.set_channel_voltage(Channel::M2, voltage)
    }

    // === Status ===

    /// Last commanded voltages `(channel 1, channel 2)`
    pub fn voltages(&self) -> (f64, f64) {
        let hw = lock(&self.hw);
        (hw.voltage1, hw.voltage2)
    }

    pub fn voltage1(&self) -> f64 {
        lock(&self.hw).cached(Channel::M1)
    }

    pub fn voltage2(&self) -> f64 {
        lock(&self.hw).cached(Channel::M2)
    }

    /// Motor 1 frequency of the running agitation, 0 when idle
    pub fn frequency(&self) -> f64 {
        lock(&self.hw).frequency
    }

    pub fn battery_voltage(&self) -> Result<f64> {
        Ok(lock(&self.hw).battery_voltage()?)
    }

    pub fn currents(&self) -> Result<(f64, f64)> {
        Ok(lock(&self.hw).driver.read_currents()?)
    }

    pub fn current1(&self) -> Result<f64> {
        Ok(self.currents()?.0)
    }

    pub fn current2(&self) -> Result<f64> {
        Ok(self.currents()?.1)
    }

    pub fn min_voltage(&self) -> Result<f64> {
        Ok(lock(&self.hw).driver.read_voltage_limits()?.0)
    }

    pub fn max_voltage(&self) -> Result<f64> {
        Ok(lock(&self.hw).driver.read_voltage_limits()?.1)
    }

    pub fn set_min_voltage(&self, volts: f64) -> Result<()> {
        let mut hw = lock(&self.hw);
        let (_, max) = hw.driver.read_voltage_limits()?;
        Ok(hw.driver.set_voltage_limits(volts, max)?)
    }

    pub fn set_max_voltage(&self, volts: f64) -> Result<()> {
        let mut hw = lock(&self.hw);
        let (min, _) = hw.driver.read_voltage_limits()?;
        Ok(hw.driver.set_voltage_limits(min, volts)?)
    }

    pub fn max_current(&self, channel: Channel) -> Result<f64> {
        Ok(lock(&self.hw).driver.read_max_current(channel)?)
    }

    pub fn max_current1(&self) -> Result<f64> {
        self.max_current(Channel::M1)
    }

    pub fn max_current2(&self) -> Result<f64> {
        self.max_current(Channel::M2)
    }

    pub fn set_max_current(&self, channel: Channel, amps: f64) -> Result<()> {
        Ok(lock(&self.hw).driver.set_max_current(channel, amps)?)
    }

    /// Snapshot for remote callers; hardware reads that fail are left empty
    pub fn status(&self) -> AgitatorStatus {
        let (voltage1, voltage2) = self.voltages();
        let currents = self.currents().ok();
        AgitatorStatus {
            state: self.state(),
            voltage1,
            voltage2,
            frequency: self.frequency(),
            battery_voltage: self.battery_voltage().ok(),
            current1: currents.map(|c| c.0),
            current2: currents.map(|c| c.1),
        }
    }
}

impl<D: DriverPort + 'static> Drop for AgitationController<D> {
    fn drop(&mut self) {
        // Motors must be at zero before the driver is released
        if let Err(e) = self.shutdown() {
            error!(fault = "hardware", error = %e, "Failed to stop motors on teardown");
        }
    }
}

/// Everything the agitation thread needs
struct AgitationJob<D> {
    hw: Arc<Mutex<Actuator<D>>>,
    generation: u64,
    channels: [MotorChannel; 2],
    plan: AgitationPlan,
    poll_interval: std::time::Duration,
    cancel: Arc<AtomicBool>,
}

impl<D: DriverPort> AgitationJob<D> {
    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn owns(&self, hw: &Actuator<D>) -> bool {
        hw.generation == self.generation
    }

    /// Thread body; `ready` reports whether both motors were commanded
    fn run(self, ready: SyncSender<bool>) -> Result<StopReason> {
        let started = Instant::now();

        if let Err(e) = self.energize() {
            error!(fault = "hardware", error = %e, "Failed to start agitation");
            let _ = self.finish();
            let _ = ready.send(false);
            return Err(e.into());
        }
        let _ = ready.send(true);

        let outcome = self.poll(started);
        let zeroed = self.finish();

        match outcome {
            Ok(reason) => {
                info!(?reason, elapsed = ?started.elapsed(), "Agitation finished");
                zeroed.map(|()| reason).map_err(AgitatorError::from)
            }
            Err(e) => {
                error!(fault = "hardware", error = %e, "Agitation aborted by hardware fault");
                Err(e.into())
            }
        }
    }

    /// Compute and command both motor voltages
    fn energize(&self) -> std::result::Result<(), DriverError> {
        let mut hw = lock(&self.hw);
        let battery = hw.battery_voltage()?;
        let [ch1, ch2] = self.channels;
        let target1 = ch1.voltage_for(battery, self.plan.frequency1);
        let target2 = ch2.voltage_for(battery, self.plan.frequency2);

        let voltage1 = hw.set_voltage_with(Channel::M1, target1, battery)?;
        let voltage2 = hw.set_voltage_with(Channel::M2, target2, battery)?;
        hw.frequency = self.plan.frequency1;

        info!(
            exposure_time = self.plan.exposure_time,
            frequency1 = self.plan.frequency1,
            frequency2 = self.plan.frequency2,
            battery,
            voltage1,
            voltage2,
            timeout = ?self.plan.timeout,
            "Agitation started"
        );
        Ok(())
    }

    /// Sleep one interval at a time until cancelled or timed out
    fn poll(&self, started: Instant) -> std::result::Result<StopReason, DriverError> {
        loop {
            if self.cancelled() {
                return Ok(StopReason::Cancelled);
            }
            let elapsed = started.elapsed();
            if elapsed >= self.plan.timeout {
                return Ok(StopReason::TimedOut);
            }

            let (current1, current2) = {
                let mut hw = lock(&self.hw);
                if !self.owns(&hw) {
                    return Ok(StopReason::Cancelled);
                }
                hw.driver.read_currents()?
            };
            debug!(?elapsed, current1, current2, "Agitation tick");

            thread::sleep(self.poll_interval);
        }
    }

    /// Zero both motors, unless they were handed on, and clear the cancellation flag
    fn finish(&self) -> std::result::Result<(), DriverError> {
        let zeroed = {
            let mut hw = lock(&self.hw);
            if self.owns(&hw) {
                hw.zero()
            } else {
                debug!(generation = self.generation, "Agitation superseded, leaving motors alone");
                Ok(())
            }
        };
        if let Err(e) = &zeroed {
            error!(fault = "hardware", error = %e, "Agitation thread failed to zero motors");
        }
        self.cancel.store(false, Ordering::SeqCst);
        zeroed
    }
}
