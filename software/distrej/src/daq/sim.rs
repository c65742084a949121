//! Simulated rig: a damped second-order plant behind a block-synchronous driver thread.
//!
//! The output task forwards each written block to a driver thread, which integrates
//! the plant across the block and hands one block of sensor readings to the input task.
//! Blocks come out in the order they went in, so the measurement returned by a read is
//! the plant's response to an earlier write, the same way a buffered analog I/O
//! card behaves.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::buffer_pool::{Block, BlockPool};
use super::*;
use crate::calc::Calibration;
use crate::math::Dopri5;

/// Status code reported to the completion callback when an injected fault fires
pub const SIM_FAULT_CODE: i32 = -200_279;

/// Blocks that may be in flight in each direction
const QUEUE_DEPTH: usize = 4;

/// `x'' + 2 ζ ωn x' + ωn² x = ωn² (kd d + ku u)`, sensed as `raw = sensor_gain * x + sensor_offset`.
///
/// The disturbance and actuator gains are DC gains, so a constant unit input
/// settles at `x = kd` or `x = ku`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct SecondOrderPlant {
    pub natural_freq_hz: f64,
    pub damping_ratio: f64,
    pub disturbance_gain: f64,
    pub actuator_gain: f64,
    pub sensor_gain: f64,
    pub sensor_offset: f64,
}

impl Default for SecondOrderPlant {
    fn default() -> Self {
        Self::new(60.0, 0.1)
    }
}

impl SecondOrderPlant {
    /// Plant with unit DC gains and an identity sensor
    pub fn new(natural_freq_hz: f64, damping_ratio: f64) -> Self {
        Self {
            natural_freq_hz,
            damping_ratio,
            disturbance_gain: 1.0,
            actuator_gain: 1.0,
            sensor_gain: 1.0,
            sensor_offset: 0.0,
        }
    }

    pub fn with_gains(mut self, disturbance_gain: f64, actuator_gain: f64) -> Self {
        self.disturbance_gain = disturbance_gain;
        self.actuator_gain = actuator_gain;
        self
    }

    /// Set the sensor so that `calibration` maps its raw reading back to the displacement
    pub fn with_sensor_for(mut self, calibration: &Calibration) -> Self {
        self.sensor_gain = 1.0 / calibration.slope;
        self.sensor_offset = calibration.invert(0.0);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.natural_freq_hz.is_finite() && self.natural_freq_hz > 0.0) {
            return Err(format!(
                "Plant natural frequency must be finite and > 0, got {}",
                self.natural_freq_hz
            ));
        }
        if !(self.damping_ratio.is_finite() && self.damping_ratio >= 0.0) {
            return Err(format!(
                "Plant damping ratio must be finite and >= 0, got {}",
                self.damping_ratio
            ));
        }
        let gains = [
            self.disturbance_gain,
            self.actuator_gain,
            self.sensor_gain,
            self.sensor_offset,
        ];
        if gains.iter().any(|g| !g.is_finite()) {
            return Err(format!("Plant gains must be finite, got {self:?}"));
        }
        Ok(())
    }

    fn omega_n(&self) -> f64 {
        2.0 * core::f64::consts::PI * self.natural_freq_hz
    }

    /// State derivative of `[x, x']` under a held disturbance and command
    pub fn derivative(&self, x: &[f64; 2], d: f64, u: f64) -> [f64; 2] {
        let wn = self.omega_n();
        let forcing = wn * wn * (self.disturbance_gain * d + self.actuator_gain * u);
        [
            x[1],
            forcing - 2.0 * self.damping_ratio * wn * x[1] - wn * wn * x[0],
        ]
    }

    /// Raw sensor reading for a plant state
    pub fn sense(&self, x: &[f64; 2]) -> f64 {
        self.sensor_gain * x[0] + self.sensor_offset
    }
}

/// Analog I/O device backed by a simulated plant.
///
/// The output task must have two channels, `[disturbance, command]`.
/// The plant displacement is delivered on the first input channel and any others read zero.
#[derive(Debug)]
pub struct SimDevice {
    plant: SecondOrderPlant,
    realtime: bool,
    fault_after_blocks: Option<usize>,

    /// Measurement queue waiting for the input task
    pending_input: Option<(Receiver<Block>, BlockPool)>,
}

impl SimDevice {
    pub fn new(plant: SecondOrderPlant) -> Self {
        Self {
            plant,
            realtime: false,
            fault_after_blocks: None,
            pending_input: None,
        }
    }

    /// Pace the driver at the sample clock instead of running as fast as possible
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Stop the driver with a failed completion status
    /// once it has processed `n` blocks, including the initial zero block.
    pub fn fault_after_blocks(mut self, n: usize) -> Self {
        self.fault_after_blocks = Some(n);
        self
    }

    pub fn plant(&self) -> &SecondOrderPlant {
        &self.plant
    }
}

impl Device for SimDevice {
    fn create_output_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn OutputTask>, DaqError> {
        if channel.n_channels != 2 {
            return Err(DaqError::Create {
                task: name.to_owned(),
                reason: format!(
                    "simulated rig drives exactly 2 output channels, got {}",
                    channel.n_channels
                ),
            });
        }
        self.plant.validate().map_err(|reason| DaqError::Create {
            task: name.to_owned(),
            reason,
        })?;

        let (block_tx, block_rx) = bounded(QUEUE_DEPTH);
        let (meas_tx, meas_rx) = bounded(QUEUE_DEPTH);
        let pool = BlockPool::with_blocks(2 * QUEUE_DEPTH, 0);
        self.pending_input = Some((meas_rx, pool.clone()));

        Ok(Box::new(SimOutputTask {
            name: name.to_owned(),
            n_channels: channel.n_channels,
            plant: self.plant,
            realtime: self.realtime,
            fault_after_blocks: self.fault_after_blocks,
            timing: None,
            callback: None,
            block_tx: Some(block_tx),
            driver_io: Some((block_rx, meas_tx)),
            pool,
            driver: None,
        }))
    }

    fn create_input_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn InputTask>, DaqError> {
        let (meas_rx, pool) = self.pending_input.take().ok_or_else(|| DaqError::Create {
            task: name.to_owned(),
            reason: "simulated rig needs its output task created first".to_owned(),
        })?;
        if channel.n_channels == 0 {
            return Err(DaqError::Create {
                task: name.to_owned(),
                reason: "input task needs at least one channel".to_owned(),
            });
        }

        Ok(Box::new(SimInputTask {
            name: name.to_owned(),
            n_channels: channel.n_channels,
            block_size: None,
            started: false,
            meas_rx: Some(meas_rx),
            pool,
        }))
    }
}

struct SimOutputTask {
    name: String,
    n_channels: usize,
    plant: SecondOrderPlant,
    realtime: bool,
    fault_after_blocks: Option<usize>,
    timing: Option<TaskTiming>,
    callback: Option<DoneCallback>,

    /// Dropped on stop so the driver drains its queue and exits
    block_tx: Option<Sender<Block>>,

    /// Handed to the driver thread on start
    driver_io: Option<(Receiver<Block>, Sender<Block>)>,
    pool: BlockPool,
    driver: Option<JoinHandle<()>>,
}

impl Task for SimOutputTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_timing(&mut self, timing: &TaskTiming) -> Result<(), DaqError> {
        if !(timing.rate_hz.is_finite() && timing.rate_hz > 0.0) || timing.samples_per_channel == 0
        {
            return Err(DaqError::Configure {
                task: self.name.clone(),
                reason: format!("invalid timing {timing:?}"),
            });
        }
        self.timing = Some(timing.clone());
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        let timing = self.timing.clone().ok_or_else(|| DaqError::Start {
            task: self.name.clone(),
            reason: "timing is not configured".to_owned(),
        })?;
        let (block_rx, meas_tx) = self.driver_io.take().ok_or_else(|| DaqError::Start {
            task: self.name.clone(),
            reason: "task was already started".to_owned(),
        })?;

        let driver = SimDriver {
            plant: self.plant,
            dt_s: 1.0 / timing.rate_hz,
            block_size: timing.samples_per_channel,
            realtime: self.realtime,
            fault_after_blocks: self.fault_after_blocks,
            callback: self.callback.take(),
            block_rx,
            meas_tx,
            pool: self.pool.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("{}-sim", self.name))
            .spawn(move || driver.run())
            .map_err(|e| DaqError::Start {
                task: self.name.clone(),
                reason: format!("unable to spawn driver thread: {e}"),
            })?;
        self.driver = Some(handle);
        info!(
            "Started simulated rig at {} Hz, {} samples per block",
            timing.rate_hz, timing.samples_per_channel
        );

        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.block_tx = None;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        self.block_tx = None;
        self.driver_io = None;
        if let Some(handle) = self.driver.take() {
            handle.join().map_err(|_| DaqError::Clear {
                task: self.name.clone(),
                reason: "driver thread panicked".to_owned(),
            })?;
        }
        Ok(())
    }
}

impl OutputTask for SimOutputTask {
    fn register_done_event(&mut self, callback: DoneCallback) -> Result<(), DaqError> {
        if self.driver.is_some() {
            return Err(DaqError::Register {
                task: self.name.clone(),
                reason: "task is already running".to_owned(),
            });
        }
        self.callback = Some(callback);
        Ok(())
    }

    fn write(&mut self, data: &[f64], timeout_s: f64) -> Result<(), DaqError> {
        let expected = self
            .timing
            .as_ref()
            .map(|t| t.samples_per_channel * self.n_channels);
        if expected != Some(data.len()) {
            return Err(DaqError::Write {
                task: self.name.clone(),
                reason: format!("expected a block of {expected:?} samples, got {}", data.len()),
            });
        }
        let tx = self.block_tx.as_ref().ok_or_else(|| DaqError::Write {
            task: self.name.clone(),
            reason: "task is stopped".to_owned(),
        })?;

        let block = self.pool.take_copy(data);
        match tx.send_timeout(block, Duration::from_secs_f64(timeout_s)) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DaqError::Timeout {
                task: self.name.clone(),
                op: "write",
                timeout_s,
            }),
            Err(SendTimeoutError::Disconnected(_)) => Err(DaqError::Write {
                task: self.name.clone(),
                reason: "simulated rig is not running".to_owned(),
            }),
        }
    }
}

struct SimInputTask {
    name: String,
    n_channels: usize,
    block_size: Option<usize>,
    started: bool,
    meas_rx: Option<Receiver<Block>>,
    pool: BlockPool,
}

impl Task for SimInputTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_timing(&mut self, timing: &TaskTiming) -> Result<(), DaqError> {
        if timing.samples_per_channel == 0 {
            return Err(DaqError::Configure {
                task: self.name.clone(),
                reason: "block size must be > 0".to_owned(),
            });
        }
        self.block_size = Some(timing.samples_per_channel);
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        if self.block_size.is_none() {
            return Err(DaqError::Start {
                task: self.name.clone(),
                reason: "timing is not configured".to_owned(),
            });
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DaqError> {
        self.started = false;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), DaqError> {
        self.started = false;
        self.meas_rx = None;
        Ok(())
    }
}

impl InputTask for SimInputTask {
    fn read(&mut self, data: &mut [f64], timeout_s: f64) -> Result<(), DaqError> {
        let (block_size, rx) = match (self.started, self.block_size, self.meas_rx.as_ref()) {
            (true, Some(n), Some(rx)) => (n, rx),
            _ => {
                return Err(DaqError::Read {
                    task: self.name.clone(),
                    reason: "task is not running".to_owned(),
                });
            }
        };
        if data.len() != block_size * self.n_channels {
            return Err(DaqError::Read {
                task: self.name.clone(),
                reason: format!(
                    "expected a block of {} samples, got {}",
                    block_size * self.n_channels,
                    data.len()
                ),
            });
        }

        match rx.recv_timeout(Duration::from_secs_f64(timeout_s)) {
            Ok(meas) => {
                let (first, rest) = data.split_at_mut(block_size);
                first.copy_from_slice(&meas[..block_size]);
                rest.fill(0.0);
                self.pool.put(meas);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(DaqError::Timeout {
                task: self.name.clone(),
                op: "read",
                timeout_s,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DaqError::Driver {
                task: self.name.clone(),
                code: SIM_FAULT_CODE,
                message: "simulated rig stopped producing samples".to_owned(),
            }),
        }
    }
}

/// Owns the plant for the lifetime of a started output task
struct SimDriver {
    plant: SecondOrderPlant,
    dt_s: f64,
    block_size: usize,
    realtime: bool,
    fault_after_blocks: Option<usize>,
    callback: Option<DoneCallback>,
    block_rx: Receiver<Block>,
    meas_tx: Sender<Block>,
    pool: BlockPool,
}

impl SimDriver {
    fn run(mut self) {
        let plant = self.plant;
        let mut x = [0.0; 2];
        let mut t = 0.0;
        let mut stepper = Dopri5::<2>::new();
        let block_period = Duration::from_secs_f64(self.dt_s * self.block_size as f64);
        let mut deadline = Instant::now();
        let mut served = 0_usize;

        while let Ok(block) = self.block_rx.recv() {
            if self.fault_after_blocks == Some(served) {
                warn!("Simulated rig injecting a fault after {served} blocks");
                if let Some(callback) = self.callback.as_mut() {
                    callback(CompletionStatus::Failed {
                        code: SIM_FAULT_CODE,
                        message: "simulated output buffer underflow".to_owned(),
                    });
                }
                self.pool.put(block);
                return;
            }

            if self.realtime {
                deadline += block_period;
                let now = Instant::now();
                if deadline > now {
                    thread::sleep(deadline - now);
                }
            }

            // Sample the sensor, then apply the held outputs for one period
            let mut meas = self.pool.take_zeroed(self.block_size);
            let (d, u) = block.split_at(self.block_size);
            for i in 0..self.block_size {
                meas[i] = plant.sense(&x);
                let (di, ui) = (d[i], u[i]);
                stepper.step(
                    |x, _t| plant.derivative(x, di, ui),
                    &mut x,
                    &mut t,
                    self.dt_s,
                );
            }
            self.pool.put(block);

            if self.meas_tx.send(meas).is_err() {
                break;
            }
            served += 1;
        }

        info!("Simulated rig stopped after {served} blocks at t = {t:.3} s");
    }
}
