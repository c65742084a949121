//! Boundary to the analog I/O hardware: a sample-clocked output task carrying
//! the disturbance and command channels, and an input task carrying the measurement.
//!
//! The loop only ever talks to these traits. `SimDevice` runs the loop against a
//! simulated rig and `MockDevice` scripts driver behavior for tests.
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiment::context::ExperimentCtx;

mod buffer_pool;

pub mod mock;
pub use mock::{MockDevice, MockLog, MockOp, ReadSource};

pub mod sim;
pub use sim::{SIM_FAULT_CODE, SecondOrderPlant, SimDevice};

/// Sample clock edge on which conversions happen
#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

/// Whether the task runs until stopped or for a fixed number of samples
#[derive(Serialize, Deserialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleMode {
    #[default]
    Continuous,
    Finite,
}

/// Where the sample clock comes from and which edge it ticks on
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClockSource {
    pub source: String,
    pub edge: Edge,
}

impl Default for ClockSource {
    fn default() -> Self {
        Self {
            source: "OnboardClock".to_owned(),
            edge: Edge::Rising,
        }
    }
}

/// A physical channel range and its voltage limits
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChannelConfig {
    /// Driver-specific physical channel spec, like `Mod1/ao0:1`
    pub physical: String,

    /// Number of channels the physical range expands to
    pub n_channels: usize,

    pub min_v: f64,
    pub max_v: f64,
}

impl ChannelConfig {
    pub fn new(physical: &str, n_channels: usize, min_v: f64, max_v: f64) -> Self {
        Self {
            physical: physical.to_owned(),
            n_channels,
            min_v,
            max_v,
        }
    }
}

/// Sample clock timing applied to a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TaskTiming {
    pub rate_hz: f64,
    pub clock: ClockSource,
    pub mode: SampleMode,

    /// Samples per channel per block, which also sizes the driver's buffer
    pub samples_per_channel: usize,
}

impl TaskTiming {
    /// Continuous block-synchronous timing for a run
    pub fn continuous(ctx: &ExperimentCtx) -> Self {
        Self {
            rate_hz: ctx.sample_rate_hz,
            clock: ctx.clock.clone(),
            mode: SampleMode::Continuous,
            samples_per_channel: ctx.block_size,
        }
    }
}

/// Failures reported by a driver.
///
/// Every variant is fatal to a run: the instrument state is not trusted after a
/// driver error, so there is no retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DaqError {
    #[error("failed to create task `{task}`: {reason}")]
    Create { task: String, reason: String },

    #[error("failed to configure timing of `{task}`: {reason}")]
    Configure { task: String, reason: String },

    #[error("failed to register completion callback on `{task}`: {reason}")]
    Register { task: String, reason: String },

    #[error("failed to start `{task}`: {reason}")]
    Start { task: String, reason: String },

    #[error("write to `{task}` failed: {reason}")]
    Write { task: String, reason: String },

    #[error("read from `{task}` failed: {reason}")]
    Read { task: String, reason: String },

    #[error("`{task}` timed out after {timeout_s} s during {op}")]
    Timeout {
        task: String,
        op: &'static str,
        timeout_s: f64,
    },

    #[error("failed to stop `{task}`: {reason}")]
    Stop { task: String, reason: String },

    #[error("failed to clear `{task}`: {reason}")]
    Clear { task: String, reason: String },

    #[error("driver error {code} on `{task}`: {message}")]
    Driver {
        task: String,
        code: i32,
        message: String,
    },
}

/// Status delivered to a task's completion callback
#[derive(Clone, Debug, PartialEq)]
pub enum CompletionStatus {
    Success,
    Failed { code: i32, message: String },
}

/// Completion notification, invoked by the driver on its own thread
pub type DoneCallback = Box<dyn FnMut(CompletionStatus) + Send>;

/// Lifecycle shared by every task:
/// `create -> configure_timing -> start -> ... -> stop -> clear`
pub trait Task: Send {
    fn name(&self) -> &str;

    fn configure_timing(&mut self, timing: &TaskTiming) -> Result<(), DaqError>;

    fn start(&mut self) -> Result<(), DaqError>;

    fn stop(&mut self) -> Result<(), DaqError>;

    /// Release the task. It is not usable afterward.
    fn clear(&mut self) -> Result<(), DaqError>;
}

/// Analog output task
pub trait OutputTask: Task {
    /// Register the notification fired when the task stops on its own
    fn register_done_event(&mut self, callback: DoneCallback) -> Result<(), DaqError>;

    /// Write one block, grouped by channel (`[ch0 samples.., ch1 samples..]`),
    /// blocking until the driver has accepted it.
    fn write(&mut self, data: &[f64], timeout_s: f64) -> Result<(), DaqError>;
}

/// Analog input task
pub trait InputTask: Task {
    /// Fill one block, grouped by channel, blocking until filled or timed out.
    fn read(&mut self, data: &mut [f64], timeout_s: f64) -> Result<(), DaqError>;
}

/// A driver that can create tasks on its channels
pub trait Device {
    fn create_output_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn OutputTask>, DaqError>;

    fn create_input_task(
        &mut self,
        name: &str,
        channel: &ChannelConfig,
    ) -> Result<Box<dyn InputTask>, DaqError>;
}
