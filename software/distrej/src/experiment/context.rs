//! Configuration of a single experiment run
//! that is shared by the loop, control laws, devices, and recorders.

use std::default::Default;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};

use serde::{Deserialize, Serialize};

use crate::calc::{Calibration, SineDisturbance};
use crate::daq::{ChannelConfig, ClockSource};

/// Operation context for an experiment run
#[derive(Serialize, Deserialize, Clone, Debug)]
#[non_exhaustive]
pub struct ExperimentCtx {
    /// Sample clock rate shared by the output and input tasks
    pub sample_rate_hz: f64,

    /// Samples per channel moved in each block write and block read
    pub block_size: usize,

    /// Duration of the open-loop settling phase before control engages
    pub warm_up_s: f64,

    /// Duration of the active control phase
    pub run_s: f64,

    /// Injected disturbance, written to the first output channel
    pub disturbance: SineDisturbance,

    /// Per-rig conversion from the raw input reading to the control-error signal
    pub calibration: Calibration,

    /// Output channels, `[disturbance, command]`
    pub output: ChannelConfig,

    /// Input channel(s); only the first is fed to the control law
    pub input: ChannelConfig,

    /// Sample clock shared by both tasks
    pub clock: ClockSource,

    /// Time allowed for the driver to accept a block
    pub write_timeout_s: f64,

    /// Time allowed for the driver to fill a block
    pub read_timeout_s: f64,

    /// A name for this run, used as the stem of every recorder's file
    /// and of the log file, and must be compatible with that use.
    pub op_name: String,

    /// A directory to place outputs.
    pub op_dir: PathBuf,
}

impl Default for ExperimentCtx {
    fn default() -> Self {
        // Use current time with seconds as op name and use working directory as op dir,
        // replacing characters in the name that would be invalid on Windows.
        let op_name = DateTime::<Utc>::from(SystemTime::now())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            .replace(":", "");
        Self {
            sample_rate_hz: 5000.0,
            block_size: 100,
            warm_up_s: 1.0,
            run_s: 30.0,
            disturbance: SineDisturbance::new(1.5, 35.0, 0.0),
            calibration: Calibration::new(8000.0, -1.7),
            output: ChannelConfig::new("Mod1/ao0:1", 2, -4.0, 4.0),
            input: ChannelConfig::new("Mod2/ai0", 1, -4.0, 4.0),
            clock: ClockSource::default(),
            write_timeout_s: 10.0,
            read_timeout_s: 10.0,
            op_name,
            op_dir: std::fs::canonicalize("./").unwrap_or_default(),
        }
    }
}

impl ExperimentCtx {
    /// Check that the configuration describes a runnable loop.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(format!(
                "Sample rate must be finite and > 0, got {}",
                self.sample_rate_hz
            ));
        }
        if self.block_size == 0 {
            return Err("Block size must be > 0".to_owned());
        }
        for (name, v) in [("warm_up_s", self.warm_up_s), ("run_s", self.run_s)] {
            if !(v.is_finite() && v >= 0.0) {
                return Err(format!("`{name}` must be finite and >= 0, got {v}"));
            }
        }
        for (name, v) in [
            ("write_timeout_s", self.write_timeout_s),
            ("read_timeout_s", self.read_timeout_s),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(format!("`{name}` must be finite and > 0, got {v}"));
            }
        }
        if self.output.n_channels != 2 {
            return Err(format!(
                "Output task must have exactly 2 channels (disturbance, command), got {}",
                self.output.n_channels
            ));
        }
        if self.input.n_channels == 0 {
            return Err("Input task must have at least one channel".to_owned());
        }
        self.disturbance.validate()?;
        self.calibration.validate()?;

        if Duration::try_from_secs_f64(self.block_size as f64 / self.sample_rate_hz).is_err() {
            return Err(format!(
                "Block of {} samples at {} Hz does not have a representable period",
                self.block_size, self.sample_rate_hz
            ));
        }
        let channels = self.output.n_channels.max(self.input.n_channels);
        if self.block_size.checked_mul(channels).is_none() {
            return Err(format!("Block size {} is too large", self.block_size));
        }
        if self.checked_total_samples().is_none() {
            return Err(format!(
                "{} s warm-up and {} s run at {} Hz is more samples than can be recorded",
                self.warm_up_s, self.run_s, self.sample_rate_hz
            ));
        }

        Ok(())
    }

    /// Samples across both phases, or `None` if the record could not be allocated
    fn checked_total_samples(&self) -> Option<usize> {
        let blocks = |duration_s: f64| {
            let n = (duration_s * self.sample_rate_hz / self.block_size as f64).ceil();
            (n < usize::MAX as f64).then_some(n as usize)
        };
        let samples = blocks(self.warm_up_s)?
            .checked_add(blocks(self.run_s)?)?
            .checked_mul(self.block_size)?;

        // Each of the four record columns must fit in one allocation
        let bytes = samples.checked_mul(size_of::<f64>())?;
        (bytes <= isize::MAX as usize).then_some(samples)
    }

    /// Sample period, which is also the integration step of any control law
    pub fn dt_s(&self) -> f64 {
        1.0 / self.sample_rate_hz
    }

    /// Number of outer iterations for a phase lasting `duration_s`
    fn blocks_for(&self, duration_s: f64) -> usize {
        (duration_s * self.sample_rate_hz / self.block_size as f64).ceil() as usize
    }

    pub fn warm_up_blocks(&self) -> usize {
        self.blocks_for(self.warm_up_s)
    }

    pub fn active_blocks(&self) -> usize {
        self.blocks_for(self.run_s)
    }

    /// Length of the record after a run that completes normally.
    /// Only meaningful for a configuration that passes `validate`.
    pub fn total_samples(&self) -> usize {
        (self.warm_up_blocks() + self.active_blocks()) * self.block_size
    }

    /// Wall-clock budget of one outer iteration
    pub fn block_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate_hz)
    }

    /// Length of the channel-grouped buffer passed to each block write
    pub fn write_len(&self) -> usize {
        self.block_size * self.output.n_channels
    }

    /// Length of the channel-grouped buffer filled by each block read
    pub fn read_len(&self) -> usize {
        self.block_size * self.input.n_channels
    }
}
