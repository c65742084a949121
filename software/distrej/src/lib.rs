//! Adaptive internal-model disturbance rejection on a block-synchronous analog I/O loop.
//!
//! A known sinusoidal disturbance is injected into a plant while a control law,
//! by default an internal-model oscillator tuned to the disturbance frequency,
//! computes a cancellation command from the measured response. The full
//! `(t, d, u, y)` history of each run is recorded for offline analysis.

pub mod calc;
pub mod daq;
pub mod experiment;
pub mod logging;
pub mod math;
pub mod recorder;

pub use calc::{Calibration, ControlLaw, InternalModel, PassThrough, Pid, SineDisturbance};
pub use daq::{Device, MockDevice, SecondOrderPlant, SimDevice};
pub use experiment::context::ExperimentCtx;
pub use experiment::{Experiment, ExitStatus, LoopPhase, RunOutcome, RunStats};
pub use recorder::{CsvRecorder, MsgpackRecorder, Recorder, TimeSeriesRecord};
