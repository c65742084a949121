//! Sample-synchronized control loop and the experiment that configures it

mod abort;
pub mod context;
mod timing;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::calc::ControlLaw;
use crate::daq::{DaqError, Device, InputTask, OutputTask, Task, TaskTiming};
use crate::recorder::{Recorder, TimeSeriesRecord};

pub use abort::AbortSignal;
use context::ExperimentCtx;
pub use timing::RunStats;
use timing::BlockTimer;

/// Task names given to the driver
pub const OUTPUT_TASK: &str = "ao";
pub const INPUT_TASK: &str = "ai";

/// Where the loop is in a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopPhase {
    /// Disturbance only, command held at zero
    WarmUp,

    /// Control law engaged
    Active,

    /// Releasing tasks and persisting the record
    Finalizing,

    Terminated,
}

/// Why a run ended
#[derive(Clone, Debug, PartialEq)]
pub enum ExitStatus {
    /// Every block of both phases was written and read
    Completed,

    /// A driver call failed
    Hardware(DaqError),

    /// The driver reported an asynchronous failure through the completion callback
    Aborted { reason: String },

    /// A calibrated measurement or a command was not finite.
    /// The offending sample is not recorded.
    NonFinite { sample: usize, y: f64, u: f64 },
}

impl ExitStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Everything a run produced, whether or not it completed
#[derive(Debug)]
pub struct RunOutcome {
    pub exit: ExitStatus,
    pub record: TimeSeriesRecord,
    pub stats: RunStats,

    /// Phase the loop was in when it stopped, `WarmUp` if the tasks never started
    pub stopped_in: LoopPhase,

    /// Files written by the recorders that succeeded
    pub recorded: Vec<PathBuf>,
}

/// A disturbance-rejection experiment: run configuration, the control law
/// engaged during the active phase, and where to put the record.
#[derive(Serialize, Deserialize, Debug)]
pub struct Experiment {
    pub ctx: ExperimentCtx,
    control: Box<dyn ControlLaw>,
    recorders: Vec<Box<dyn Recorder>>,
}

impl Experiment {
    pub fn new(ctx: ExperimentCtx, control: Box<dyn ControlLaw>) -> Self {
        Self {
            ctx,
            control,
            recorders: Vec::new(),
        }
    }

    /// Register a sink for the record
    pub fn add_recorder(&mut self, recorder: Box<dyn Recorder>) {
        self.recorders.push(recorder);
    }

    pub fn control(&self) -> &dyn ControlLaw {
        self.control.as_ref()
    }

    pub fn to_json(&self) -> Result<String, String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize experiment: {e}"))
    }

    pub fn from_json(s: &str) -> Result<Self, String> {
        serde_json::from_str(s).map_err(|e| format!("Failed to parse experiment: {e}"))
    }

    /// Read an experiment from a json file
    pub fn load(path: &Path) -> Result<Self, String> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read experiment from {path:?}: {e}"))?;
        Self::from_json(&s)
    }

    /// Write this experiment to a json file
    pub fn save(&self, path: &Path) -> Result<(), String> {
        std::fs::write(path, self.to_json()?)
            .map_err(|e| format!("Failed to write experiment to {path:?}: {e}"))
    }

    /// Run the loop to completion or to the first fatal error.
    ///
    /// Returns `Err` only if the configuration or the control law is rejected,
    /// in which case the device is never touched. Once tasks are being created,
    /// every outcome passes through finalization: both tasks are stopped and
    /// cleared, the control law is terminated, and the record (up to the last
    /// good sample) goes to every recorder.
    pub fn run(&mut self, device: &mut dyn Device) -> Result<RunOutcome, String> {
        let ctx = self.ctx.clone();
        ctx.validate()?;
        self.control.init(&ctx)?;

        #[cfg(feature = "affinity")]
        pin_loop_thread();

        info!(
            "Starting `{}`: {} warm-up + {} active blocks of {} samples at {} Hz",
            ctx.op_name,
            ctx.warm_up_blocks(),
            ctx.active_blocks(),
            ctx.block_size,
            ctx.sample_rate_hz
        );

        let abort = AbortSignal::new();
        let mut record = TimeSeriesRecord::with_capacity(ctx.total_samples());
        let mut stats = RunStats::default();
        let mut tasks = Tasks::default();
        let mut phase = LoopPhase::WarmUp;

        let exit = match tasks.open(device, &ctx, &abort) {
            Ok((output, input)) => run_blocks(
                &ctx,
                self.control.as_mut(),
                output,
                input,
                &abort,
                &mut phase,
                &mut record,
                &mut stats,
            ),
            Err(e) => hardware_exit(e, &abort),
        };

        let stopped_in = phase;
        phase = LoopPhase::Finalizing;
        info!(
            "{phase:?} after {} blocks, stopped in {stopped_in:?}: {exit:?}",
            stats.blocks()
        );
        tasks.close();
        self.control.terminate();

        let mut recorded = Vec::with_capacity(self.recorders.len());
        for recorder in self.recorders.iter_mut() {
            match recorder.record(&ctx, &record) {
                Ok(path) => recorded.push(path),
                Err(e) => error!("Recorder failed: {e}"),
            }
        }

        phase = LoopPhase::Terminated;
        info!(
            "{phase:?} with {} samples recorded, worst block compute {:.3} ms, {} overruns",
            record.len(),
            stats.worst_compute.as_secs_f64() * 1e3,
            stats.overruns
        );

        Ok(RunOutcome {
            exit,
            record,
            stats,
            stopped_in,
            recorded,
        })
    }
}

/// Block loop over both phases.
///
/// The input block read at the end of block `k` supplies the measurements for
/// block `k + 1`, and block 0 sees a zeroed buffer.
/// `phase` is left at the phase the loop stopped in.
#[allow(clippy::too_many_arguments)]
fn run_blocks(
    ctx: &ExperimentCtx,
    control: &mut dyn ControlLaw,
    output: &mut dyn OutputTask,
    input: &mut dyn InputTask,
    abort: &AbortSignal,
    phase: &mut LoopPhase,
    record: &mut TimeSeriesRecord,
    stats: &mut RunStats,
) -> ExitStatus {
    let n = ctx.block_size;
    let warm_up_blocks = ctx.warm_up_blocks();
    let total_blocks = warm_up_blocks + ctx.active_blocks();

    let mut write_buf = vec![0.0; ctx.write_len()];
    let mut read_buf = vec![0.0; ctx.read_len()];
    let mut timer = BlockTimer::new(ctx.block_deadline());
    *phase = LoopPhase::WarmUp;
    if warm_up_blocks > 0 {
        info!("Entering warm-up");
    }

    for block in 0..total_blocks {
        if abort.is_tripped() {
            return aborted(abort);
        }
        if block == warm_up_blocks {
            *phase = LoopPhase::Active;
            info!("Entering active control at block {block}");
        }

        timer.start_block();
        for j in 0..n {
            let i = block * n + j;
            let t = i as f64 / ctx.sample_rate_hz;
            let d = ctx.disturbance.value_at(t);
            let y = ctx.calibration.apply(read_buf[j]);
            if !y.is_finite() {
                error!("Non-finite measurement at sample {i}: {y}");
                return ExitStatus::NonFinite { sample: i, y, u: 0.0 };
            }

            let u = match *phase {
                LoopPhase::Active => control.tick(y),
                _ => 0.0,
            };
            if !u.is_finite() {
                error!("Non-finite command at sample {i}: {u}");
                return ExitStatus::NonFinite { sample: i, y, u };
            }

            record.push(t, d, u, y);
            write_buf[j] = d;
            write_buf[n + j] = u;
        }
        timer.end_compute(block, stats);

        if let Err(e) = output.write(&write_buf, ctx.write_timeout_s) {
            return hardware_exit(e, abort);
        }
        if let Err(e) = input.read(&mut read_buf, ctx.read_timeout_s) {
            return hardware_exit(e, abort);
        }
        timer.end_block(*phase, stats);
    }

    // A failure reported during the last block still invalidates the run
    if abort.is_tripped() {
        return aborted(abort);
    }
    ExitStatus::Completed
}

fn aborted(abort: &AbortSignal) -> ExitStatus {
    let reason = abort
        .reason()
        .unwrap_or_else(|| "abort requested".to_owned());
    warn!("Stopping at block boundary: {reason}");
    ExitStatus::Aborted { reason }
}

/// A failed driver call after an asynchronous failure is a symptom of it,
/// so the asynchronous reason takes precedence.
fn hardware_exit(err: DaqError, abort: &AbortSignal) -> ExitStatus {
    error!("{err}");
    if abort.is_tripped() {
        return aborted(abort);
    }
    ExitStatus::Hardware(err)
}

/// The pair of tasks for one run, held so they can be released on any exit path
#[derive(Default)]
struct Tasks {
    output: Option<Box<dyn OutputTask>>,
    input: Option<Box<dyn InputTask>>,
}

impl Tasks {
    /// Create, configure, prime with one zero block, and start both tasks
    fn open<'a>(
        &'a mut self,
        device: &mut dyn Device,
        ctx: &ExperimentCtx,
        abort: &AbortSignal,
    ) -> Result<(&'a mut dyn OutputTask, &'a mut dyn InputTask), DaqError> {
        let timing = TaskTiming::continuous(ctx);

        let output = self
            .output
            .insert(device.create_output_task(OUTPUT_TASK, &ctx.output)?);
        output.configure_timing(&timing)?;
        let callback = abort.done_callback(output.name());
        output.register_done_event(callback)?;

        let input = self
            .input
            .insert(device.create_input_task(INPUT_TASK, &ctx.input)?);
        input.configure_timing(&timing)?;

        output.write(&vec![0.0; ctx.write_len()], ctx.write_timeout_s)?;
        output.start()?;
        input.start()?;

        Ok((&mut **output, &mut **input))
    }

    /// Stop then clear whatever was created. Failures are logged and do not stop the rest.
    fn close(&mut self) {
        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.stop() {
                error!("Teardown: {e}");
            }
        }
        if let Some(input) = self.input.as_mut() {
            if let Err(e) = input.stop() {
                error!("Teardown: {e}");
            }
        }
        if let Some(mut output) = self.output.take() {
            if let Err(e) = output.clear() {
                error!("Teardown: {e}");
            }
        }
        if let Some(mut input) = self.input.take() {
            if let Err(e) = input.clear() {
                error!("Teardown: {e}");
            }
        }
    }
}

/// Pin the loop to the first core and raise its priority, where the platform allows
#[cfg(feature = "affinity")]
fn pin_loop_thread() {
    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
    match core_ids.first() {
        Some(core) if core_affinity::set_for_current(*core) => {}
        _ => warn!("Unable to pin the control loop to a core"),
    }
    if let Err(e) =
        thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
    {
        warn!("Unable to raise control loop priority: {e:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calc::{Calibration, InternalModel, PassThrough};
    use crate::daq::{MockDevice, MockOp, ReadSource};
    use crate::recorder::{MsgpackRecorder, read_msgpack};

    /// 1 kHz, 100-sample blocks, 3 warm-up and 5 active blocks
    fn small_ctx(dir: &Path) -> ExperimentCtx {
        let mut ctx = ExperimentCtx::default();
        ctx.sample_rate_hz = 1000.0;
        ctx.block_size = 100;
        ctx.warm_up_s = 0.25;
        ctx.run_s = 0.5;
        ctx.calibration = Calibration::identity();
        ctx.op_dir = dir.to_path_buf();
        ctx.op_name = "test".to_owned();
        ctx
    }

    #[test]
    fn test_warm_up_isolation_and_block_latency() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = small_ctx(dir.path());
        assert_eq!(ctx.warm_up_blocks(), 3);
        assert_eq!(ctx.active_blocks(), 5);

        let mut exp = Experiment::new(ctx, Box::new(PassThrough::new(1.0)));
        let mut dev = MockDevice::new(ReadSource::BlockIndex);
        let out = exp.run(&mut dev).unwrap();

        assert_eq!(out.exit, ExitStatus::Completed);
        assert_eq!(out.record.len(), 800);
        assert_eq!(out.stats.warm_up_blocks, 3);
        assert_eq!(out.stats.active_blocks, 5);
        assert_eq!(out.stopped_in, LoopPhase::Active);

        for i in 0..800 {
            let block = i / 100;
            // Read k fills with k + 1 and feeds block k + 1
            assert_eq!(out.record.y[i], block as f64);
            if block < 3 {
                assert_eq!(out.record.u[i], 0.0);
            } else {
                assert_eq!(out.record.u[i], out.record.y[i]);
            }
            assert_eq!(out.record.t[i], i as f64 / 1000.0);
        }
    }

    #[test]
    fn test_written_blocks_are_channel_grouped() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(-2.0)));
        let mut dev = MockDevice::new(ReadSource::Constant(0.5));
        let out = exp.run(&mut dev).unwrap();
        let log = dev.log();

        // One zero block before start, then one per loop block
        assert_eq!(log.writes.len(), 9);
        assert!(log.writes[0].iter().all(|v| *v == 0.0));
        for (b, w) in log.writes[1..].iter().enumerate() {
            let span = b * 100..(b + 1) * 100;
            assert_eq!(&w[..100], &out.record.d[span.clone()]);
            assert_eq!(&w[100..], &out.record.u[span]);
        }
        // First active block sees the constant reading
        assert_eq!(out.record.u[300], -1.0);
    }

    #[test]
    fn test_task_lifecycle_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(0.0)));
        let mut dev = MockDevice::new(ReadSource::Constant(0.0));
        exp.run(&mut dev).unwrap();

        let log = dev.log();
        assert_eq!(
            log.ops[..8],
            [
                MockOp::CreateOutput,
                MockOp::ConfigureOutput,
                MockOp::RegisterDone,
                MockOp::CreateInput,
                MockOp::ConfigureInput,
                MockOp::Write,
                MockOp::StartOutput,
                MockOp::StartInput,
            ]
        );
        assert_eq!(
            log.ops[log.ops.len() - 4..],
            [
                MockOp::StopOutput,
                MockOp::StopInput,
                MockOp::ClearOutput,
                MockOp::ClearInput,
            ]
        );
        assert_eq!(log.count(MockOp::Read), 8);
    }

    #[test]
    fn test_read_failure_finalizes_and_keeps_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(1.0)));
        exp.add_recorder(Box::new(MsgpackRecorder::new()));
        let mut dev = MockDevice::new(ReadSource::Constant(0.1)).fail_on(MockOp::Read, 2);

        let out = exp.run(&mut dev).unwrap();

        assert!(matches!(out.exit, ExitStatus::Hardware(DaqError::Read { .. })));
        // Block 2 was computed and written before its read failed
        assert_eq!(out.record.len(), 300);
        assert_eq!(out.stats.blocks(), 2);
        assert_eq!(out.stopped_in, LoopPhase::WarmUp);

        let log = dev.log();
        assert_eq!(log.count(MockOp::ClearOutput), 1);
        assert_eq!(log.count(MockOp::ClearInput), 1);

        assert_eq!(out.recorded, vec![dir.path().join("test.bin")]);
        let saved = read_msgpack(&out.recorded[0]).unwrap();
        assert_eq!(saved, out.record);
    }

    #[test]
    fn test_setup_failure_releases_created_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(1.0)));
        let mut dev = MockDevice::new(ReadSource::Constant(0.0)).fail_on(MockOp::StartInput, 0);

        let out = exp.run(&mut dev).unwrap();

        assert!(matches!(out.exit, ExitStatus::Hardware(DaqError::Start { .. })));
        assert!(out.record.is_empty());
        assert_eq!(out.stopped_in, LoopPhase::WarmUp);
        let log = dev.log();
        assert_eq!(log.count(MockOp::Read), 0);
        assert_eq!(log.count(MockOp::StopInput), 1);
        assert_eq!(log.count(MockOp::ClearOutput), 1);
    }

    #[test]
    fn test_async_fault_stops_at_next_block_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(1.0)));
        // Third write: zero block, block 0, then block 1
        let mut dev = MockDevice::new(ReadSource::Constant(0.0)).async_fault_on_write(3);

        let out = exp.run(&mut dev).unwrap();

        match &out.exit {
            ExitStatus::Aborted { reason } => assert!(reason.contains("injected")),
            other => panic!("expected an abort, got {other:?}"),
        }
        assert_eq!(out.record.len(), 200);
        assert_eq!(out.stats.blocks(), 2);
        assert_eq!(dev.log().count(MockOp::ClearInput), 1);
    }

    #[test]
    fn test_non_finite_measurement_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(PassThrough::new(1.0)));
        let mut samples = vec![0.0; 300];
        samples[150] = f64::NAN;
        let mut dev = MockDevice::new(ReadSource::Sequence(samples));

        let out = exp.run(&mut dev).unwrap();

        // Read 1 feeds block 2, so its 50th sample is global sample 250
        match out.exit {
            ExitStatus::NonFinite { sample, y, .. } => {
                assert_eq!(sample, 250);
                assert!(y.is_nan());
            }
            other => panic!("expected a non-finite exit, got {other:?}"),
        }
        assert_eq!(out.record.len(), 250);
        assert_eq!(out.stopped_in, LoopPhase::WarmUp);
        assert!(out.record.y.iter().all(|y| y.is_finite()));
    }

    #[test]
    fn test_rejected_config_never_touches_device() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = small_ctx(dir.path());
        ctx.block_size = 0;
        let mut exp = Experiment::new(ctx, Box::new(PassThrough::new(1.0)));
        let mut dev = MockDevice::new(ReadSource::Constant(0.0));
        assert!(exp.run(&mut dev).is_err());
        assert!(dev.log().ops.is_empty());

        // More samples than the record can hold
        let mut ctx = small_ctx(dir.path());
        ctx.run_s = 1e17;
        let mut exp = Experiment::new(ctx, Box::new(PassThrough::new(1.0)));
        assert!(exp.run(&mut dev).is_err());
        assert!(dev.log().ops.is_empty());

        // Integration step that does not match the sample period
        let law = InternalModel::new(2.0 * core::f64::consts::PI * 35.0, -30.0, 0.0, 1e-4);
        let mut exp = Experiment::new(small_ctx(dir.path()), Box::new(law));
        assert!(exp.run(&mut dev).is_err());
        assert!(dev.log().ops.is_empty());
    }

    #[test]
    fn test_empty_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = small_ctx(dir.path());
        ctx.warm_up_s = 0.0;
        ctx.run_s = 0.0;
        let mut exp = Experiment::new(ctx, Box::new(PassThrough::new(1.0)));
        let mut dev = MockDevice::new(ReadSource::Constant(0.0));

        let out = exp.run(&mut dev).unwrap();
        assert_eq!(out.exit, ExitStatus::Completed);
        assert!(out.record.is_empty());
        assert_eq!(dev.log().writes.len(), 1);
    }

    #[test]
    fn test_ser_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut exp = Experiment::new(
            small_ctx(dir.path()),
            Box::new(InternalModel::matched(2.0 * core::f64::consts::PI * 35.0, -30.0, 0.0)),
        );
        exp.add_recorder(Box::new(MsgpackRecorder::new()));

        let path = dir.path().join("experiment.json");
        exp.save(&path).unwrap();
        let loaded = Experiment::load(&path).unwrap();

        assert_eq!(exp.to_json().unwrap(), loaded.to_json().unwrap());
        assert_eq!(loaded.recorders.len(), 1);
    }
}
