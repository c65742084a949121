//! Run the disturbance rejection loop against a simulated rig.
//!
//! Demonstrated here:
//!   * Configuring an experiment and saving it as json
//!   * Running with no hardware in the loop, paced at the sample clock
//!   * Recording to MessagePack and CSV, and reading the record back
//!
//! The plant's sensor is set to invert the rig calibration, so the calibrated
//! measurement is the plant displacement.

use std::path::PathBuf;

use distrej::daq::SecondOrderPlant;
use distrej::logging::init_logging;
use distrej::recorder::read_msgpack;
use distrej::*;

use tracing::{error, info};

fn rms(x: &[f64]) -> f64 {
    if x.is_empty() {
        return 0.0;
    }
    (x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64).sqrt()
}

fn main() {
    let mut ctx = ExperimentCtx::default();
    ctx.op_name = "hootl_example".to_owned();
    ctx.op_dir = PathBuf::from("./hootl_output");
    ctx.warm_up_s = 1.0;
    ctx.run_s = 5.0;

    if let Err(e) = init_logging(&ctx.op_dir, &ctx.op_name) {
        eprintln!("{e}");
        return;
    }

    // Internal model at the disturbance frequency, stepped at the sample period
    let control = InternalModel::matched(ctx.disturbance.omega(), -30.0, 0.0);
    let plant = SecondOrderPlant::new(60.0, 0.1).with_sensor_for(&ctx.calibration);

    let mut experiment = Experiment::new(ctx.clone(), Box::new(control));
    experiment.add_recorder(Box::new(MsgpackRecorder::new()));
    experiment.add_recorder(Box::new(CsvRecorder::new(true)));

    let config_path = ctx.op_dir.join(format!("{}.json", ctx.op_name));
    if let Err(e) = experiment.save(&config_path) {
        error!("{e}");
        return;
    }

    let mut device = SimDevice::new(plant).realtime(true);
    let outcome = match experiment.run(&mut device) {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("Experiment rejected: {e}");
            return;
        }
    };

    info!("Exit: {:?}", outcome.exit);
    info!("Stats: {:?}", outcome.stats);

    // Compare the last second of warm-up against the last second of control
    let n = ctx.sample_rate_hz as usize;
    let warm_end = (ctx.warm_up_blocks() * ctx.block_size).min(outcome.record.len());
    let warm = &outcome.record.y[warm_end.saturating_sub(n)..warm_end];
    let tail_start = outcome.record.len().saturating_sub(n).max(warm_end);
    let active = &outcome.record.y[tail_start..];
    info!(
        "RMS measurement: {:.4} open loop, {:.4} under control",
        rms(warm),
        rms(active)
    );

    for path in outcome.recorded.iter() {
        info!("Recorded {path:?}");
    }
    if let Some(path) = outcome.recorded.first() {
        match read_msgpack(path) {
            Ok(record) => info!("Read back {} samples", record.len()),
            Err(e) => error!("{e}"),
        }
    }
}
