//! Full runs through `Experiment::run` against the mock and simulated devices.

use std::f64::consts::PI;
use std::path::Path;

use approx::assert_relative_eq;

use distrej::daq::{MockOp, ReadSource, SecondOrderPlant};
use distrej::recorder::read_msgpack;
use distrej::*;

fn ctx_in(dir: &Path, name: &str) -> ExperimentCtx {
    let mut ctx = ExperimentCtx::default();
    ctx.sample_rate_hz = 5000.0;
    ctx.block_size = 100;
    ctx.warm_up_s = 0.0;
    ctx.run_s = 1.0;
    ctx.disturbance = SineDisturbance::new(1.5, 35.0, 0.0);
    ctx.calibration = Calibration::identity();
    ctx.op_dir = dir.to_path_buf();
    ctx.op_name = name.to_owned();
    ctx
}

#[test]
fn quiet_plant_one_second() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(dir.path(), "quiet");
    let control = InternalModel::matched(2.0 * PI * 35.0, -30.0, 0.0);
    let mut exp = Experiment::new(ctx, Box::new(control));
    exp.add_recorder(Box::new(MsgpackRecorder::new()));

    let mut dev = MockDevice::new(ReadSource::Constant(0.0));
    let out = exp.run(&mut dev).unwrap();

    assert_eq!(out.exit, ExitStatus::Completed);
    assert_eq!(out.record.len(), 5000);
    assert!(out.record.is_consistent());
    assert_eq!(out.stats.active_blocks, 50);

    for i in 0..5000 {
        let t = i as f64 / 5000.0;
        assert_eq!(out.record.t[i], t);
        assert_relative_eq!(
            out.record.d[i],
            1.5 * (2.0 * PI * 35.0 * t).sin(),
            epsilon = 1e-12
        );
        assert_eq!(out.record.y[i], 0.0);
        // An oscillator at rest with no error input stays at rest
        assert_eq!(out.record.u[i], 0.0);
    }

    let saved = read_msgpack(&dir.path().join("quiet.bin")).unwrap();
    assert_eq!(saved, out.record);
}

#[test]
fn record_length_covers_both_phases() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = ctx_in(dir.path(), "phases");
    ctx.warm_up_s = 0.5;
    ctx.run_s = 0.25;
    let expected = (ctx.warm_up_blocks() + ctx.active_blocks()) * ctx.block_size;
    assert_eq!(expected, 3800);

    let mut exp = Experiment::new(ctx, Box::new(PassThrough::new(0.5)));
    let mut dev = MockDevice::new(ReadSource::Loopback);
    let out = exp.run(&mut dev).unwrap();

    assert_eq!(out.exit, ExitStatus::Completed);
    assert_eq!(out.record.len(), expected);
    assert!(out.record.u[..2500].iter().all(|u| *u == 0.0));
    assert_eq!(dev.log().count(MockOp::Write), 39);
}

#[test]
fn internal_model_drives_simulated_rig() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = ctx_in(dir.path(), "sim");
    ctx.warm_up_s = 0.2;
    ctx.run_s = 1.0;
    ctx.calibration = Calibration::new(8000.0, -1.7);

    let plant = SecondOrderPlant::new(60.0, 0.1).with_sensor_for(&ctx.calibration);
    let control = InternalModel::matched(ctx.disturbance.omega(), -30.0, 0.0);
    let mut exp = Experiment::new(ctx, Box::new(control));
    exp.add_recorder(Box::new(CsvRecorder::new(true)));

    let mut dev = SimDevice::new(plant);
    let out = exp.run(&mut dev).unwrap();

    assert_eq!(out.exit, ExitStatus::Completed);
    assert_eq!(out.record.len(), 6000);
    assert!(out.record.y.iter().chain(out.record.u.iter()).all(|v| v.is_finite()));
    assert!(out.record.u[..1000].iter().all(|u| *u == 0.0));

    // The plant responds to the disturbance during warm-up
    assert!(out.record.y[200..1000].iter().any(|y| y.abs() > 0.1));
    // and the controller engages once active
    assert!(out.record.u[1000..].iter().any(|u| *u != 0.0));

    let csv = std::fs::read_to_string(dir.path().join("sim.csv")).unwrap();
    assert_eq!(csv.lines().count(), 6001);
}

#[test]
fn simulated_fault_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = ctx_in(dir.path(), "fault");
    let control = InternalModel::matched(ctx.disturbance.omega(), -30.0, 0.0);
    let mut exp = Experiment::new(ctx, Box::new(control));
    exp.add_recorder(Box::new(MsgpackRecorder::new()));

    let mut dev = SimDevice::new(SecondOrderPlant::default()).fault_after_blocks(10);
    let out = exp.run(&mut dev).unwrap();

    match &out.exit {
        ExitStatus::Aborted { reason } => assert!(reason.contains("underflow")),
        other => panic!("expected an abort, got {other:?}"),
    }
    assert!(out.record.len() == 1000 || out.record.len() == 1100);

    // What was recorded before the fault is still saved
    let saved = read_msgpack(&out.recorded[0]).unwrap();
    assert_eq!(saved.len(), out.record.len());
}
