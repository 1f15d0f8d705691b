use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lsm_ctrl_backend::sim::{DaqCall, SimDaq, SimStage};
use lsm_ctrl_backend::*;

use lsm_compiler_backend::MIDSCALE_SAMPLE;

const POLL: Duration = Duration::from_millis(2);

struct Bench {
    daq: Arc<SimDaq>,
    stage: Arc<SimStage>,
    instrument: Instrument,
    log: MessageLog,
}

fn bench_with(config: InstrumentConfig, daq_scale: f64, stage_scale: f64) -> Bench {
    let daq = Arc::new(SimDaq::new().with_time_scale(daq_scale));
    let stage = Arc::new(SimStage::new().with_time_scale(stage_scale));
    let (sink, log) = MessageSink::new();
    let instrument =
        Instrument::with_poll_interval(config, daq.clone(), stage.clone(), sink, POLL).unwrap();
    Bench {
        daq,
        stage,
        instrument,
        log,
    }
}

fn bench(daq_scale: f64, stage_scale: f64) -> Bench {
    bench_with(InstrumentConfig::default(), daq_scale, stage_scale)
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(POLL);
    }
}

/// Connects the board and waits for the initial looping push to be on air.
fn connect_looping(bench: &Bench) {
    let _looping = bench.instrument.connect_daq(None).unwrap();
    let daq = bench.instrument.daq().clone();
    wait_until("continuous playback", move || {
        daq.state() == DaqState::Playing(PlaybackMode::ContinuousLoop)
    });
}

fn single_sweeps(calls: &[DaqCall]) -> usize {
    calls
        .iter()
        .filter(|call| matches!(call, DaqCall::AOutScan(req) if !req.continuous))
        .count()
}

fn assert_quiet(bench: &Bench) {
    let coord = bench.instrument.coordinator();
    assert_eq!(coord.outstanding(DeviceKind::Daq), 0);
    assert_eq!(coord.outstanding(DeviceKind::Stage), 0);
    assert_eq!(
        bench.instrument.daq().playback_mode(),
        PlaybackMode::ContinuousLoop
    );
    assert!(!matches!(
        bench.instrument.daq().state(),
        DaqState::Playing(_)
    ));
}

#[test]
fn structural_run_visits_every_tile() {
    let bench = bench(0., 0.);
    connect_looping(&bench);
    bench.instrument.connect_stage().unwrap();
    bench.instrument.recenter_stage().unwrap().join().unwrap();
    assert_eq!(bench.instrument.stage_position(), (0., 0.));

    // 100 µm light sheet along Y, 660 µm field of view along X
    let plan = bench.instrument.structural_plan(250, 1000).unwrap();
    assert_eq!((plan.y_steps, plan.x_steps), (3, 2));
    assert_eq!(plan.frames, 6 * 20);

    bench.daq.clear_calls();
    let run = bench.instrument.start_structural(plan).unwrap();
    let progress = run.run().clone();
    run.join().unwrap();

    assert_eq!(progress.completed(), 6);
    assert_eq!(progress.mode(), AcquisitionMode::Structural);
    assert_eq!(single_sweeps(&bench.daq.calls()), 6);
    assert_quiet(&bench);

    // Back at the starting corner, give or take the microstep rounding of each move
    let (y, x) = bench.instrument.stage_position();
    let step = bench.instrument.stage().microstep_um();
    assert!(y.abs() <= 3. * step, "y = {}", y);
    assert!(x.abs() <= 2. * step, "x = {}", x);
    bench.instrument.shutdown().unwrap();
}

#[test]
fn cancelled_structural_run_cleans_up() {
    // Each 100 µm row step takes 20 ms, long enough to cancel between tiles
    for cancel_after in [0, 1, 4] {
        let bench = bench(0., 0.2);
        connect_looping(&bench);
        bench.instrument.connect_stage().unwrap();
        let plan = bench.instrument.structural_plan(300, 1300).unwrap();
        let run = bench.instrument.start_structural(plan).unwrap();
        let progress = run.run().clone();
        {
            let progress = progress.clone();
            wait_until("tiles", move || progress.completed() >= cancel_after);
        }
        run.cancel();
        run.join().unwrap();

        assert!(progress.is_cancelled());
        assert!(progress.completed() < progress.planned(), "cancel_after {}", cancel_after);
        assert_quiet(&bench);
        bench.instrument.shutdown().unwrap();
    }
}

#[test]
fn functional_run_terminates_output() {
    let bench = bench(0., 0.);
    connect_looping(&bench);
    let run = bench
        .instrument
        .start_functional(FunctionalSettings {
            scan_time_s: 0.05,
            time_delay_s: None,
        })
        .unwrap();
    let progress = run.run().clone();
    run.join().unwrap();

    assert_eq!(progress.completed(), 1);
    assert_quiet(&bench);
    assert_eq!(bench.instrument.daq().state(), DaqState::Loaded);
    for chan in 0..4 {
        assert_eq!(bench.daq.output(chan), Some(MIDSCALE_SAMPLE));
    }
    let lines: Vec<String> = bench.log.drain().iter().map(|e| e.text()).collect();
    assert!(lines
        .iter()
        .any(|l| l == "Assigned time has elapsed. DAQ trigger is terminating now."));
}

#[test]
fn time_lapse_plays_single_sweeps() {
    let mut config = InstrumentConfig::default();
    config.scan.trigger_active = false;
    let bench = bench_with(config, 0., 0.);
    connect_looping(&bench);
    let generation = bench.instrument.daq().generation();

    bench.daq.clear_calls();
    // 1 s at 4 volumes per second
    let run = bench.instrument.start_time_lapse(1.0, 0.001).unwrap();
    assert_eq!(run.run().planned(), 4);
    assert_eq!(run.run().mode(), AcquisitionMode::TimeLapse);
    let progress = run.run().clone();
    run.join().unwrap();

    assert_eq!(progress.completed(), 4);
    assert_eq!(single_sweeps(&bench.daq.calls()), 4);
    // The trigger was switched on and a fresh signal staged for the run
    assert!(bench.instrument.parameters().trigger_active);
    assert!(bench.instrument.daq().generation() > generation);
    let done: Vec<String> = bench
        .log
        .drain()
        .iter()
        .map(|e| e.text())
        .filter(|t| t.starts_with("Done with"))
        .collect();
    assert_eq!(done.last().map(String::as_str), Some("Done with 4 out of 4 sweeps in time-lapse"));
    assert_quiet(&bench);
}

#[test]
fn cancelled_time_lapse_cleans_up() {
    let bench = bench(0., 0.);
    connect_looping(&bench);
    bench.daq.clear_calls();
    // 8 sweeps, 5 s apart
    let run = bench.instrument.start_time_lapse(2.0, 5.0).unwrap();
    let progress = run.run().clone();
    {
        let daq = bench.daq.clone();
        wait_until("first sweep", move || single_sweeps(&daq.calls()) >= 1);
    }
    // Well inside the pause after the first sweep
    thread::sleep(Duration::from_millis(20));
    let cancelled_at = Instant::now();
    run.cancel();
    run.join().unwrap();

    assert!(cancelled_at.elapsed() < Duration::from_secs(2));
    assert!(progress.is_cancelled());
    assert_eq!(progress.completed(), 1);
    assert_eq!(single_sweeps(&bench.daq.calls()), 1);
    assert_quiet(&bench);
    bench.instrument.shutdown().unwrap();
}

#[test]
fn continuous_jog_runs_until_halted() {
    let bench = bench(0., 1.);
    bench.instrument.connect_stage().unwrap();
    let (y0, _) = bench.instrument.stage_position();
    let step = bench.instrument.stage().microstep_um();

    let jog = bench
        .instrument
        .jog_continuous(Axis::Y, JogDirection::Forward)
        .unwrap();
    let stage = bench.stage.clone();
    wait_until("stage motion", move || stage.is_moving());
    // Headed for the forward end of travel
    let target = bench.stage.raw_target().0 as f64 * step;
    assert!((target - 12_700.).abs() <= 2. * step, "target {} µm", target);
    assert!(matches!(
        bench.instrument.jog(Axis::X, 10.),
        Err(ControlError::InvalidState(_))
    ));

    thread::sleep(Duration::from_millis(30));
    let (y, _) = bench.instrument.halt_stage().unwrap();
    jog.join().unwrap();
    assert!(y > y0 && y < 12_700., "halted at {} µm", y);
    assert!(y - y0 < 1000., "moved {} µm", y - y0);
}

#[test]
fn jog_refused_while_stage_busy() {
    let bench = bench(0., 1.);
    bench.instrument.connect_stage().unwrap();
    let (_, x0) = bench.instrument.stage_position();
    // 2 mm at the 1 mm/s jog velocity
    let first = bench.instrument.jog(Axis::X, 2000.).unwrap();
    assert!(matches!(
        bench.instrument.jog(Axis::Y, 10.),
        Err(ControlError::InvalidState(_))
    ));
    let stage = bench.stage.clone();
    wait_until("stage motion", move || stage.is_moving());
    let (_, x) = bench.instrument.halt_stage().unwrap();
    first.join().unwrap();
    assert!(x - x0 < 1000., "moved {} µm", x - x0);
    bench.instrument.coordinator().await_count(DeviceKind::Stage, 0);
    assert!(bench.instrument.jog(Axis::Y, 10.).is_ok());
    assert!(!bench.stage.calls().is_empty());
}

#[test]
fn incompatible_rates_fall_back() {
    let bench = bench(0., 0.);
    let mut scan = bench.instrument.scan_settings();
    scan.fps = 40;
    scan.vps = 2.;
    // No board: nothing to push
    assert!(bench.instrument.update_parameters(scan.clone()).unwrap().is_none());

    scan.vps = 3.;
    bench.instrument.update_parameters(scan).unwrap();
    let params = bench.instrument.parameters();
    assert_eq!((params.fps, params.vps), (40, 2.));

    let mut bad = bench.instrument.scan_settings();
    bad.laser_index = 9;
    assert!(matches!(
        bench.instrument.update_parameters(bad),
        Err(ControlError::Configuration(_))
    ));
    assert_eq!(bench.instrument.parameters().laser_index, 1);
}

#[test]
fn soft_limits_shape_the_plan() {
    let bench = bench(0., 0.);
    bench.instrument.connect_stage().unwrap();
    bench.instrument.recenter_stage().unwrap().join().unwrap();
    let y_neg = bench.instrument.set_limit(LimitSide::YNeg).unwrap();
    bench.instrument.jog(Axis::Y, 350.).unwrap().join().unwrap();
    bench.instrument.set_limit(LimitSide::YPos).unwrap();

    let limits = bench.instrument.limits();
    let range = limits.y_range_um().unwrap();
    assert!((349..=350).contains(&range));
    let plan = bench.instrument.structural_plan(100, 100).unwrap();
    assert_eq!(plan.y_range_um, range);
    assert_eq!(plan.y_steps, 4);
    assert_eq!(plan.start_y, Some(y_neg));
    assert_eq!(plan.start_x, None);

    bench.instrument.reset_limits();
    assert_eq!(bench.instrument.limits(), SoftLimits::default());
}

#[test]
fn negative_limit_alone_sets_the_start() {
    let bench = bench(0., 0.);
    bench.instrument.connect_stage().unwrap();
    bench.instrument.recenter_stage().unwrap().join().unwrap();
    bench.instrument.jog(Axis::Y, 200.).unwrap().join().unwrap();
    let y_neg = bench.instrument.set_limit(LimitSide::YNeg).unwrap();
    bench.instrument.jog(Axis::Y, 300.).unwrap().join().unwrap();

    let plan = bench.instrument.structural_plan(100, 100).unwrap();
    assert_eq!(plan.start_y, Some(y_neg));
    assert_eq!(plan.y_range_um, 100);
    assert_eq!(plan.y_steps, 1);
    assert_eq!(plan.start_x, None);
}

#[test]
fn lost_board_ends_the_run() {
    let bench = bench(0., 0.);
    connect_looping(&bench);
    let run = bench
        .instrument
        .start_functional(FunctionalSettings {
            scan_time_s: 0.5,
            time_delay_s: None,
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    bench.daq.unplug();
    assert!(matches!(run.join(), Err(ControlError::ConnectionLost(_))));
    assert_eq!(bench.instrument.daq().state(), DaqState::Disconnected);
    assert_eq!(bench.instrument.coordinator().outstanding(DeviceKind::Daq), 0);
}

#[test]
fn config_survives_disk() {
    let bench = bench(0., 0.);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lsm.json");
    let mut config = bench.instrument.config();
    config.stage.jog_velocity = 2.5;
    config.daq.board = 2;
    config.save(&path).unwrap();
    assert_eq!(InstrumentConfig::from_json_file(&path).unwrap(), config);
    assert!(InstrumentConfig::from_json_file(dir.path().join("missing.json")).is_err());
}
