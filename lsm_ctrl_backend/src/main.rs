use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lsm_compiler_backend::{compile_sweep, ImagingParameters};
use lsm_ctrl_backend::driver::{DaqDriver, StageDriver};
use lsm_ctrl_backend::{
    ControlError, FunctionalSettings, Instrument, InstrumentConfig, MessageLog, MessageSink,
};

/// Light-sheet microscope controller
#[derive(Parser, Debug)]
#[command(name = "lsm_ctrl", version, about, long_about = None)]
struct Args {
    /// JSON configuration record
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Speed-up of the simulated hardware (0 completes instantly)
    #[arg(long, default_value_t = 1.0)]
    sim_time_scale: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile the configured sweep and print its layout
    Synth {
        #[arg(long)]
        fps: Option<u32>,
        #[arg(long)]
        vps: Option<f64>,
    },
    /// Tiled mosaic over the given ranges
    Structural {
        /// µm along Y
        #[arg(long, default_value_t = 300)]
        y_range: u32,
        /// µm along X
        #[arg(long, default_value_t = 600)]
        x_range: u32,
        /// Recenter the stage first
        #[arg(long)]
        recenter: bool,
    },
    /// Continuous triggering, or a time-lapse with --delay
    Functional {
        /// Total acquisition time, s
        #[arg(long, default_value_t = 2.0)]
        scan_time: f64,
        /// Pause after each sweep, s
        #[arg(long)]
        delay: Option<f64>,
    },
    /// Drive the stage to the center of its travel and zero the position
    Recenter,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        tracing::error!("{}", err);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), ControlError> {
    let config = match &args.config {
        Some(path) => InstrumentConfig::from_json_file(path)?,
        None => InstrumentConfig::default(),
    };
    if let Command::Synth { fps, vps } = &args.command {
        return synth(&config, *fps, *vps);
    }

    let (sink, log) = MessageSink::new();
    let instrument = Instrument::new(
        config,
        daq_driver(args.sim_time_scale),
        stage_driver(args.sim_time_scale),
        sink,
    )?;
    let result = run_on(&instrument, &args.command);
    let shutdown = instrument.shutdown();
    print_status(&log);
    result.and(shutdown)
}

fn run_on(instrument: &Instrument, command: &Command) -> Result<(), ControlError> {
    match command {
        Command::Synth { .. } => Ok(()),
        Command::Recenter => {
            instrument.connect_stage()?;
            instrument.recenter_stage()?.join()?;
            let (y, x) = instrument.stage_position();
            println!("Stage at ({}, {}) µm", y, x);
            Ok(())
        }
        Command::Functional { scan_time, delay } => {
            // The looping push started on connect ends when the run terminates the output
            let _looping = instrument.connect_daq(None)?;
            let run = instrument.start_functional(FunctionalSettings {
                scan_time_s: *scan_time,
                time_delay_s: *delay,
            })?;
            let progress = run.run().clone();
            run.join()?;
            println!(
                "{:?} run: {} of {} sweeps",
                progress.mode(),
                progress.completed(),
                progress.planned()
            );
            Ok(())
        }
        Command::Structural {
            y_range,
            x_range,
            recenter,
        } => {
            let _looping = instrument.connect_daq(None)?;
            instrument.connect_stage()?;
            if *recenter {
                instrument.recenter_stage()?.join()?;
            }
            let plan = instrument.structural_plan(*y_range, *x_range)?;
            println!(
                "{} x {} tiles of {} x {} µm, {} frames",
                plan.y_steps, plan.x_steps, plan.y_step_um, plan.x_step_um, plan.frames
            );
            let run = instrument.start_structural(plan)?;
            let progress = run.run().clone();
            run.join()?;
            println!("Imaged {} of {} tiles", progress.completed(), progress.planned());
            Ok(())
        }
    }
}

fn synth(config: &InstrumentConfig, fps: Option<u32>, vps: Option<f64>) -> Result<(), ControlError> {
    let params = ImagingParameters::from_config(&config.optics, &config.scan)?;
    let params = params.with_rates(fps.unwrap_or(params.fps), vps.unwrap_or(params.vps));
    let sweep = compile_sweep(&params)?;
    println!("sample rate       {} S/s per channel", sweep.sample_rate);
    println!(
        "points per ramp   {}{}",
        sweep.points_per_ramp,
        if sweep.ppr_clamped { " (capped)" } else { "" }
    );
    println!("image planes      {}", sweep.image_planes);
    println!("samples/exposure  {}", sweep.samples_per_exposure);
    println!("samples/channel   {}", sweep.buffer.samples_per_channel());
    println!("sweep duration    {:?}", sweep.duration());
    println!("X field of view   {} µm", config.optics.x_fov_um()?);
    Ok(())
}

/// Device status changes, as the UI status lights would show them.
fn print_status(log: &MessageLog) {
    for event in log.drain() {
        if event.status().is_some() {
            println!("{}", event.render());
        }
    }
}

#[cfg(feature = "mcc_hardware")]
fn daq_driver(_time_scale: f64) -> Arc<dyn DaqDriver> {
    Arc::new(lsm_ctrl_backend::mccul::UlDriver::new())
}

#[cfg(not(feature = "mcc_hardware"))]
fn daq_driver(time_scale: f64) -> Arc<dyn DaqDriver> {
    Arc::new(lsm_ctrl_backend::sim::SimDaq::new().with_time_scale(time_scale))
}

#[cfg(feature = "mcl_hardware")]
fn stage_driver(_time_scale: f64) -> Arc<dyn StageDriver> {
    Arc::new(lsm_ctrl_backend::microdrive::MicroDriveDriver)
}

#[cfg(not(feature = "mcl_hardware"))]
fn stage_driver(time_scale: f64) -> Arc<dyn StageDriver> {
    Arc::new(lsm_ctrl_backend::sim::SimStage::new().with_time_scale(time_scale))
}
