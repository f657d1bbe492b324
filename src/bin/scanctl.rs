//! Command-line front end for the microscope scanner.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};

use microscan::arbiter::ArbiterState;
use microscan::calibration::CalibrationOutcome;
use microscan::config_loader::{load_local_host_settings, load_scan_config, CaptureMode, ScanConfig};
use microscan::control::ControlSurface;
use microscan::controller::{StartOutcome, StopOutcome};
use microscan::grid;
use microscan::mock::EventLog;
use microscan::motion::AxisTarget;
use microscan::preview::PreviewOutcome;

#[derive(Parser, Debug)]
#[command(author, version, about = "Raster focus-stack scanner", long_about = None)]
struct Args {
    /// Run on the simulated stage and camera
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Per-move delay of the simulated stage, in milliseconds
    #[arg(long, default_value_t = 50)]
    sim_move_ms: u64,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Recording,
    Burst,
}

impl From<ModeArg> for CaptureMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Recording => CaptureMode::Recording,
            ModeArg::Burst => CaptureMode::Burst,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run a scan and wait for it (Ctrl-C stops after the current point)
    Scan {
        /// Scan configuration JSON; defaults to the current configuration
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
    },
    /// Print the stage position
    Position,
    /// Move any subset of axes
    Move {
        #[arg(long, allow_hyphen_values = true)]
        x: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        y: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        z: Option<f64>,
        /// mm/min
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Run the Z focus sweep without the camera
    DryRun {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Launch camera calibration
    Calibrate {
        /// Wait for the calibration command to finish and print the record
        #[arg(long, default_value_t = false)]
        wait: bool,
    },
    /// Print the grid plan for a configuration
    Plan {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Named configuration snapshots
    Configs {
        #[command(subcommand)]
        action: ConfigsCmd,
    },
    /// Run the live preview, writing the newest frame to a file
    Preview {
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[arg(long, default_value = "preview.jpg")]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigsCmd {
    List,
    /// Save the current configuration (or --from FILE) under NAME
    Save {
        name: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Make a snapshot the current configuration
    Load { name: String },
}

fn config_from(control: &ControlSurface, path: &Option<PathBuf>) -> Result<ScanConfig> {
    match path {
        Some(p) => load_scan_config(p),
        None => control.get_config(),
    }
}

fn run_scan(control: Arc<ControlSurface>, config: ScanConfig) -> Result<()> {
    let handler_control = Arc::clone(&control);
    ctrlc::set_handler(move || {
        if handler_control.stop_scan() == StopOutcome::Stopping {
            warn!(target: "scan", "Ctrl-C: stopping after the current point");
        }
    }).ok();

    match control.start_scan(config)? {
        StartOutcome::Busy(reason) => return Err(anyhow!("{}", reason)),
        StartOutcome::Started { run_id, points } => info!(target: "scan", "Run {} ({} points)", run_id, points),
    }

    let mut last_done = usize::MAX;
    loop {
        let status = control.scan_status();
        if status.points_done != last_done {
            println!("{}", status.summary());
            last_done = status.points_done;
        }
        if !status.running {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }
    control.wait_for_scan();
    let status = control.scan_status();
    match status.last_error {
        Some(e) => Err(anyhow!("Scan failed: {}", e)),
        None => {
            println!("Scan finished: {}/{} points", status.points_done, status.points_total);
            Ok(())
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let host = load_local_host_settings()?;
    let control = Arc::new(if args.simulate {
        info!("Simulated hardware, move delay {} ms", args.sim_move_ms);
        ControlSurface::simulated(host, EventLog::new(), Duration::from_millis(args.sim_move_ms))
    } else {
        ControlSurface::with_hardware(host)
    });

    match args.command {
        Cmd::Scan { config, mode } => {
            let mut cfg = config_from(&control, &config)?;
            if let Some(mode) = mode {
                cfg.capture_mode = Some(mode.into());
            }
            run_scan(control, cfg)?;
        }
        Cmd::Position => match control.position() {
            Some(p) => println!("X{:.3} Y{:.3} Z{:.3}", p.x, p.y, p.z),
            None => println!("Position unavailable"),
        },
        Cmd::Move { x, y, z, speed } => {
            let target = AxisTarget { x, y, z };
            if target.is_empty() {
                return Err(anyhow!("Give at least one of --x, --y, --z"));
            }
            control.move_stage(target, speed)?;
            println!("Moved {}", target);
        }
        Cmd::DryRun { config } => {
            let cfg = config_from(&control, &config)?;
            let handle = control.z_dry_run(cfg.stack_start_z, cfg.stack_end_z, cfg.stack_frames, cfg.framerate)?;
            handle.join().map_err(|_| anyhow!("Dry run thread panicked"))??;
            println!("Z dry run complete");
        }
        Cmd::Calibrate { wait } => match control.trigger_calibration()? {
            CalibrationOutcome::Busy(ArbiterState::HeldByStream) => return Err(anyhow!("Turn off video stream first")),
            CalibrationOutcome::Busy(state) => return Err(anyhow!("Camera busy ({})", state)),
            CalibrationOutcome::AlreadyRunning => println!("Calibration already running"),
            CalibrationOutcome::Started { pid } => {
                println!("Calibration started (PID {})", pid);
                if wait {
                    let before = control.calibration_status()?.map(|r| r.timestamp);
                    let deadline = Instant::now() + Duration::from_secs(60);
                    while Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(500));
                        let current = control.calibration_status()?;
                        if let Some(record) = current.filter(|r| Some(r.timestamp) != before) {
                            println!("{}", serde_json::to_string_pretty(&record)?);
                            return Ok(());
                        }
                    }
                    return Err(anyhow!("No new calibration record after 60 s"));
                }
            }
        },
        Cmd::Plan { config } => {
            let cfg = config_from(&control, &config)?;
            cfg.validate()?;
            let plan = grid::plan(&cfg)?;
            let host = control.host();
            let speed = grid::sweep_speed(cfg.stack_start_z, cfg.stack_end_z, cfg.stack_frames,
                                          cfg.framerate, host.sweep_fallback_speed);
            println!("Grid {} x {} ({} points), actual end X{:.3} Y{:.3}",
                     plan.x.steps, plan.y.steps, plan.len(), plan.x.actual_end, plan.y.actual_end);
            println!("Sweep Z{:.3} -> Z{:.3} at {:.2} mm/min", cfg.stack_start_z, cfg.stack_end_z, speed);
            for p in &plan.points {
                println!("  [{:02},{:02}] X{:.3} Y{:.3}", p.row, p.col, p.x, p.y);
            }
        }
        Cmd::Configs { action } => match action {
            ConfigsCmd::List => {
                for name in control.list_configs()? {
                    println!("{}", name);
                }
            }
            ConfigsCmd::Save { name, from } => {
                let cfg = config_from(&control, &from)?;
                let path = control.save_named_config(&name, &cfg)?;
                println!("Saved {}", path.display());
            }
            ConfigsCmd::Load { name } => {
                let cfg = control.load_named_config(&name)?;
                control.set_config(&cfg)?;
                println!("Loaded {} as current configuration", name);
            }
        },
        Cmd::Preview { seconds, out } => {
            match control.toggle_preview(true)? {
                PreviewOutcome::Busy(state) => return Err(anyhow!("Camera busy ({})", state)),
                _ => println!("Preview running for {} s, writing {}", seconds, out.display()),
            }
            let frames = control.preview_frames();
            let deadline = Instant::now() + Duration::from_secs(seconds);
            let mut written = 0usize;
            while Instant::now() < deadline && control.preview_active() {
                if let Ok(jpeg) = frames.recv_timeout(Duration::from_millis(200)) {
                    fs::write(&out, jpeg)?;
                    written += 1;
                }
            }
            control.toggle_preview(false)?;
            println!("{} frames received", written);
        }
    }
    Ok(())
}
