//! Scan controller
//!
//! Owns a scan run: checks it may start, holds the camera for the run, drives
//! the planner and the per-point scheduler on a dedicated worker thread, and
//! always leaves the camera and stage safe when the run ends.

use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::arbiter::{ArbiterLease, ArbiterState, CameraArbiter, Holder};
use crate::calibration;
use crate::camera::{CameraDriver, CameraFactory, CameraSettings};
use crate::capture::{CaptureScheduler, FocusStackJob, SchedulerSettings};
use crate::config_loader::{CaptureMode, HostSettings, ScanConfig};
use crate::grid::{self, GridPlan};
use crate::motion::{self, AxisTarget, MotionClient, Position};
use crate::offload::{BatchSink, DrainOutcome, StorageOffloader};

pub const MANIFEST_FILE: &str = "scan_parameters.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanRunState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyReason {
    CameraHeld(ArbiterState),
    AlreadyRunning(ScanRunState),
}

impl std::fmt::Display for BusyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusyReason::CameraHeld(ArbiterState::HeldByStream) => write!(f, "Stop video stream before scanning"),
            BusyReason::CameraHeld(ArbiterState::HeldByCalibration) => write!(f, "Calibration in progress"),
            BusyReason::CameraHeld(state) => write!(f, "Camera busy ({})", state),
            BusyReason::AlreadyRunning(_) => write!(f, "Scan already running"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started { run_id: Uuid, points: usize },
    Busy(BusyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping,
    NotRunning,
}

/// Snapshot of the controller, safe to take at any time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanStatus {
    pub state: ScanRunState,
    pub running: bool,
    pub worker_alive: bool,
    pub run_id: Option<Uuid>,
    pub points_done: usize,
    pub points_total: usize,
    pub last_error: Option<String>,
}

/// The collaborators a run is driven through.
#[derive(Clone)]
pub struct ScanResources {
    pub motion: Arc<dyn MotionClient>,
    pub cameras: Arc<dyn CameraFactory>,
    pub sink: Arc<dyn BatchSink>,
    pub arbiter: CameraArbiter,
    pub host: HostSettings,
}

#[derive(Debug, Default)]
struct Progress {
    run_id: Option<Uuid>,
    done: usize,
    total: usize,
}

struct Shared {
    state: Mutex<ScanRunState>,
    stop: AtomicBool,
    progress: Mutex<Progress>,
    last_error: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct ScanController {
    resources: ScanResources,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ScanController {
    pub fn new(resources: ScanResources) -> Self {
        Self {
            resources,
            shared: Arc::new(Shared {
                state: Mutex::new(ScanRunState::Idle),
                stop: AtomicBool::new(false),
                progress: Mutex::new(Progress::default()),
                last_error: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn arbiter(&self) -> &CameraArbiter {
        &self.resources.arbiter
    }

    /// Start a run. Only from Idle, only with a valid config, only while the
    /// camera is free.
    pub fn start(&self, config: ScanConfig) -> Result<StartOutcome> {
        let mut state = lock(&self.shared.state);
        if *state != ScanRunState::Idle {
            info!(target: "scan", "Start refused, scan is {:?}", *state);
            return Ok(StartOutcome::Busy(BusyReason::AlreadyRunning(*state)));
        }
        config.validate().context("Invalid scan configuration")?;
        let plan = grid::plan(&config)?;

        let lease = match self.resources.arbiter.try_lease(Holder::Scan) {
            Ok(lease) => lease,
            Err(held) => {
                info!(target: "scan", "Start refused, camera {}", held);
                return Ok(StartOutcome::Busy(BusyReason::CameraHeld(held)));
            }
        };

        let mut worker = lock(&self.worker);
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }

        let run_id = Uuid::new_v4();
        let points = plan.len();
        self.shared.stop.store(false, Ordering::SeqCst);
        *lock(&self.shared.progress) = Progress { run_id: Some(run_id), done: 0, total: points };
        *lock(&self.shared.last_error) = None;

        let run = ScanRun {
            run_id,
            config,
            plan,
            resources: self.resources.clone(),
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name("scan-worker".into())
            .spawn(move || run.execute(lease))
            .context("Failed to spawn scan worker")?;
        *worker = Some(handle);
        *state = ScanRunState::Running;
        info!(target: "scan", "Scan {} started: {} points", run_id, points);
        Ok(StartOutcome::Started { run_id, points })
    }

    /// Ask the running scan to stop after the current point.
    pub fn stop(&self) -> StopOutcome {
        let mut state = lock(&self.shared.state);
        match *state {
            ScanRunState::Idle => StopOutcome::NotRunning,
            ScanRunState::Running | ScanRunState::Stopping => {
                *state = ScanRunState::Stopping;
                self.shared.stop.store(true, Ordering::SeqCst);
                info!(target: "scan", "Stop requested");
                StopOutcome::Stopping
            }
        }
    }

    pub fn state(&self) -> ScanRunState {
        *lock(&self.shared.state)
    }

    pub fn status(&self) -> ScanStatus {
        let state = self.state();
        let worker_alive = lock(&self.worker)
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        let progress = lock(&self.shared.progress);
        ScanStatus {
            state,
            running: state != ScanRunState::Idle,
            worker_alive,
            run_id: progress.run_id,
            points_done: progress.done,
            points_total: progress.total,
            last_error: lock(&self.shared.last_error).clone(),
        }
    }

    /// Block until the current worker, if any, has exited.
    pub fn wait(&self) {
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(target: "scan", "Scan worker panicked outside the run guard");
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanSummary {
    pub steps_x: usize,
    pub steps_y: usize,
    pub points: usize,
    pub actual_end_x: f64,
    pub actual_end_y: f64,
    pub sweep_speed: f64,
}

impl PlanSummary {
    pub fn new(plan: &GridPlan, sweep_speed: f64) -> Self {
        Self {
            steps_x: plan.x.steps,
            steps_y: plan.y.steps,
            points: plan.len(),
            actual_end_x: plan.x.actual_end,
            actual_end_y: plan.y.actual_end,
            sweep_speed,
        }
    }
}

/// Record of one run, written next to its output.
#[derive(Debug, Serialize)]
pub struct RunManifest<'a> {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub hostname: String,
    pub start_position: Option<Position>,
    pub capture_mode: CaptureMode,
    pub config: &'a ScanConfig,
    pub camera: CameraSettings,
    pub plan: PlanSummary,
}

pub fn write_manifest(run_dir: &Path, manifest: &RunManifest) -> Result<PathBuf> {
    let path = run_dir.join(MANIFEST_FILE);
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(path)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("Scan worker panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("Scan worker panicked: {}", s)
    } else {
        "Scan worker panicked".to_string()
    }
}

/// Everything the worker thread owns for one run.
struct ScanRun {
    run_id: Uuid,
    config: ScanConfig,
    plan: GridPlan,
    resources: ScanResources,
    shared: Arc<Shared>,
}

impl ScanRun {
    fn execute(self, lease: ArbiterLease) {
        let mut camera: Option<Box<dyn CameraDriver>> = None;
        let mut offloader: Option<StorageOffloader> = None;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.run_points(&mut camera, &mut offloader)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(panic_message(payload)),
        };
        if let Some(message) = &failure {
            error!(target: "scan", "Scan {} aborted: {}", self.run_id, message);
        }

        self.cleanup(camera, lease, offloader);

        *lock(&self.shared.last_error) = failure;
        *lock(&self.shared.state) = ScanRunState::Idle;
        info!(target: "scan", "Scan {} finished, controller idle", self.run_id);
    }

    fn run_points(
        &self,
        camera_slot: &mut Option<Box<dyn CameraDriver>>,
        offloader_slot: &mut Option<StorageOffloader>,
    ) -> Result<()> {
        let ScanResources { motion, cameras, sink, host, .. } = &self.resources;
        let config = &self.config;

        let run_dir = config.run_dir();
        fs::create_dir_all(&run_dir).with_context(|| format!("Failed to create {:?}", run_dir))?;

        let controls = calibration::controls_or(&host.calibration_path(), config.manual_controls());
        let camera_settings = config.camera_settings(controls)?;
        let mode = config.capture_mode_or(host.capture_mode);
        let sweep_speed = grid::sweep_speed(
            config.stack_start_z,
            config.stack_end_z,
            config.stack_frames,
            config.framerate,
            host.sweep_fallback_speed,
        );

        let manifest = RunManifest {
            run_id: self.run_id,
            timestamp: Utc::now(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            start_position: motion::try_position(motion.as_ref()),
            capture_mode: mode,
            config,
            camera: camera_settings,
            plan: PlanSummary::new(&self.plan, sweep_speed),
        };
        let manifest_path = write_manifest(&run_dir, &manifest)?;
        info!(target: "scan", "Parameters saved to {:?}", manifest_path);
        info!(target: "scan", "Grid {}x{}, sweep {:.2} mm/min, mode {:?}",
              self.plan.x.steps, self.plan.y.steps, sweep_speed, mode);

        let mut camera = cameras.open()?;
        camera.configure(&camera_settings)?;
        let camera = camera_slot.insert(camera);
        let offloader = offloader_slot.insert(StorageOffloader::spawn(Arc::clone(sink))?);

        motion.move_to(AxisTarget::z(config.stack_start_z + host.travel_lift_mm), host.z_approach_speed)?;

        let scheduler = CaptureScheduler::new(Arc::clone(motion), SchedulerSettings::from_host(host, mode));
        for point in &self.plan.points {
            if self.shared.stop.load(Ordering::SeqCst) {
                info!(target: "scan", "Stop honoured before point ({}, {})", point.row, point.col);
                return Ok(());
            }
            let job = FocusStackJob::for_point(config, point, sweep_speed);
            scheduler
                .run_point(camera.as_mut(), offloader, point, &job, &run_dir)
                .with_context(|| format!("Point ({}, {}) failed", point.row, point.col))?;
            lock(&self.shared.progress).done += 1;
        }
        info!(target: "scan", "All {} points captured", self.plan.len());
        Ok(())
    }

    /// Camera off, camera token back, head lifted clear, writer flushed.
    fn cleanup(&self, camera: Option<Box<dyn CameraDriver>>, lease: ArbiterLease, offloader: Option<StorageOffloader>) {
        let host = &self.resources.host;
        if let Some(mut camera) = camera {
            if let Err(e) = camera.stop() {
                warn!(target: "scan", "Camera stop failed during cleanup: {:#}", e);
            }
        }
        lease.release();

        let safe_z = self.config.stack_start_z + host.safe_lift_mm;
        if let Err(e) = self.resources.motion.move_to(AxisTarget::z(safe_z), host.z_return_speed) {
            error!(target: "scan", "Could not lift head to Z{:.2}: {:#}", safe_z, e);
        }

        if let Some(mut offloader) = offloader {
            match offloader.drain_and_stop(host.flush_timeout()) {
                DrainOutcome::Drained(stats) => info!(target: "scan",
                    "Storage flushed: {} batches, {} items written, {} failed",
                    stats.batches_written, stats.frames_written, stats.frames_failed),
                DrainOutcome::TimedOut(stats) => warn!(target: "scan",
                    "Storage flush timed out after {:?} ({} batches written so far)",
                    host.flush_timeout(), stats.batches_written),
            }
        }
    }
}

/// Human-readable reason for a refused start.
pub fn busy_message(outcome: &StartOutcome) -> Option<String> {
    match outcome {
        StartOutcome::Busy(reason) => Some(reason.to_string()),
        StartOutcome::Started { .. } => None,
    }
}

impl ScanStatus {
    pub fn summary(&self) -> String {
        let mut s = format!("{:?}: {}/{} points", self.state, self.points_done, self.points_total);
        if let Some(e) = &self.last_error {
            s.push_str(&format!(", last error: {}", e));
        }
        s
    }
}
