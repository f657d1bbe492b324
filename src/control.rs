//! Control surface: every externally visible operation over one shared set
//! of components.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Receiver;
use log::info;

use crate::arbiter::{ArbiterState, CameraArbiter};
use crate::calibration::{CalibrationOutcome, CalibrationRecord, Calibrator};
use crate::camera::{CameraFactory, RpicamFactory};
use crate::config_loader::{ConfigStore, HostSettings, ScanConfig};
use crate::controller::{ScanController, ScanResources, ScanRunState, ScanStatus, StartOutcome, StopOutcome};
use crate::grid;
use crate::mock::{EventLog, MemorySink, SimCameraFactory, SimStage};
use crate::motion::{self, AxisTarget, MoonrakerStage, MotionClient, Position};
use crate::offload::{BatchSink, DiskSink};
use crate::preview::{PreviewController, PreviewOutcome};

/// Speed for manual stage moves when the caller gives none (mm/min).
pub const DEFAULT_MOVE_SPEED: f64 = 3000.0;
const DRY_RUN_APPROACH_SPEED: f64 = 2000.0;
const DRY_RUN_PAUSE: Duration = Duration::from_secs(1);

pub struct ControlSurface {
    host: HostSettings,
    store: ConfigStore,
    motion: Arc<dyn MotionClient>,
    arbiter: CameraArbiter,
    scans: ScanController,
    preview: PreviewController,
    calibrator: Calibrator,
}

impl ControlSurface {
    pub fn new(
        host: HostSettings,
        motion: Arc<dyn MotionClient>,
        cameras: Arc<dyn CameraFactory>,
        sink: Arc<dyn BatchSink>,
    ) -> Self {
        let arbiter = CameraArbiter::new();
        let scans = ScanController::new(ScanResources {
            motion: Arc::clone(&motion),
            cameras: Arc::clone(&cameras),
            sink,
            arbiter: arbiter.clone(),
            host: host.clone(),
        });
        let preview = PreviewController::new(arbiter.clone(), cameras);
        let calibrator = Calibrator::new(host.calibration_cmd.clone(), host.calibration_path(), arbiter.clone());
        Self {
            store: ConfigStore::from_settings(&host),
            host,
            motion,
            arbiter,
            scans,
            preview,
            calibrator,
        }
    }

    /// Moonraker stage, rpicam camera and on-disk writer.
    pub fn with_hardware(host: HostSettings) -> Self {
        let motion = Arc::new(MoonrakerStage::new(&host.moonraker_url));
        let cameras = Arc::new(RpicamFactory {
            command: host.camera_vid_cmd.clone(),
            bitrate: host.recording_bitrate,
        });
        let sink = Arc::new(DiskSink::new(host.ffmpeg_cmd.clone()));
        Self::new(host, motion, cameras, sink)
    }

    /// Simulated stage and camera recording into `log`.
    pub fn simulated(host: HostSettings, log: EventLog, move_delay: Duration) -> Self {
        let motion = Arc::new(SimStage::new(log.clone()).with_move_delay(move_delay));
        let cameras = Arc::new(SimCameraFactory::new(log.clone()));
        let sink = Arc::new(MemorySink::new(log));
        Self::new(host, motion, cameras, sink)
    }

    pub fn host(&self) -> &HostSettings {
        &self.host
    }

    pub fn arbiter_state(&self) -> ArbiterState {
        self.arbiter.state()
    }

    // -------------------- Configuration --------------------

    pub fn get_config(&self) -> Result<ScanConfig> {
        self.store.load_current()
    }

    pub fn set_config(&self, config: &ScanConfig) -> Result<()> {
        self.store.save_current(config)
    }

    pub fn save_named_config(&self, name: &str, config: &ScanConfig) -> Result<PathBuf> {
        self.store.save_named(name, config)
    }

    pub fn list_configs(&self) -> Result<Vec<String>> {
        self.store.list_named()
    }

    pub fn load_named_config(&self, name: &str) -> Result<ScanConfig> {
        self.store.load_named(name)
    }

    // -------------------- Scan --------------------

    /// Persist `config` as the current configuration, then start a scan with it.
    pub fn start_scan(&self, config: ScanConfig) -> Result<StartOutcome> {
        self.store.save_current(&config).context("Failed to persist scan configuration")?;
        self.scans.start(config)
    }

    pub fn stop_scan(&self) -> StopOutcome {
        self.scans.stop()
    }

    pub fn scan_status(&self) -> ScanStatus {
        self.scans.status()
    }

    pub fn wait_for_scan(&self) {
        self.scans.wait();
    }

    // -------------------- Stage --------------------

    /// Current position, `None` when the controller cannot be reached.
    pub fn position(&self) -> Option<Position> {
        motion::try_position(self.motion.as_ref())
    }

    pub fn move_stage(&self, target: AxisTarget, speed: Option<f64>) -> Result<()> {
        if target.is_empty() {
            return Ok(());
        }
        let speed = speed.unwrap_or(DEFAULT_MOVE_SPEED);
        if !speed.is_finite() || speed <= 0.0 {
            return Err(anyhow!("Move speed must be positive, got {}", speed));
        }
        info!(target: "motion", "Manual move {} F{:.1}", target, speed);
        self.motion.move_to(target, speed)
    }

    /// Move Z through the focus sweep at scan speed, without the camera.
    ///
    /// Runs on a background thread; refused while a scan is running.
    pub fn z_dry_run(&self, start_z: f64, end_z: f64, frames: u32, framerate: f64) -> Result<JoinHandle<Result<()>>> {
        if self.scans.state() != ScanRunState::Idle {
            return Err(anyhow!("Scan running, dry run refused"));
        }
        if !start_z.is_finite() || !end_z.is_finite() {
            return Err(anyhow!("Dry run Z bounds must be finite"));
        }
        let speed = grid::sweep_speed(start_z, end_z, frames, framerate, self.host.sweep_fallback_speed);
        let motion = Arc::clone(&self.motion);
        info!(target: "motion", "Z dry run {:.2} -> {:.2} at {:.2} mm/min", start_z, end_z, speed);
        thread::Builder::new()
            .name("z-dry-run".into())
            .spawn(move || {
                motion.move_to(AxisTarget::z(start_z), DRY_RUN_APPROACH_SPEED)?;
                thread::sleep(DRY_RUN_PAUSE);
                motion.move_to(AxisTarget::z(end_z), speed)?;
                info!(target: "motion", "Z dry run complete");
                Ok(())
            })
            .context("Failed to spawn dry run thread")
    }

    // -------------------- Preview --------------------

    pub fn toggle_preview(&self, on: bool) -> Result<PreviewOutcome> {
        self.preview.toggle(on)
    }

    pub fn preview_frames(&self) -> Receiver<Vec<u8>> {
        self.preview.frames()
    }

    pub fn preview_active(&self) -> bool {
        self.preview.is_active()
    }

    /// Escape hatch for a stuck camera hold. Returns the state it replaced.
    pub fn force_release(&self) -> ArbiterState {
        self.preview.force_release()
    }

    // -------------------- Calibration --------------------

    pub fn trigger_calibration(&self) -> Result<CalibrationOutcome> {
        self.calibrator.trigger()
    }

    pub fn calibration_status(&self) -> Result<Option<CalibrationRecord>> {
        self.calibrator.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::BusyReason;
    use crate::mock::Event;

    fn surface(dir: &std::path::Path, log: &EventLog) -> ControlSurface {
        let host = HostSettings { data_dir: dir.to_path_buf(), settle_ms: 0, ..Default::default() };
        ControlSurface::simulated(host, log.clone(), Duration::ZERO)
    }

    #[test]
    fn test_config_get_set_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let control = surface(dir.path(), &EventLog::new());
        assert_eq!(control.get_config().unwrap(), ScanConfig::default());
        let cfg = ScanConfig { end_y: 30.0, ..Default::default() };
        control.set_config(&cfg).unwrap();
        assert_eq!(control.get_config().unwrap().end_y, 30.0);
        control.save_named_config("wide", &cfg).unwrap();
        assert_eq!(control.list_configs().unwrap(), vec!["wide.json"]);
        assert_eq!(control.load_named_config("wide").unwrap(), cfg);
    }

    #[test]
    fn test_start_scan_persists_config() {
        let dir = tempfile::tempdir().unwrap();
        let control = surface(dir.path(), &EventLog::new());
        let cfg = ScanConfig {
            output_folder: dir.path().join("out"),
            sample_name: "persisted".into(),
            ..Default::default()
        };
        assert!(matches!(control.start_scan(cfg.clone()).unwrap(), StartOutcome::Started { .. }));
        control.wait_for_scan();
        assert_eq!(control.get_config().unwrap(), cfg);
        assert!(!control.scan_status().running);
    }

    #[test]
    fn test_move_stage_partial_axes_and_position() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        let control = surface(dir.path(), &log);
        control.move_stage(AxisTarget { x: Some(3.0), y: None, z: Some(1.5) }, None).unwrap();
        control.move_stage(AxisTarget::default(), None).unwrap();
        assert!(control.move_stage(AxisTarget::z(1.0), Some(0.0)).is_err());
        assert_eq!(log.snapshot()[0], Event::MoveStart {
            target: AxisTarget { x: Some(3.0), y: None, z: Some(1.5) },
            speed: DEFAULT_MOVE_SPEED,
        });
        assert_eq!(control.position(), Some(Position { x: 3.0, y: 0.0, z: 1.5 }));
    }

    #[test]
    fn test_z_dry_run_moves_at_sweep_speed() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        let control = surface(dir.path(), &log);
        let handle = control.z_dry_run(5.0, 0.0, 150, 10.0).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(log.moves(), vec![AxisTarget::z(5.0), AxisTarget::z(0.0)]);
        let speeds: Vec<f64> = log.snapshot().into_iter().filter_map(|e| match e {
            Event::MoveStart { speed, .. } => Some(speed),
            _ => None,
        }).collect();
        assert_eq!(speeds[0], DRY_RUN_APPROACH_SPEED);
        assert!((speeds[1] - 20.0).abs() < 1e-9);
        assert!(!log.snapshot().iter().any(|e| matches!(e, Event::CameraOpened)));
    }

    #[test]
    fn test_calibration_refused_during_preview() {
        let dir = tempfile::tempdir().unwrap();
        let control = surface(dir.path(), &EventLog::new());
        assert_eq!(control.toggle_preview(true).unwrap(), PreviewOutcome::Started);
        assert_eq!(control.trigger_calibration().unwrap(), CalibrationOutcome::Busy(ArbiterState::HeldByStream));
        assert_eq!(control.force_release(), ArbiterState::HeldByStream);
        assert_eq!(control.arbiter_state(), ArbiterState::Free);
        assert!(control.calibration_status().unwrap().is_none());
    }

    #[test]
    fn test_scan_and_preview_refused_while_calibrating() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new();
        let host = HostSettings {
            data_dir: dir.path().to_path_buf(),
            settle_ms: 0,
            calibration_cmd: vec!["sh".into(), "-c".into(), "sleep 0.5".into()],
            ..Default::default()
        };
        let control = ControlSurface::simulated(host, log.clone(), Duration::ZERO);
        assert!(matches!(control.trigger_calibration().unwrap(), CalibrationOutcome::Started { .. }));

        let cfg = ScanConfig { output_folder: dir.path().join("out"), ..Default::default() };
        let outcome = control.start_scan(cfg).unwrap();
        assert_eq!(outcome, StartOutcome::Busy(BusyReason::CameraHeld(ArbiterState::HeldByCalibration)));
        assert_eq!(crate::controller::busy_message(&outcome).unwrap(), "Calibration in progress");
        assert_eq!(control.toggle_preview(true).unwrap(), PreviewOutcome::Busy(ArbiterState::HeldByCalibration));
        assert!(!control.preview_active());
        assert!(log.moves().is_empty());
        assert!(!log.snapshot().iter().any(|e| matches!(e, Event::CameraOpened)));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while control.arbiter_state() != ArbiterState::Free && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(control.arbiter_state(), ArbiterState::Free);
    }
}
