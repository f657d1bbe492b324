//! Per-point capture
//!
//! At each grid point: XY move, settle, Z to the stack start, settle, then a Z
//! sweep with the camera capturing across it. The batch goes to the offloader
//! and Z returns to the stack start before the next point.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use log::{debug, info};
use serde::Serialize;

use crate::camera::{CameraDriver, Frame};
use crate::config_loader::{CaptureMode, HostSettings, ScanConfig};
use crate::grid::GridPoint;
use crate::motion::{AxisTarget, MotionClient};
use crate::offload::{BatchPayload, FrameBatch, StorageOffloader};

/// One grid point's focus stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusStackJob {
    pub start_z: f64,
    pub end_z: f64,
    /// mm/min
    pub sweep_speed: f64,
    /// Output stem, `point_<row>_<col>`
    pub stem: String,
    pub frame_count: u32,
    pub frame_rate: f64,
}

impl FocusStackJob {
    pub fn for_point(config: &ScanConfig, point: &GridPoint, sweep_speed: f64) -> Self {
        Self {
            start_z: config.stack_start_z,
            end_z: config.stack_end_z,
            sweep_speed,
            stem: point_stem(point),
            frame_count: config.stack_frames,
            frame_rate: config.framerate,
        }
    }
}

pub fn point_stem(point: &GridPoint) -> String {
    format!("point_{:02}_{:02}", point.row, point.col)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub xy_speed: f64,
    pub z_approach_speed: f64,
    pub z_return_speed: f64,
    pub settle: Duration,
    pub mode: CaptureMode,
}

impl SchedulerSettings {
    pub fn from_host(host: &HostSettings, mode: CaptureMode) -> Self {
        Self {
            xy_speed: host.xy_speed,
            z_approach_speed: host.z_approach_speed,
            z_return_speed: host.z_return_speed,
            settle: host.settle(),
            mode,
        }
    }
}

pub struct CaptureScheduler {
    motion: Arc<dyn MotionClient>,
    settings: SchedulerSettings,
}

impl CaptureScheduler {
    pub fn new(motion: Arc<dyn MotionClient>, settings: SchedulerSettings) -> Self {
        Self { motion, settings }
    }

    /// Run one grid point. Any motion or capture failure is returned as is;
    /// the caller owns cleanup.
    pub fn run_point(
        &self,
        camera: &mut dyn CameraDriver,
        offloader: &StorageOffloader,
        point: &GridPoint,
        job: &FocusStackJob,
        run_dir: &Path,
    ) -> Result<()> {
        let s = &self.settings;
        info!(target: "capture", "Point ({}, {}) at X{:.2} Y{:.2}", point.row, point.col, point.x, point.y);

        self.motion.move_to(AxisTarget::xy(point.x, point.y), s.xy_speed)?;
        thread::sleep(s.settle);
        self.motion.move_to(AxisTarget::z(job.start_z), s.z_approach_speed)?;
        thread::sleep(s.settle);

        camera.start()?;
        let captured = match s.mode {
            CaptureMode::Recording => self.sweep_recording(camera, job, run_dir),
            CaptureMode::Burst => self.sweep_burst(camera, job).map(BatchPayload::Frames),
        };
        let stopped = camera.stop();
        let payload = captured?;
        stopped?;

        let batch = FrameBatch {
            label: job.stem.clone(),
            destination: run_dir.to_path_buf(),
            payload,
        };
        debug!(target: "capture", "{}: submitting {} items", job.stem, batch.item_count());
        offloader.submit(batch)?;

        self.motion.move_to(AxisTarget::z(job.start_z), s.z_return_speed)?;
        Ok(())
    }

    fn sweep_recording(&self, camera: &mut dyn CameraDriver, job: &FocusStackJob, run_dir: &Path) -> Result<BatchPayload> {
        let raw = run_dir.join(format!("{}.h264", job.stem));
        camera.start_recording(&raw)?;
        let sweep = self.motion.move_to(AxisTarget::z(job.end_z), job.sweep_speed);
        let recording = camera.stop_recording();
        sweep?;
        Ok(BatchPayload::Recording(recording?))
    }

    /// Capture frames on a scoped thread while the sweep runs here.
    ///
    /// The first frame is taken before the sweep is issued. Capture ends when
    /// the sweep is acknowledged or `frame_count` frames are held.
    fn sweep_burst(&self, camera: &mut dyn CameraDriver, job: &FocusStackJob) -> Result<Vec<Frame>> {
        let limit = job.frame_count.max(1) as usize;
        let interval = Duration::try_from_secs_f64(1.0 / job.frame_rate)
            .map_err(|e| anyhow!("Frame rate {} gives no usable interval: {}", job.frame_rate, e))?;
        let stop = AtomicBool::new(false);
        let (ready_tx, ready_rx) = bounded::<()>(1);

        thread::scope(|scope| {
            let stop = &stop;
            let grabber = scope.spawn(move || -> Result<Vec<Frame>> {
                let mut frames = Vec::with_capacity(limit);
                let mut next = Instant::now();
                frames.push(camera.capture_frame()?);
                let _ = ready_tx.send(());
                while frames.len() < limit && !stop.load(Ordering::SeqCst) {
                    next += interval;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    }
                    frames.push(camera.capture_frame()?);
                }
                Ok(frames)
            });

            let sweep = match ready_rx.recv() {
                Ok(()) => Some(self.motion.move_to(AxisTarget::z(job.end_z), job.sweep_speed)),
                Err(_) => None,
            };
            stop.store(true, Ordering::SeqCst);

            let frames = grabber
                .join()
                .map_err(|_| anyhow!("Frame capture thread panicked"))??;
            match sweep {
                Some(result) => result?,
                None => return Err(anyhow!("Capture stopped before the sweep started")),
            }
            debug!(target: "capture", "{}: {} frames held", job.stem, frames.len());
            Ok(frames)
        })
    }
}
