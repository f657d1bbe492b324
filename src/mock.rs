//! Simulated stage and camera
//!
//! Both record what they are asked to do into one shared, ordered `EventLog`,
//! so tests can check the interleaving of motion and capture. `scanctl
//! --simulate` runs the whole system on them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::debug;

use crate::camera::{CameraDriver, CameraFactory, CameraSettings, Frame, RecordingHandle};
use crate::motion::{AxisTarget, MotionClient, Position};
use crate::offload::{BatchSink, FrameBatch, WriteReport};

/// Size of the frames the simulated sensor produces, whatever was configured.
pub const SIM_FRAME_SIZE: (u32, u32) = (16, 12);

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Move command issued
    MoveStart { target: AxisTarget, speed: f64 },
    /// Move acknowledged as complete
    MoveDone { target: AxisTarget },
    MoveRelative { delta: AxisTarget, speed: f64 },
    CameraOpened,
    Configure(CameraSettings),
    CameraStart,
    CameraStop,
    FrameCaptured(usize),
    RecordingStarted(PathBuf),
    RecordingStopped(PathBuf),
    BatchWritten { label: String, items: usize },
}

/// Shared ordered event record.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn push(&self, event: Event) {
        self.lock().push(event);
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Targets of all issued absolute moves, in order.
    pub fn moves(&self) -> Vec<AxisTarget> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Event::MoveStart { target, .. } => Some(*target),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.lock().iter().filter(|e| pred(e)).count()
    }

    /// Index of the first event matching `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.lock().iter().position(|e| pred(e))
    }

    pub fn labels_written(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                Event::BatchWritten { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }
}

// -------------------- Stage --------------------

/// In-memory stage that takes `move_delay` for every move.
#[derive(Debug)]
pub struct SimStage {
    log: EventLog,
    position: Mutex<Position>,
    move_delay: Duration,
    moves_issued: AtomicUsize,
    /// 1-based index of a move that fails
    fail_on_move: Option<usize>,
    unreachable: AtomicBool,
}

impl SimStage {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            position: Mutex::new(Position { x: 0.0, y: 0.0, z: 0.0 }),
            move_delay: Duration::ZERO,
            moves_issued: AtomicUsize::new(0),
            fail_on_move: None,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_move_delay(mut self, delay: Duration) -> Self {
        self.move_delay = delay;
        self
    }

    pub fn failing_on_move(mut self, nth: usize) -> Self {
        self.fail_on_move = Some(nth);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn current(&self) -> Position {
        *self.position.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_move(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("Simulated controller unreachable"));
        }
        let n = self.moves_issued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_move == Some(n) {
            return Err(anyhow!("Simulated failure on move {}", n));
        }
        Ok(())
    }

    fn apply(&self, target: AxisTarget, relative: bool) {
        let mut pos = self.position.lock().unwrap_or_else(|p| p.into_inner());
        let base = if relative { *pos } else { Position { x: 0.0, y: 0.0, z: 0.0 } };
        if let Some(x) = target.x { pos.x = if relative { base.x + x } else { x }; }
        if let Some(y) = target.y { pos.y = if relative { base.y + y } else { y }; }
        if let Some(z) = target.z { pos.z = if relative { base.z + z } else { z }; }
    }
}

impl MotionClient for SimStage {
    fn move_to(&self, target: AxisTarget, speed: f64) -> Result<()> {
        self.check_move()?;
        self.log.push(Event::MoveStart { target, speed });
        debug!(target: "motion", "SIM move {} F{:.1}", target, speed);
        if !self.move_delay.is_zero() {
            thread::sleep(self.move_delay);
        }
        self.apply(target, false);
        self.log.push(Event::MoveDone { target });
        Ok(())
    }

    fn move_relative(&self, delta: AxisTarget, speed: f64) -> Result<()> {
        self.check_move()?;
        self.log.push(Event::MoveRelative { delta, speed });
        if !self.move_delay.is_zero() {
            thread::sleep(self.move_delay);
        }
        self.apply(delta, true);
        Ok(())
    }

    fn position(&self) -> Result<Position> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(anyhow!("Simulated controller unreachable"));
        }
        Ok(self.current())
    }
}

// -------------------- Camera --------------------

/// Simulated sensor producing small grey-ramp frames.
#[derive(Debug)]
pub struct SimCamera {
    log: EventLog,
    settings: Option<CameraSettings>,
    started: bool,
    recording: Option<RecordingHandle>,
    frames: usize,
    fail_capture: bool,
}

impl SimCamera {
    pub fn new(log: EventLog) -> Self {
        Self { log, settings: None, started: false, recording: None, frames: 0, fail_capture: false }
    }

    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }

    fn synthetic_frame(&self) -> Result<Frame> {
        let (w, h) = SIM_FRAME_SIZE;
        let shade = (self.frames % 256) as u8;
        Frame::new(w, h, vec![shade; (w * h * 3) as usize])
    }
}

impl CameraDriver for SimCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        if self.recording.is_some() {
            return Err(anyhow!("Cannot reconfigure while recording"));
        }
        self.settings = Some(*settings);
        self.log.push(Event::Configure(*settings));
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        if self.settings.is_none() {
            return Err(anyhow!("Camera not configured"));
        }
        if !self.started {
            self.started = true;
            self.log.push(Event::CameraStart);
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.recording.is_some() {
            self.stop_recording()?;
        }
        if self.started {
            self.started = false;
            self.log.push(Event::CameraStop);
        }
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        if !self.started {
            return Err(anyhow!("Camera not started"));
        }
        if self.fail_capture {
            return Err(anyhow!("Simulated capture failure"));
        }
        let frame = self.synthetic_frame()?;
        self.log.push(Event::FrameCaptured(self.frames));
        self.frames += 1;
        Ok(frame)
    }

    fn start_recording(&mut self, path: &Path) -> Result<()> {
        if !self.started {
            return Err(anyhow!("Camera not started"));
        }
        if self.recording.is_some() {
            return Err(anyhow!("Recording already active"));
        }
        let frame_rate = self.settings.map(|s| s.frame_rate).unwrap_or(10.0);
        if let Some(parent) = path.parent() {
            if parent.is_dir() {
                let _ = fs::write(path, b"simulated h264");
            }
        }
        self.recording = Some(RecordingHandle { raw_path: path.to_path_buf(), frame_rate });
        self.log.push(Event::RecordingStarted(path.to_path_buf()));
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<RecordingHandle> {
        let handle = self.recording.take().ok_or_else(|| anyhow!("No recording active"))?;
        self.log.push(Event::RecordingStopped(handle.raw_path.clone()));
        Ok(handle)
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct SimCameraFactory {
    log: EventLog,
    fail_capture: bool,
}

impl SimCameraFactory {
    pub fn new(log: EventLog) -> Self {
        Self { log, fail_capture: false }
    }

    pub fn failing_capture(mut self) -> Self {
        self.fail_capture = true;
        self
    }
}

impl CameraFactory for SimCameraFactory {
    fn open(&self) -> Result<Box<dyn CameraDriver>> {
        self.log.push(Event::CameraOpened);
        let camera = SimCamera::new(self.log.clone());
        Ok(Box::new(if self.fail_capture { camera.failing_capture() } else { camera }))
    }
}

// -------------------- Sink --------------------

/// Batch sink that only records what it was given.
#[derive(Debug, Clone)]
pub struct MemorySink {
    log: EventLog,
    delay: Duration,
}

impl MemorySink {
    pub fn new(log: EventLog) -> Self {
        Self { log, delay: Duration::ZERO }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl BatchSink for MemorySink {
    fn write_batch(&self, batch: FrameBatch) -> WriteReport {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let items = batch.item_count();
        self.log.push(Event::BatchWritten { label: batch.label, items });
        WriteReport { written: items, failed: 0 }
    }
}
