//! Live preview
//!
//! Holds the camera as the stream holder and publishes JPEG frames into a
//! small bounded channel. Frames are dropped when the consumer falls behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info};

use crate::arbiter::{ArbiterState, CameraArbiter, Holder};
use crate::camera::{CameraDriver, CameraFactory, CameraSettings, ManualControls};

pub const PREVIEW_WIDTH: u32 = 640;
pub const PREVIEW_HEIGHT: u32 = 480;
const FRAME_INTERVAL: Duration = Duration::from_millis(40);
const PREVIEW_JPEG_QUALITY: u8 = 85;
const CHANNEL_DEPTH: usize = 2;

pub fn preview_settings() -> CameraSettings {
    CameraSettings {
        width: PREVIEW_WIDTH,
        height: PREVIEW_HEIGHT,
        frame_rate: 25.0,
        controls: ManualControls { exposure_us: 20000, analogue_gain: 1.0, colour_gains: (2.1, 1.6) },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewOutcome {
    Started,
    Stopped,
    Busy(ArbiterState),
}

pub struct PreviewController {
    arbiter: CameraArbiter,
    factory: Arc<dyn CameraFactory>,
    active: Arc<AtomicBool>,
    frames_tx: Sender<Vec<u8>>,
    frames_rx: Receiver<Vec<u8>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PreviewController {
    pub fn new(arbiter: CameraArbiter, factory: Arc<dyn CameraFactory>) -> Self {
        let (frames_tx, frames_rx) = bounded(CHANNEL_DEPTH);
        Self {
            arbiter,
            factory,
            active: Arc::new(AtomicBool::new(false)),
            frames_tx,
            frames_rx,
            worker: Mutex::new(None),
        }
    }

    /// JPEG frames while the preview runs.
    pub fn frames(&self) -> Receiver<Vec<u8>> {
        self.frames_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Turn the preview on or off.
    pub fn toggle(&self, on: bool) -> Result<PreviewOutcome> {
        let mut worker = self.worker.lock().unwrap_or_else(|p| p.into_inner());
        if !on {
            self.active.store(false, Ordering::SeqCst);
            if let Some(handle) = worker.take() {
                if handle.join().is_err() {
                    error!(target: "preview", "Preview thread panicked");
                }
            }
            return Ok(PreviewOutcome::Stopped);
        }

        if self.is_active() {
            return Ok(PreviewOutcome::Started);
        }
        if let Some(handle) = worker.take() {
            let _ = handle.join();
        }
        if let Err(state) = self.arbiter.try_acquire(Holder::Stream) {
            info!(target: "preview", "Preview refused, camera {}", state);
            return Ok(PreviewOutcome::Busy(state));
        }

        self.active.store(true, Ordering::SeqCst);
        let arbiter = self.arbiter.clone();
        let factory = Arc::clone(&self.factory);
        let active = Arc::clone(&self.active);
        let tx = self.frames_tx.clone();
        let spawned = thread::Builder::new()
            .name("preview".into())
            .spawn(move || {
                if let Err(e) = Self::stream_loop(factory.as_ref(), &active, &tx) {
                    error!(target: "preview", "Preview stopped: {:#}", e);
                }
                active.store(false, Ordering::SeqCst);
                arbiter.release(Holder::Stream);
                info!(target: "preview", "Preview closed");
            })
            .context("Failed to spawn preview thread");
        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(PreviewOutcome::Started)
            }
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                self.arbiter.release(Holder::Stream);
                Err(e)
            }
        }
    }

    fn stream_loop(factory: &dyn CameraFactory, active: &AtomicBool, tx: &Sender<Vec<u8>>) -> Result<()> {
        let mut camera = factory.open()?;
        camera.configure(&preview_settings())?;
        camera.start()?;
        info!(target: "preview", "Preview streaming at {}x{}", PREVIEW_WIDTH, PREVIEW_HEIGHT);
        let result = Self::publish_frames(camera.as_mut(), active, tx);
        camera.stop()?;
        result
    }

    fn publish_frames(camera: &mut dyn CameraDriver, active: &AtomicBool, tx: &Sender<Vec<u8>>) -> Result<()> {
        let mut dropped = 0usize;
        while active.load(Ordering::SeqCst) {
            let jpeg = camera.capture_frame()?.to_jpeg(PREVIEW_JPEG_QUALITY)?;
            match tx.try_send(jpeg) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Disconnected(_)) => break,
            }
            thread::sleep(FRAME_INTERVAL);
        }
        debug!(target: "preview", "Preview loop ended ({} frames dropped)", dropped);
        Ok(())
    }

    /// Clear the preview flag and free the camera whoever holds it.
    pub fn force_release(&self) -> ArbiterState {
        self.active.store(false, Ordering::SeqCst);
        self.arbiter.force_release()
    }
}

impl Drop for PreviewController {
    fn drop(&mut self) {
        let _ = self.toggle(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{EventLog, SimCameraFactory};
    use std::time::Instant;

    fn controller() -> (CameraArbiter, PreviewController) {
        let arbiter = CameraArbiter::new();
        let factory = Arc::new(SimCameraFactory::new(EventLog::new()));
        let preview = PreviewController::new(arbiter.clone(), factory);
        (arbiter, preview)
    }

    #[test]
    fn test_preview_holds_camera_and_publishes_jpeg() {
        let (arbiter, preview) = controller();
        assert_eq!(preview.toggle(true).unwrap(), PreviewOutcome::Started);
        assert_eq!(arbiter.state(), ArbiterState::HeldByStream);
        assert!(arbiter.try_acquire(Holder::Scan).is_err());

        let frame = preview.frames().recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(&frame[..2], &[0xFF, 0xD8]);

        assert_eq!(preview.toggle(false).unwrap(), PreviewOutcome::Stopped);
        assert!(!preview.is_active());
        assert!(arbiter.is_free());
    }

    #[test]
    fn test_preview_busy_while_scanning() {
        let (arbiter, preview) = controller();
        arbiter.try_acquire(Holder::Scan).unwrap();
        assert_eq!(preview.toggle(true).unwrap(), PreviewOutcome::Busy(ArbiterState::HeldByScan));
        assert!(!preview.is_active());
    }

    #[test]
    fn test_force_release_stops_preview() {
        let (arbiter, preview) = controller();
        preview.toggle(true).unwrap();
        assert_eq!(preview.force_release(), ArbiterState::HeldByStream);
        assert!(arbiter.is_free());

        // a scan can take the camera right away; the exiting preview must not free it
        arbiter.try_acquire(Holder::Scan).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while preview.worker.lock().unwrap().as_ref().is_some_and(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(arbiter.state(), ArbiterState::HeldByScan);
    }

    #[test]
    fn test_force_release_when_free_is_noop() {
        let (arbiter, preview) = controller();
        assert_eq!(preview.force_release(), ArbiterState::Free);
        assert!(arbiter.is_free());
        assert!(!preview.is_active());
    }
}
