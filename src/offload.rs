//! Storage offloader
//!
//! Captured batches are handed to a dedicated writer thread through a
//! rendezvous channel: `submit` returns once the writer has taken the batch,
//! so the capture loop is never more than one batch ahead of the disk.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;

use crate::camera::{Frame, RecordingHandle};

pub const JPEG_QUALITY: u8 = 95;

/// What one grid point produced.
#[derive(Debug)]
pub enum BatchPayload {
    Frames(Vec<Frame>),
    Recording(RecordingHandle),
}

/// A captured batch and where it goes. Moved, never shared.
#[derive(Debug)]
pub struct FrameBatch {
    /// Output stem, e.g. `point_00_01`
    pub label: String,
    pub destination: PathBuf,
    pub payload: BatchPayload,
}

impl FrameBatch {
    pub fn item_count(&self) -> usize {
        match &self.payload {
            BatchPayload::Frames(frames) => frames.len(),
            BatchPayload::Recording(_) => 1,
        }
    }
}

/// Per-batch write result. A recording counts as one item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteReport {
    pub written: usize,
    pub failed: usize,
}

/// Persists batches. Item failures are reported, not returned as errors.
pub trait BatchSink: Send + Sync {
    fn write_batch(&self, batch: FrameBatch) -> WriteReport;
}

pub fn frame_file_name(index: usize) -> String {
    format!("frame_{:05}.jpg", index)
}

/// Writes frames as JPEG files and converts recordings to MP4 with ffmpeg.
#[derive(Debug, Clone)]
pub struct DiskSink {
    pub jpeg_quality: u8,
    pub ffmpeg_cmd: String,
}

impl Default for DiskSink {
    fn default() -> Self {
        Self { jpeg_quality: JPEG_QUALITY, ffmpeg_cmd: "ffmpeg".to_string() }
    }
}

impl DiskSink {
    pub fn new(ffmpeg_cmd: impl Into<String>) -> Self {
        Self { ffmpeg_cmd: ffmpeg_cmd.into(), ..Default::default() }
    }

    fn write_frame(&self, folder: &Path, index: usize, frame: &Frame) -> Result<()> {
        let path = folder.join(frame_file_name(index));
        let jpeg = frame.to_jpeg(self.jpeg_quality)?;
        fs::write(&path, jpeg).with_context(|| format!("Failed to write {:?}", path))
    }

    fn write_frames(&self, label: &str, folder: &Path, frames: Vec<Frame>) -> WriteReport {
        if let Err(e) = fs::create_dir_all(folder) {
            error!(target: "offload", "Cannot create {:?}: {}", folder, e);
            return WriteReport { written: 0, failed: frames.len() };
        }
        let failed = frames
            .par_iter()
            .enumerate()
            .filter(|(i, frame)| match self.write_frame(folder, *i, frame) {
                Ok(()) => false,
                Err(e) => {
                    error!(target: "offload", "{}: frame {} skipped: {:#}", label, i, e);
                    true
                }
            })
            .count();
        WriteReport { written: frames.len() - failed, failed }
    }

    /// Remux a raw H.264 file into `<folder>/<label>.mp4`; the raw file is
    /// removed only when the conversion succeeds.
    pub fn convert_recording(&self, label: &str, folder: &Path, recording: &RecordingHandle) -> Result<PathBuf> {
        fs::create_dir_all(folder)?;
        let output = folder.join(format!("{}.mp4", label));
        let status = Command::new(&self.ffmpeg_cmd)
            .args(["-loglevel", "error", "-framerate"])
            .arg(format!("{}", recording.frame_rate))
            .arg("-i")
            .arg(&recording.raw_path)
            .args(["-c", "copy", "-y"])
            .arg(&output)
            .status()
            .with_context(|| format!("Failed to launch {}", self.ffmpeg_cmd))?;
        if !status.success() {
            return Err(anyhow!("{} exited with {} for {:?}", self.ffmpeg_cmd, status, recording.raw_path));
        }
        if let Err(e) = fs::remove_file(&recording.raw_path) {
            warn!(target: "offload", "Could not remove {:?}: {}", recording.raw_path, e);
        }
        Ok(output)
    }
}

impl BatchSink for DiskSink {
    fn write_batch(&self, batch: FrameBatch) -> WriteReport {
        let FrameBatch { label, destination, payload } = batch;
        match payload {
            BatchPayload::Frames(frames) => self.write_frames(&label, &destination.join(&label), frames),
            BatchPayload::Recording(recording) => {
                match self.convert_recording(&label, &destination, &recording) {
                    Ok(path) => {
                        debug!(target: "offload", "{} -> {:?}", label, path);
                        WriteReport { written: 1, failed: 0 }
                    }
                    Err(e) => {
                        error!(target: "offload", "{}: conversion failed, raw kept at {:?}: {:#}",
                               label, recording.raw_path, e);
                        WriteReport { written: 0, failed: 1 }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OffloadStats {
    pub batches_written: usize,
    pub frames_written: usize,
    pub frames_failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained(OffloadStats),
    /// The writer was still busy when the wait ran out and has been detached.
    TimedOut(OffloadStats),
}

impl DrainOutcome {
    pub fn stats(&self) -> OffloadStats {
        match self {
            DrainOutcome::Drained(s) | DrainOutcome::TimedOut(s) => *s,
        }
    }
}

/// Single-slot asynchronous writer.
pub struct StorageOffloader {
    tx: Option<SyncSender<FrameBatch>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<OffloadStats>>,
    pending: Arc<AtomicUsize>,
    max_pending: Arc<AtomicUsize>,
}

impl StorageOffloader {
    pub fn spawn(sink: Arc<dyn BatchSink>) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<FrameBatch>(0);
        let (done_tx, done_rx) = mpsc::channel();
        let stats = Arc::new(Mutex::new(OffloadStats::default()));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker_stats = Arc::clone(&stats);
        let worker_pending = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("offload-writer".into())
            .spawn(move || {
                Self::writer_thread(sink, rx, worker_stats, worker_pending);
                let _ = done_tx.send(());
            })
            .context("Failed to spawn offload writer thread")?;

        Ok(Self {
            tx: Some(tx),
            done_rx,
            handle: Some(handle),
            stats,
            pending,
            max_pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn writer_thread(
        sink: Arc<dyn BatchSink>,
        rx: Receiver<FrameBatch>,
        stats: Arc<Mutex<OffloadStats>>,
        pending: Arc<AtomicUsize>,
    ) {
        info!(target: "offload", "Writer thread started");
        while let Ok(batch) = rx.recv() {
            pending.fetch_sub(1, Ordering::SeqCst);
            let label = batch.label.clone();
            let items = batch.item_count();
            debug!(target: "offload", "Writing {} ({} items)", label, items);
            let report = sink.write_batch(batch);
            let mut s = stats.lock().unwrap_or_else(|p| p.into_inner());
            s.batches_written += 1;
            s.frames_written += report.written;
            s.frames_failed += report.failed;
            info!(target: "offload", "✓ {} written ({} ok, {} failed)", label, report.written, report.failed);
        }
        let s = *stats.lock().unwrap_or_else(|p| p.into_inner());
        info!(target: "offload", "Writer thread stopped. Batches: {}, frames: {}, failed: {}",
              s.batches_written, s.frames_written, s.frames_failed);
    }

    /// Hand a batch to the writer, blocking while the previous batch is still
    /// being written.
    pub fn submit(&self, batch: FrameBatch) -> Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("Offloader already stopped"))?;
        let now = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_pending.fetch_max(now, Ordering::SeqCst);
        tx.send(batch).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            anyhow!("Offload writer is gone")
        })
    }

    /// Batches handed to `submit` that the writer has not picked up yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Highest `pending` value seen so far.
    pub fn max_pending(&self) -> usize {
        self.max_pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> OffloadStats {
        *self.stats.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Close the queue, let the writer finish its batch, and wait up to `timeout`.
    pub fn drain_and_stop(&mut self, timeout: Duration) -> DrainOutcome {
        drop(self.tx.take());
        let Some(handle) = self.handle.take() else {
            return DrainOutcome::Drained(self.stats());
        };
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    error!(target: "offload", "Writer thread panicked");
                }
                DrainOutcome::Drained(self.stats())
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(target: "offload", "Writer still busy after {:?}, detaching", timeout);
                DrainOutcome::TimedOut(self.stats())
            }
        }
    }
}

impl Drop for StorageOffloader {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.drain_and_stop(Duration::from_secs(0));
        }
    }
}
