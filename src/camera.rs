//! Camera driver
//!
//! The camera is owned through `rpicam-vid` subprocesses: a raw YUV420 stream
//! for single-frame capture and an H.264 recording for continuous capture.
//! Only one subprocess holds the sensor at a time.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// How long a recording gets to finalise its file after SIGINT.
const RECORDING_STOP_GRACE: Duration = Duration::from_secs(5);

/// Manual exposure / white-balance controls (auto algorithms disabled).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ManualControls {
    pub exposure_us: u32,
    pub analogue_gain: f64,
    /// (red, blue)
    pub colour_gains: (f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub controls: ManualControls,
}

/// One captured frame, packed RGB8.
#[derive(Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.rgb.len())
            .finish()
    }
}

impl Frame {
    pub fn new(width: u32, height: u32, rgb: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 3;
        if rgb.len() != expected {
            return Err(anyhow!("Frame {}x{} needs {} bytes, got {}", width, height, expected, rgb.len()));
        }
        Ok(Self { width, height, rgb })
    }

    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(&self.rgb, self.width, self.height, ExtendedColorType::Rgb8)
            .context("JPEG encoding failed")?;
        Ok(out)
    }
}

/// Raw recording written by the camera; the writer turns it into a container.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingHandle {
    pub raw_path: PathBuf,
    pub frame_rate: f64,
}

/// Hardware camera interface.
///
/// Callers must hold the camera arbiter before opening or driving a camera.
pub trait CameraDriver: Send {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Block until the next frame is available and return it.
    fn capture_frame(&mut self) -> Result<Frame>;
    fn start_recording(&mut self, path: &Path) -> Result<()>;
    fn stop_recording(&mut self) -> Result<RecordingHandle>;
    fn is_recording(&self) -> bool;
}

/// Opens the camera hardware; each path (preview, scan) opens its own driver.
pub trait CameraFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn CameraDriver>>;
}

/// Convert a planar I420 buffer (BT.601, limited range) to packed RGB8.
pub fn yuv420_to_rgb(width: u32, height: u32, yuv: &[u8]) -> Result<Vec<u8>> {
    let (w, h) = (width as usize, height as usize);
    let (cw, ch) = ((w + 1) / 2, (h + 1) / 2);
    let expected = i420_frame_len(width, height);
    if yuv.len() < expected {
        return Err(anyhow!("YUV420 buffer for {}x{} needs {} bytes, got {}", width, height, expected, yuv.len()));
    }
    let (y_plane, rest) = yuv.split_at(w * h);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let c = y_plane[row * w + col] as i32 - 16;
            let chroma = (row / 2) * cw + col / 2;
            let d = u_plane[chroma] as i32 - 128;
            let e = v_plane[chroma] as i32 - 128;
            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;
            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
    Ok(rgb)
}

pub fn i420_frame_len(width: u32, height: u32) -> usize {
    let (w, h) = (width as usize, height as usize);
    w * h + 2 * ((w + 1) / 2) * ((h + 1) / 2)
}

/// Forward a child's stderr to the log, errors at error level.
fn log_child_stderr(child: &mut Child, label: &'static str) {
    if let Some(stderr) = child.stderr.take() {
        thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(Result::ok) {
                if line.contains("ERROR") {
                    error!(target: "camera::stderr", "[{}] {}", label, line);
                } else {
                    debug!(target: "camera::stderr", "[{}] {}", label, line);
                }
            }
        });
    }
}

/// Camera driven through `rpicam-vid`.
pub struct RpicamCamera {
    command: String,
    bitrate: u32,
    settings: Option<CameraSettings>,
    started: bool,
    stream: Option<(Child, ChildStdout)>,
    recording: Option<(Child, RecordingHandle)>,
}

impl RpicamCamera {
    pub fn new(command: impl Into<String>, bitrate: u32) -> Self {
        Self {
            command: command.into(),
            bitrate,
            settings: None,
            started: false,
            stream: None,
            recording: None,
        }
    }

    fn settings(&self) -> Result<CameraSettings> {
        self.settings.ok_or_else(|| anyhow!("Camera not configured"))
    }

    /// Arguments shared by every launch: geometry, frame rate and manual controls.
    pub fn base_args(settings: &CameraSettings) -> Vec<String> {
        let c = &settings.controls;
        vec![
            "--nopreview".into(),
            "-t".into(), "0".into(),
            "--width".into(), settings.width.to_string(),
            "--height".into(), settings.height.to_string(),
            "--framerate".into(), format!("{}", settings.frame_rate),
            "--shutter".into(), c.exposure_us.to_string(),
            "--gain".into(), format!("{}", c.analogue_gain),
            "--awbgains".into(), format!("{},{}", c.colour_gains.0, c.colour_gains.1),
        ]
    }

    fn spawn_stream(&mut self) -> Result<()> {
        let settings = self.settings()?;
        let mut cmd = Command::new(&self.command);
        cmd.args(Self::base_args(&settings))
            .args(["--codec", "yuv420", "-o", "-"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()
            .with_context(|| format!("Failed to launch {}", self.command))?;
        info!(target: "camera", "Frame stream launched (PID: {})", child.id());
        log_child_stderr(&mut child, "stream");
        let stdout = child.stdout.take()
            .ok_or_else(|| anyhow!("Frame stream has no stdout"))?;
        self.stream = Some((child, stdout));
        Ok(())
    }

    fn stop_stream(&mut self) {
        if let Some((mut child, _)) = self.stream.take() {
            let _ = child.kill();
            let _ = child.wait();
            debug!(target: "camera", "Frame stream stopped");
        }
    }
}

impl CameraDriver for RpicamCamera {
    fn configure(&mut self, settings: &CameraSettings) -> Result<()> {
        if self.stream.is_some() || self.recording.is_some() {
            return Err(anyhow!("Cannot reconfigure while the camera is streaming or recording"));
        }
        info!(target: "camera", "Configured {}x{} @ {} fps, controls {:?}",
              settings.width, settings.height, settings.frame_rate, settings.controls);
        self.settings = Some(*settings);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.settings()?;
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if self.recording.is_some() {
            self.stop_recording()?;
        }
        self.stop_stream();
        self.started = false;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<Frame> {
        if !self.started {
            return Err(anyhow!("Camera not started"));
        }
        if self.recording.is_some() {
            return Err(anyhow!("Camera is recording"));
        }
        if self.stream.is_none() {
            self.spawn_stream()?;
        }
        let settings = self.settings()?;
        let mut buf = vec![0u8; i420_frame_len(settings.width, settings.height)];
        let read = match self.stream.as_mut() {
            Some((_, stdout)) => stdout.read_exact(&mut buf),
            None => return Err(anyhow!("Frame stream not running")),
        };
        if let Err(e) = read {
            self.stop_stream();
            return Err(anyhow!("Frame stream ended: {}", e));
        }
        let rgb = yuv420_to_rgb(settings.width, settings.height, &buf)?;
        Frame::new(settings.width, settings.height, rgb)
    }

    fn start_recording(&mut self, path: &Path) -> Result<()> {
        if !self.started {
            return Err(anyhow!("Camera not started"));
        }
        if self.recording.is_some() {
            return Err(anyhow!("Recording already active"));
        }
        self.stop_stream();
        let settings = self.settings()?;
        let mut cmd = Command::new(&self.command);
        cmd.args(Self::base_args(&settings))
            .args(["--codec", "h264", "-b", &self.bitrate.to_string(), "-o"])
            .arg(path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn()
            .with_context(|| format!("Failed to launch {} for recording", self.command))?;
        info!(target: "camera", "Recording {:?} (PID: {})", path, child.id());
        log_child_stderr(&mut child, "record");
        self.recording = Some((child, RecordingHandle {
            raw_path: path.to_path_buf(),
            frame_rate: settings.frame_rate,
        }));
        Ok(())
    }

    fn stop_recording(&mut self) -> Result<RecordingHandle> {
        let (mut child, handle) = self.recording.take()
            .ok_or_else(|| anyhow!("No recording active"))?;
        // SIGINT lets rpicam-vid flush and close the file.
        let pid = child.id() as libc::pid_t;
        // SAFETY: pid belongs to a child we spawned and have not reaped yet.
        unsafe {
            libc::kill(pid, libc::SIGINT);
        }
        let deadline = Instant::now() + RECORDING_STOP_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(target: "camera", "Recording process exited: {}", status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => {
                    warn!(target: "camera", "Recording did not stop after SIGINT, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    break;
                }
                Err(e) => {
                    error!(target: "camera", "Error checking recording status: {}", e);
                    break;
                }
            }
        }
        Ok(handle)
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }
}

impl Drop for RpicamCamera {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Opens `RpicamCamera` instances with the host's tool path and bitrate.
#[derive(Debug, Clone)]
pub struct RpicamFactory {
    pub command: String,
    pub bitrate: u32,
}

impl CameraFactory for RpicamFactory {
    fn open(&self) -> Result<Box<dyn CameraDriver>> {
        Ok(Box::new(RpicamCamera::new(self.command.clone(), self.bitrate)))
    }
}
