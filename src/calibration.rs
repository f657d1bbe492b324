//! Camera calibration
//!
//! Calibration itself runs as an external command that lets the sensor's auto
//! algorithms settle and writes `calibration.json`. Scans read the latest
//! record and fall back to the configured manual controls without one.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::arbiter::{ArbiterLease, ArbiterState, CameraArbiter, Holder};
use crate::camera::ManualControls;

/// Settings measured by the calibration command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub exposure_us: f64,
    pub analogue_gain: f64,
    pub awb_red: f64,
    pub awb_blue: f64,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
}

impl CalibrationRecord {
    pub fn manual_controls(&self) -> ManualControls {
        ManualControls {
            exposure_us: self.exposure_us.round().clamp(0.0, u32::MAX as f64) as u32,
            analogue_gain: self.analogue_gain,
            colour_gains: (self.awb_red, self.awb_blue),
        }
    }

    pub fn recorded_at(&self) -> Option<DateTime<Utc>> {
        let secs = self.timestamp.trunc() as i64;
        let nanos = (self.timestamp.fract() * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos).single()
    }
}

/// Latest calibration, `None` when none has been written yet.
pub fn load_calibration(path: &Path) -> Result<Option<CalibrationRecord>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let record = serde_json::from_reader(file)
        .with_context(|| format!("Failed to parse calibration record {:?}", path))?;
    Ok(Some(record))
}

/// Controls for a scan: the calibration record if readable, else `fallback`.
pub fn controls_or(path: &Path, fallback: ManualControls) -> ManualControls {
    match load_calibration(path) {
        Ok(Some(record)) => {
            info!(target: "calibration", "Using calibration from {}",
                  record.recorded_at().map(|t| t.to_rfc3339()).unwrap_or_else(|| "unknown time".into()));
            record.manual_controls()
        }
        Ok(None) => {
            info!(target: "calibration", "No calibration found, using configured controls");
            fallback
        }
        Err(e) => {
            warn!(target: "calibration", "Ignoring unreadable calibration: {:#}", e);
            fallback
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Started { pid: u32 },
    /// Camera held by the preview, a scan, or a calibration run
    Busy(ArbiterState),
    AlreadyRunning,
}

/// Launches the external calibration command.
///
/// The camera stays held as `Holder::Calibration` until the command exits.
#[derive(Debug, Clone)]
pub struct Calibrator {
    command: Vec<String>,
    record_path: PathBuf,
    arbiter: CameraArbiter,
    running: Arc<AtomicBool>,
}

impl Calibrator {
    /// `command` runs in the directory containing `record_path`.
    pub fn new(command: Vec<String>, record_path: PathBuf, arbiter: CameraArbiter) -> Self {
        Self { command, record_path, arbiter, running: Arc::new(AtomicBool::new(false)) }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) -> Result<CalibrationOutcome> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(CalibrationOutcome::AlreadyRunning);
        }
        let lease = match self.arbiter.try_lease(Holder::Calibration) {
            Ok(lease) => lease,
            Err(state) => {
                self.running.store(false, Ordering::SeqCst);
                info!(target: "calibration", "Calibration refused, camera {}", state);
                return Ok(CalibrationOutcome::Busy(state));
            }
        };

        let spawned = self.spawn(lease);
        if spawned.is_err() {
            self.running.store(false, Ordering::SeqCst);
        }
        spawned
    }

    fn spawn(&self, lease: ArbiterLease) -> Result<CalibrationOutcome> {
        let (program, args) = self.command.split_first()
            .ok_or_else(|| anyhow!("Calibration command is empty"))?;
        let workdir = self.record_path.parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to launch calibration command '{}'", program))?;
        let pid = child.id();
        info!(target: "calibration", "Calibration started (PID: {})", pid);

        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    warn!(target: "calibration::stderr", "{}", line);
                }
            });
        }
        let stdout = child.stdout.take();
        let running = Arc::clone(&self.running);
        thread::Builder::new()
            .name("calibration-watch".into())
            .spawn(move || {
                if let Some(stdout) = stdout {
                    for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                        info!(target: "calibration", "{}", line);
                    }
                }
                match child.wait() {
                    Ok(status) if status.success() => info!(target: "calibration", "Calibration finished"),
                    Ok(status) => error!(target: "calibration", "Calibration failed: {}", status),
                    Err(e) => error!(target: "calibration", "Calibration wait failed: {}", e),
                }
                lease.release();
                running.store(false, Ordering::SeqCst);
            })
            .context("Failed to spawn calibration watcher")?;
        Ok(CalibrationOutcome::Started { pid })
    }

    pub fn status(&self) -> Result<Option<CalibrationRecord>> {
        load_calibration(&self.record_path)
    }
}
